// SPDX-FileCopyrightText: 2025 payload-dumper contributors
// SPDX-License-Identifier: GPL-3.0-only

include!(concat!(env!("OUT_DIR"), "/protobuf/mod.rs"));
