// SPDX-FileCopyrightText: 2025 payload-dumper contributors
// SPDX-License-Identifier: GPL-3.0-only

pub mod compression;
pub mod ota;
pub mod payload;
