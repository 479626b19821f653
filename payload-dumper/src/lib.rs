// SPDX-FileCopyrightText: 2025 payload-dumper contributors
// SPDX-License-Identifier: GPL-3.0-only

//! payload-dumper is primarily an application and not a library. The CLI
//! source files use concrete types wherever possible for simplicity, while
//! the "library"-style source files aim to be generic.

// We use pb-rs' nostd mode. See build.rs.
extern crate alloc;

pub mod cli;
pub mod format;
pub mod progress;
pub mod protobuf;
pub mod source;
pub mod util;
