// SPDX-FileCopyrightText: 2025 payload-dumper contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{error, fmt::Write};

use quick_protobuf::{BytesReader, MessageRead, MessageWrite, Writer};

pub const ZEROS: [u8; 16384] = [0u8; 16384];

/// Decode a protobuf message from its bare (non-length-prefixed) encoding.
pub fn read_protobuf<'a, M: MessageRead<'a>>(data: &'a [u8]) -> quick_protobuf::Result<M> {
    let mut reader = BytesReader::from_bytes(data);
    M::from_reader(&mut reader, data)
}

/// Encode a protobuf message to its bare (non-length-prefixed) encoding.
pub fn write_protobuf<M: MessageWrite>(message: &M) -> quick_protobuf::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(message.get_size());
    let mut writer = Writer::new(&mut buf);
    message.write_message(&mut writer)?;
    Ok(buf)
}

/// Format a byte count as a human-readable size with two decimal places.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    let mut size = bytes as f64;
    let mut unit = 0;

    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    format!("{size:.2} {}", UNITS[unit])
}

/// Render an error and its chain of sources as a single `: `-separated line.
pub fn error_chain(error: &dyn error::Error) -> String {
    let mut result = error.to_string();
    let mut source = error.source();

    while let Some(e) = source {
        write!(result, ": {e}").expect("Failed to allocate");
        source = e.source();
    }

    result
}
