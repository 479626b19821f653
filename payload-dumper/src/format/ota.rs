// SPDX-FileCopyrightText: 2025 payload-dumper contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{io::BufReader, sync::Arc};

use thiserror::Error;
use tracing::debug;
use zip::{result::ZipError, CompressionMethod, ZipArchive};

use crate::source::{ArchiveMember, ReadAt, ReadAtReader};

/// Path of the payload entry within an OTA archive.
pub const PATH_PAYLOAD: &str = "payload.bin";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Archive entry not found: {PATH_PAYLOAD}")]
    EntryMissing,
    #[error("Archive entry {0} is compressed ({1:?}); only stored entries are supported")]
    UnsupportedCompression(String, CompressionMethod),
    #[error("Malformed archive")]
    Malformed(#[from] ZipError),
}

type Result<T> = std::result::Result<T, Error>;

/// Locate the stored payload entry inside an OTA archive and expose its
/// byte range as a random-access member of `source`.
///
/// The entry must be stored (compression method 0); that is what makes its
/// range inside the archive equal to its logical bytes and permits random
/// access without streaming the whole archive.
pub fn open_payload_entry(source: Arc<dyn ReadAt>) -> Result<ArchiveMember> {
    let reader = BufReader::with_capacity(64 * 1024, ReadAtReader::new(source.clone()));
    let mut archive = ZipArchive::new(reader)?;

    let entry = match archive.by_name(PATH_PAYLOAD) {
        Ok(e) => e,
        Err(ZipError::FileNotFound) => return Err(Error::EntryMissing),
        Err(e) => return Err(e.into()),
    };

    if entry.compression() != CompressionMethod::Stored {
        return Err(Error::UnsupportedCompression(
            PATH_PAYLOAD.to_owned(),
            entry.compression(),
        ));
    }

    let start = entry.data_start();
    let size = entry.size();

    debug!("Found {PATH_PAYLOAD} at {start}, {size} bytes");

    Ok(ArchiveMember::new(source, start, size))
}
