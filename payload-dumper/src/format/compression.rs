// SPDX-FileCopyrightText: 2025 payload-dumper contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::io::{self, Read};

use bzip2::read::BzDecoder;
use thiserror::Error;
use xz2::stream::{Action, Status, Stream};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to initialize XZ decoder")]
    XzInit(#[source] xz2::stream::Error),
    #[error("XZ stream error")]
    XzStream(#[from] xz2::stream::Error),
    #[error("XZ stream ended before the end of stream marker")]
    XzTruncated,
    #[error("XZ stream has {0} trailing bytes")]
    XzTrailingData(usize),
    #[error("BZ2 stream error")]
    Bz2(#[source] io::Error),
    #[error("Zstandard frame error")]
    Zstd(#[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Decompress a whole XZ stream. `expected` is the exact decompressed size
/// declared by the caller; streams that decode to more than that fail.
pub fn decompress_xz(data: &[u8], expected: usize) -> Result<Vec<u8>> {
    let mut stream = Stream::new_stream_decoder(u64::MAX, 0).map_err(Error::XzInit)?;
    let mut out = vec![0u8; expected];

    loop {
        let consumed = stream.total_in() as usize;
        let produced = stream.total_out() as usize;

        let status = stream.process(&data[consumed..], &mut out[produced..], Action::Finish)?;

        match status {
            Status::StreamEnd => break,
            _ => {
                // No forward progress means the input is truncated or the
                // output buffer is exhausted.
                if stream.total_in() as usize == consumed
                    && stream.total_out() as usize == produced
                {
                    return Err(Error::XzTruncated);
                }
            }
        }
    }

    let consumed = stream.total_in() as usize;
    if consumed != data.len() {
        return Err(Error::XzTrailingData(data.len() - consumed));
    }

    out.truncate(stream.total_out() as usize);

    Ok(out)
}

/// Decompress a whole BZ2 stream into a buffer preallocated for `expected`
/// bytes.
pub fn decompress_bz2(data: &[u8], expected: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(expected);

    BzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(Error::Bz2)?;

    Ok(out)
}

/// Decompress a single Zstandard frame. The frame's content size must not
/// exceed `expected`.
pub fn decompress_zstd(data: &[u8], expected: usize) -> Result<Vec<u8>> {
    zstd::bulk::decompress(data, expected).map_err(Error::Zstd)
}
