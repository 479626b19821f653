// SPDX-FileCopyrightText: 2025 payload-dumper contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::{BTreeSet, VecDeque},
    fs::{self, File},
    io::{self, BufWriter, Cursor, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
    thread,
};

use byteorder::{BigEndian, ReadBytesExt};
use num_traits::ToPrimitive;
use ring::digest::Context;
use thiserror::Error;
use tracing::debug;

use crate::{
    format::compression,
    progress::Progress,
    protobuf::chromeos_update_engine::{
        mod_InstallOperation, DeltaArchiveManifest, Extent, InstallOperation, PartitionUpdate,
        Signatures,
    },
    source::{self, ReadAt},
    util,
};

pub const PAYLOAD_MAGIC: &[u8; 4] = b"CrAU";
pub const PAYLOAD_MAJOR_VERSION: u64 = 2;
pub const BLOCK_SIZE: u32 = 4096;

const HEADER_SIZE: usize = PAYLOAD_MAGIC.len() + 8 + 8 + 4;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown magic: {0:?}")]
    InvalidMagic([u8; 4]),
    #[error("Unsupported payload version: {0}")]
    UnsupportedVersion(u64),
    #[error("Payload header is truncated")]
    TruncatedHeader,
    #[error("Unexpected block size: {0}")]
    UnexpectedBlockSize(u32),
    #[error("{0:?} field is missing")]
    MissingField(&'static str),
    #[error("{0:?} field exceeds integer bounds")]
    IntegerTooLarge(&'static str),
    #[error("Unsupported partition operation: {0:?}")]
    UnsupportedOperation(mod_InstallOperation::Type),
    #[error("Operation produced {0} bytes, but destination extents cover {1}")]
    SizeMismatch(u64, u64),
    #[error("Expected sha256 {0}, but have {1}")]
    MismatchedDigest(String, String),
    #[error("Partitions not found in payload: {0:?}")]
    MissingPartitions(BTreeSet<String>),
    #[error("No partitions selected for extraction")]
    NoPartitionsSelected,
    #[error("Failed to create output: {path:?}")]
    OutputCreate {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Protobuf error")]
    Protobuf(#[from] quick_protobuf::Error),
    #[error("Decompression failed")]
    Decompress(#[from] compression::Error),
    #[error("Source error")]
    Source(#[from] source::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// A parsed payload: the decoded manifest plus the absolute offset of the
/// data section that all operation offsets are relative to.
#[derive(Clone, Debug)]
pub struct Payload {
    pub version: u64,
    pub manifest: DeltaArchiveManifest,
    /// Decoded but unverified; see the payload format notes.
    pub metadata_signatures: Option<Signatures>,
    pub data_offset: u64,
}

impl Payload {
    /// Parse the framed header, the manifest, and the optional metadata
    /// signature block from the start of `source`.
    pub fn parse(source: &dyn ReadAt) -> Result<Self> {
        let mut header = [0u8; HEADER_SIZE];
        source.read_exact_at(0, &mut header).map_err(|e| match e {
            source::Error::ShortRead { .. } => Error::TruncatedHeader,
            e => e.into(),
        })?;

        let mut cursor = Cursor::new(&header[..]);

        let mut magic = [0u8; 4];
        cursor.read_exact(&mut magic)?;
        if magic != *PAYLOAD_MAGIC {
            return Err(Error::InvalidMagic(magic));
        }

        let version = cursor.read_u64::<BigEndian>()?;
        if version != PAYLOAD_MAJOR_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        let manifest_len = cursor
            .read_u64::<BigEndian>()?
            .to_usize()
            .ok_or(Error::IntegerTooLarge("manifest_len"))?;
        let metadata_signature_len = cursor.read_u32::<BigEndian>()?;

        let mut manifest_raw = vec![0u8; manifest_len];
        source.read_exact_at(HEADER_SIZE as u64, &mut manifest_raw)?;
        let manifest: DeltaArchiveManifest = util::read_protobuf(&manifest_raw)?;

        if manifest.block_size != BLOCK_SIZE {
            return Err(Error::UnexpectedBlockSize(manifest.block_size));
        }

        let metadata_size = HEADER_SIZE as u64 + manifest_len as u64;

        let metadata_signatures = if metadata_signature_len > 0 {
            let mut raw = vec![0u8; metadata_signature_len as usize];
            source.read_exact_at(metadata_size, &mut raw)?;
            Some(util::read_protobuf::<Signatures>(&raw)?)
        } else {
            None
        };

        let data_offset = metadata_size + u64::from(metadata_signature_len);

        debug!(
            "Parsed payload: {} partitions, data section at {data_offset}",
            manifest.partitions.len(),
        );

        Ok(Self {
            version,
            manifest,
            metadata_signatures,
            data_offset,
        })
    }

    pub fn is_full_ota(&self) -> bool {
        self.manifest
            .partitions
            .iter()
            .all(|p| p.old_partition_info.is_none())
    }
}

/// Convert an extent into its byte offset and length on the destination.
fn extent_bytes(extent: &Extent) -> Result<(u64, u64)> {
    let start_block = extent
        .start_block
        .ok_or(Error::MissingField("start_block"))?;
    let num_blocks = extent.num_blocks.ok_or(Error::MissingField("num_blocks"))?;

    let offset = start_block
        .checked_mul(BLOCK_SIZE.into())
        .ok_or(Error::IntegerTooLarge("start_block"))?;
    let length = num_blocks
        .checked_mul(BLOCK_SIZE.into())
        .ok_or(Error::IntegerTooLarge("num_blocks"))?;

    Ok((offset, length))
}

/// Apply a single install operation: read its blob from the payload data
/// section, verify the blob digest, decompress, and place the result on the
/// destination extents.
pub fn apply_operation(
    source: &dyn ReadAt,
    data_offset: u64,
    op: &InstallOperation,
    mut writer: impl Write + Seek,
    verify: bool,
) -> Result<()> {
    if op.dst_extents.is_empty() {
        return Err(Error::MissingField("dst_extents"));
    }

    if op.type_pb == mod_InstallOperation::Type::ZERO {
        // ZERO carries no blob and nothing to hash; the destination is
        // filled in place.
        for extent in &op.dst_extents {
            let (offset, length) = extent_bytes(extent)?;

            writer.seek(SeekFrom::Start(offset))?;

            let mut remaining = length;
            while remaining > 0 {
                let n = remaining.min(util::ZEROS.len() as u64) as usize;
                writer.write_all(&util::ZEROS[..n])?;
                remaining -= n as u64;
            }
        }

        return Ok(());
    }

    let mut expected: u64 = 0;
    for extent in &op.dst_extents {
        let (_, length) = extent_bytes(extent)?;
        expected = expected
            .checked_add(length)
            .ok_or(Error::IntegerTooLarge("dst_extents"))?;
    }
    let expected_usize = expected
        .to_usize()
        .ok_or(Error::IntegerTooLarge("dst_extents"))?;

    let blob_offset = op.data_offset.ok_or(Error::MissingField("data_offset"))?;
    let blob_length = op.data_length.ok_or(Error::MissingField("data_length"))?;
    let absolute = data_offset
        .checked_add(blob_offset)
        .ok_or(Error::IntegerTooLarge("data_offset"))?;

    let mut data = vec![
        0u8;
        blob_length
            .to_usize()
            .ok_or(Error::IntegerTooLarge("data_length"))?
    ];
    source.read_exact_at(absolute, &mut data)?;

    // The digest covers the blob as stored in the payload, not the
    // decompressed output. This is the container's contract.
    let digest = if verify {
        let mut context = Context::new(&ring::digest::SHA256);
        context.update(&data);
        Some(context.finish())
    } else {
        None
    };

    let out = match op.type_pb {
        mod_InstallOperation::Type::REPLACE => data,
        mod_InstallOperation::Type::REPLACE_XZ => {
            compression::decompress_xz(&data, expected_usize)?
        }
        mod_InstallOperation::Type::REPLACE_BZ => {
            compression::decompress_bz2(&data, expected_usize)?
        }
        mod_InstallOperation::Type::ZSTD => compression::decompress_zstd(&data, expected_usize)?,
        other => return Err(Error::UnsupportedOperation(other)),
    };

    if out.len() as u64 != expected {
        return Err(Error::SizeMismatch(out.len() as u64, expected));
    }

    if let (Some(digest), Some(expected_digest)) = (digest, op.data_sha256_hash.as_deref()) {
        if !expected_digest.is_empty() && digest.as_ref() != expected_digest {
            return Err(Error::MismatchedDigest(
                hex::encode(expected_digest),
                hex::encode(digest),
            ));
        }
    }

    // The decompressed bytes are split across the destination extents in
    // order. Payloads in the wild use a single extent per operation, but
    // nothing in the format requires that.
    let mut remaining = out.as_slice();
    for extent in &op.dst_extents {
        let (offset, length) = extent_bytes(extent)?;
        let length = length
            .to_usize()
            .ok_or(Error::IntegerTooLarge("num_blocks"))?;

        writer.seek(SeekFrom::Start(offset))?;
        writer.write_all(&remaining[..length])?;
        remaining = &remaining[length..];
    }

    Ok(())
}

/// Extraction parameters.
#[derive(Clone, Debug)]
pub struct ExtractOptions {
    /// Number of worker threads. Partitions are distributed across workers;
    /// operations within a partition always run serially.
    pub concurrency: usize,
    /// Verify per-operation SHA-256 digests when present.
    pub verify: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            concurrency: thread::available_parallelism().map_or(4, |n| n.get()),
            verify: true,
        }
    }
}

fn extract_partition(
    source: &dyn ReadAt,
    data_offset: u64,
    partition: &PartitionUpdate,
    path: &Path,
    options: &ExtractOptions,
    progress: &dyn Progress,
) -> Result<()> {
    let name = partition.partition_name.as_str();
    let total = partition.operations.len();

    let file = File::create(path).map_err(|e| Error::OutputCreate {
        path: path.to_owned(),
        source: e,
    })?;
    let mut writer = BufWriter::new(file);

    progress.update(name, 0, total);

    // Coalesce notifications to roughly 5% steps.
    let step = (total / 20).max(1);

    for (i, op) in partition.operations.iter().enumerate() {
        apply_operation(source, data_offset, op, &mut writer, options.verify)?;

        let completed = i + 1;
        if completed == total || completed % step == 0 {
            progress.update(name, completed, total);
        }
    }

    writer.flush()?;

    Ok(())
}

/// Extract the selected partitions (all of them when `partition_names` is
/// empty) into `directory`, one `<name>.img` file per partition.
///
/// Partitions are handed out to worker threads from a shared queue. A
/// failing partition sets a shared error flag but does not stop the other
/// workers; the first error is returned after all workers have finished.
pub fn extract_partitions(
    source: &dyn ReadAt,
    payload: &Payload,
    directory: &Path,
    partition_names: &[String],
    options: &ExtractOptions,
    progress: &dyn Progress,
) -> Result<()> {
    let selected = if partition_names.is_empty() {
        payload.manifest.partitions.iter().collect::<Vec<_>>()
    } else {
        let mut remaining = partition_names
            .iter()
            .map(|n| n.as_str())
            .collect::<BTreeSet<_>>();
        let selected = payload
            .manifest
            .partitions
            .iter()
            .filter(|p| remaining.remove(p.partition_name.as_str()))
            .collect::<Vec<_>>();

        if !remaining.is_empty() {
            let remaining = remaining.iter().map(|&n| n.to_owned()).collect();
            return Err(Error::MissingPartitions(remaining));
        }

        selected
    };

    if selected.is_empty() {
        return Err(Error::NoPartitionsSelected);
    }

    fs::create_dir_all(directory).map_err(|e| Error::OutputCreate {
        path: directory.to_owned(),
        source: e,
    })?;

    let names = selected
        .iter()
        .map(|p| p.partition_name.clone())
        .collect::<Vec<_>>();
    let op_counts = selected.iter().map(|p| p.operations.len()).collect::<Vec<_>>();
    progress.init(&names, &op_counts);

    let queue = Mutex::new(selected.into_iter().collect::<VecDeque<_>>());
    let failed = AtomicBool::new(false);
    let first_error = Mutex::new(None::<Error>);
    let workers = options.concurrency.max(1);

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let partition = queue.lock().unwrap().pop_front();
                let Some(partition) = partition else { break };

                let name = partition.partition_name.as_str();
                let path = directory.join(format!("{name}.img"));

                if let Err(e) = extract_partition(
                    source,
                    payload.data_offset,
                    partition,
                    &path,
                    options,
                    progress,
                ) {
                    // Record the failure, but keep draining the queue so the
                    // remaining partitions still extract.
                    progress.error(&format!(
                        "Failed to extract {name}: {}",
                        util::error_chain(&e),
                    ));
                    failed.store(true, Ordering::SeqCst);

                    let mut slot = first_error.lock().unwrap();
                    if slot.is_none() {
                        *slot = Some(e);
                    }
                }
            });
        }
    });

    progress.finish();

    if failed.load(Ordering::SeqCst) {
        let e = first_error
            .into_inner()
            .unwrap()
            .expect("Error flag set without an error");
        return Err(e);
    }

    Ok(())
}
