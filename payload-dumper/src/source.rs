// SPDX-FileCopyrightText: 2025 payload-dumper contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use attohttpc::StatusCode;
use num_traits::ToPrimitive;
use thiserror::Error;
use tracing::debug;

/// Default User-Agent for HTTP sources.
pub const DEFAULT_USER_AGENT: &str =
    concat!("payload-dumper/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP transport error for {url}")]
    Transport {
        url: String,
        #[source]
        source: Box<attohttpc::Error>,
    },
    #[error("HTTP status {status} for ranged request to {url}")]
    UnexpectedStatus { url: String, status: u16 },
    #[error("Origin does not serve byte ranges: {0}")]
    RangesUnsupported(String),
    #[error("Missing or invalid Content-Length for {0}")]
    InvalidContentLength(String),
    #[error("Short read at offset {offset}: expected {expected} bytes, but got {actual}")]
    ShortRead {
        offset: u64,
        expected: usize,
        actual: usize,
    },
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Random access over a byte source. Implementations are safe to share
/// across threads; the HTTP backend serializes its requests internally.
pub trait ReadAt: Send + Sync {
    /// Read up to `buf.len()` bytes starting at `offset`. A short count is
    /// returned only at end of source. Reads at or past `size()` return 0.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Total addressable length in bytes.
    fn size(&self) -> u64;

    /// Read exactly `buf.len()` bytes starting at `offset`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;

        while filled < buf.len() {
            let n = self.read_at(offset + filled as u64, &mut buf[filled..])?;
            if n == 0 {
                return Err(Error::ShortRead {
                    offset,
                    expected: buf.len(),
                    actual: filled,
                });
            }

            filled += n;
        }

        Ok(())
    }
}

/// Returns true if the input reference is an HTTP(S) URL rather than a path.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// A local file backend. Reads are positional and never touch the kernel
/// file offset, so concurrent calls need no external locking.
#[derive(Debug)]
pub struct FileSource {
    file: File,
    size: u64,
}

impl FileSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();

        Ok(Self { file, size })
    }

    /// Read data at the offset. The kernel's file position will *not* be
    /// changed.
    #[cfg(unix)]
    fn pread(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        self.file.read_at(buf, offset)
    }

    /// Read data at the offset. The kernel's file position *will* be
    /// changed, but nothing else relies on it.
    #[cfg(windows)]
    fn pread(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        use std::os::windows::fs::FileExt;
        self.file.seek_read(buf, offset)
    }
}

impl ReadAt for FileSource {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.size {
            return Ok(0);
        }

        Ok(self.pread(offset, buf)?)
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// A view of a byte range inside another backend, used for stored archive
/// entries. Offsets are rewritten into the absolute range of the entry.
pub struct ArchiveMember {
    inner: Arc<dyn ReadAt>,
    start: u64,
    size: u64,
}

impl std::fmt::Debug for ArchiveMember {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveMember")
            .field("start", &self.start)
            .field("size", &self.size)
            .finish()
    }
}

impl ArchiveMember {
    pub fn new(inner: Arc<dyn ReadAt>, start: u64, size: u64) -> Self {
        Self { inner, start, size }
    }
}

impl ReadAt for ArchiveMember {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.size {
            return Ok(0);
        }

        let to_read = (self.size - offset).min(buf.len() as u64) as usize;

        self.inner.read_at(self.start + offset, &mut buf[..to_read])
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// Connection parameters for HTTP sources.
#[derive(Clone, Debug)]
pub struct HttpOptions {
    pub user_agent: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub max_redirections: u32,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(600),
            max_redirections: 10,
        }
    }
}

/// A byte-range-addressable HTTP(S) resource. Every `read_at` call issues
/// one ranged GET. A single instance holds at most one in-flight request;
/// concurrent callers are serialized on an internal mutex.
pub struct HttpSource {
    url: String,
    options: HttpOptions,
    size: u64,
    bytes_downloaded: AtomicU64,
    request_lock: Mutex<()>,
}

impl HttpSource {
    /// Probe the URL with a HEAD request to learn the content length, then
    /// confirm that the origin honors `Range` with a one-byte ranged GET.
    pub fn open(url: &str, options: HttpOptions) -> Result<Self> {
        let response = attohttpc::head(url)
            .connect_timeout(options.connect_timeout)
            .read_timeout(options.read_timeout)
            .max_redirections(options.max_redirections)
            .header("Accept", "*/*")
            .header("User-Agent", options.user_agent.as_str())
            .send()
            .map_err(|e| Error::Transport {
                url: url.to_owned(),
                source: Box::new(e),
            })?;

        if !response.is_success() {
            return Err(Error::UnexpectedStatus {
                url: url.to_owned(),
                status: response.status().as_u16(),
            });
        }

        let size = response
            .headers()
            .get("Content-Length")
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.parse().ok())
            .ok_or_else(|| Error::InvalidContentLength(url.to_owned()))?;

        debug!("Opened {url}: {size} bytes");

        let source = Self {
            url: url.to_owned(),
            options,
            size,
            bytes_downloaded: AtomicU64::new(0),
            request_lock: Mutex::new(()),
        };

        if size > 0 {
            let response = source.ranged_get(0, 0)?;
            let status = response.status();
            let body_len = response
                .headers()
                .get("Content-Length")
                .and_then(|h| h.to_str().ok())
                .and_then(|h| h.parse::<u64>().ok());

            // A 200 is acceptable only if it covers exactly the probed byte.
            if status != StatusCode::PARTIAL_CONTENT
                && !(status == StatusCode::OK && body_len == Some(1))
            {
                return Err(Error::RangesUnsupported(source.url));
            }
        }

        Ok(source)
    }

    /// Total number of payload bytes fetched over ranged requests so far.
    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded.load(Ordering::Relaxed)
    }

    fn ranged_get(&self, start: u64, end: u64) -> Result<attohttpc::Response> {
        let range = format!("bytes={start}-{end}");

        attohttpc::get(&self.url)
            .connect_timeout(self.options.connect_timeout)
            .read_timeout(self.options.read_timeout)
            .max_redirections(self.options.max_redirections)
            .header("Accept", "*/*")
            .header("Accept-Encoding", "identity")
            .header("User-Agent", self.options.user_agent.as_str())
            .header("Range", range.as_str())
            .send()
            .map_err(|e| Error::Transport {
                url: self.url.clone(),
                source: Box::new(e),
            })
    }
}

impl ReadAt for HttpSource {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.size {
            return Ok(0);
        }

        let to_read = (self.size - offset).min(buf.len() as u64) as usize;
        if to_read == 0 {
            return Ok(0);
        }

        let end = offset + to_read as u64 - 1;

        let _guard = self.request_lock.lock().unwrap();

        let response = self.ranged_get(offset, end)?;
        let (status, _, mut reader) = response.split();

        // The range must start where we asked. A 200 serves the whole
        // resource, which only lines up when reading from the beginning.
        if status != StatusCode::PARTIAL_CONTENT
            && !(status == StatusCode::OK && offset == 0)
        {
            return Err(Error::UnexpectedStatus {
                url: self.url.clone(),
                status: status.as_u16(),
            });
        }

        let mut filled = 0;

        while filled < to_read {
            let n = reader.read(&mut buf[filled..to_read])?;
            if n == 0 {
                break;
            }

            filled += n;
        }

        self.bytes_downloaded
            .fetch_add(filled as u64, Ordering::Relaxed);

        if filled < to_read {
            return Err(Error::ShortRead {
                offset,
                expected: to_read,
                actual: filled,
            });
        }

        Ok(filled)
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// Adapts a shared backend into a sequential `Read + Seek` view with its
/// own cursor. Used to hand backends to parsers that expect readers.
pub struct ReadAtReader {
    inner: Arc<dyn ReadAt>,
    pos: u64,
}

impl ReadAtReader {
    pub fn new(inner: Arc<dyn ReadAt>) -> Self {
        Self { inner, pos: 0 }
    }
}

impl Read for ReadAtReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self
            .inner
            .read_at(self.pos, buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        self.pos += n as u64;

        Ok(n)
    }
}

impl Seek for ReadAtReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = match pos {
            SeekFrom::Start(o) => o,
            SeekFrom::End(o) => self
                .inner
                .size()
                .to_i64()
                .and_then(|s| s.checked_add(o))
                .and_then(|s| s.to_u64())
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "Offset would be before the start of the source",
                    )
                })?,
            SeekFrom::Current(o) => self
                .pos
                .to_i64()
                .and_then(|s| s.checked_add(o))
                .and_then(|s| s.to_u64())
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "Offset would be before the start of the source",
                    )
                })?,
        };

        Ok(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Seek, SeekFrom, Write},
        sync::Arc,
    };

    use super::{ArchiveMember, Error, FileSource, ReadAt, ReadAtReader};

    fn temp_source(data: &[u8]) -> (tempfile::NamedTempFile, FileSource) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(data).unwrap();
        file.flush().unwrap();

        let source = FileSource::open(file.path()).unwrap();
        (file, source)
    }

    #[test]
    fn file_source() {
        let (_file, source) = temp_source(b"foobar");
        assert_eq!(source.size(), 6);

        let mut buf = [0u8; 3];
        source.read_exact_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"foo");
        source.read_exact_at(3, &mut buf).unwrap();
        assert_eq!(&buf, b"bar");

        // Reads at EOF yield zero bytes, not an error.
        assert_eq!(source.read_at(6, &mut buf).unwrap(), 0);
        assert_eq!(source.read_at(100, &mut buf).unwrap(), 0);

        let mut buf = [0u8; 4];
        let err = source.read_exact_at(4, &mut buf).unwrap_err();
        assert!(matches!(
            err,
            Error::ShortRead {
                offset: 4,
                expected: 4,
                actual: 2,
            },
        ));
    }

    #[test]
    fn archive_member() {
        let (_file, source) = temp_source(b"fooinnerbar");
        let member = ArchiveMember::new(Arc::new(source), 3, 5);
        assert_eq!(member.size(), 5);

        let mut buf = [0u8; 5];
        member.read_exact_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"inner");

        // Clamped at the end of the member, not the outer source.
        let n = member.read_at(4, &mut buf).unwrap();
        assert_eq!(n, 1);
        assert_eq!(&buf[..1], b"r");
        assert_eq!(member.read_at(5, &mut buf).unwrap(), 0);
    }

    #[test]
    fn read_at_reader() {
        let (_file, source) = temp_source(b"fooinnerbar");
        let mut reader = ReadAtReader::new(Arc::new(source));

        let mut buf = [0u8; 3];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"foo");

        reader.seek(SeekFrom::End(-3)).unwrap();
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"bar");

        reader.seek(SeekFrom::Current(-5)).unwrap();
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"erb");

        assert!(reader.seek(SeekFrom::Current(-100)).is_err());
    }

    #[test]
    fn url_detection() {
        assert!(super::is_url("http://example.com/ota.zip"));
        assert!(super::is_url("https://example.com/ota.zip"));
        assert!(!super::is_url("payload.bin"));
        assert!(!super::is_url("/tmp/ota.zip"));
        assert!(!super::is_url("ftp://example.com/ota.zip"));
    }
}
