//! Composable body I/O: the writer chain that ingests request bodies and
//! the reader chain that produces response bodies.
//!
//! Both contracts are small on purpose so that stages compose as
//! decorators: a gzip stage or a multipart stage wraps an inner instance of
//! the same trait and is inserted transparently by the connection.
//!
//! Writer side (inbound): `open` once, `write` zero or more non-empty
//! chunks, `close` exactly once. An error from any stage aborts the whole
//! chain; no further methods are called after a failure.
//!
//! Reader side (outbound): `open` once, `read` until an empty `Bytes`
//! signals end-of-body, `close` once when streaming ends or aborts.

use std::fs::File;
use std::io;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use bytes::{Bytes, BytesMut};

pub mod gzip;
pub mod multipart;

/// Chunk size used when streaming file-backed bodies, bounding memory use
/// regardless of file size.
pub const FILE_CHUNK_SIZE: usize = 32 * 1024;

/// Sink side of the body pipeline; the terminal implementation is the
/// request's own body storage.
pub trait BodyWriter: Send {
    fn open(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Receives one non-empty chunk of body data.
    fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Called exactly once after the last write; stages flush and finalize
    /// here.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<W: BodyWriter> BodyWriter for &mut W {
    fn open(&mut self) -> io::Result<()> {
        (**self).open()
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        (**self).write(data)
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

/// Source side of the body pipeline; an empty `Bytes` from `read` means
/// end-of-body.
pub trait BodyReader: Send {
    fn open(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn read(&mut self) -> io::Result<Bytes>;

    /// Idempotent cleanup, called once when streaming ends or aborts.
    fn close(&mut self) {}
}

/// Serves a single in-memory buffer and then reports end-of-body.
pub struct DataReader {
    data: Option<Bytes>,
}

impl DataReader {
    pub fn new(data: Bytes) -> Self {
        Self { data: Some(data) }
    }
}

impl BodyReader for DataReader {
    fn read(&mut self) -> io::Result<Bytes> {
        Ok(self.data.take().unwrap_or_else(Bytes::new))
    }
}

/// Streams a byte window of a file in [`FILE_CHUNK_SIZE`] chunks.
///
/// The `(offset, length)` window must already be clamped against the file
/// size; [`crate::response::Response::file_with_range`] fails construction
/// when the resolved window is empty.
pub struct FileReader {
    path: PathBuf,
    offset: u64,
    remaining: u64,
    file: Option<File>,
}

impl FileReader {
    pub fn new(path: PathBuf, offset: u64, length: u64) -> Self {
        Self { path, offset, remaining: length, file: None }
    }
}

impl BodyReader for FileReader {
    fn open(&mut self) -> io::Result<()> {
        let mut file = File::open(&self.path)?;
        if self.offset > 0 {
            file.seek(SeekFrom::Start(self.offset))?;
        }
        self.file = Some(file);
        Ok(())
    }

    fn read(&mut self) -> io::Result<Bytes> {
        if self.remaining == 0 {
            return Ok(Bytes::new());
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "file reader not opened"))?;

        let want = self.remaining.min(FILE_CHUNK_SIZE as u64) as usize;
        let mut buf = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "file truncated while streaming"));
            }
            filled += n;
        }
        self.remaining -= filled as u64;
        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }

    fn close(&mut self) {
        self.file.take();
    }
}

/// `io::Write` collector used by the flate2 stages: compressed or
/// decompressed output lands here and is drained chunk-wise.
pub(crate) struct Collector {
    buf: BytesMut,
}

impl Collector {
    pub(crate) fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    pub(crate) fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl io::Write for Collector {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn data_reader_serves_once() {
        let mut reader = DataReader::new(Bytes::from_static(b"abc"));
        reader.open().unwrap();
        assert_eq!(&reader.read().unwrap()[..], b"abc");
        assert!(reader.read().unwrap().is_empty());
        reader.close();
    }

    #[test]
    fn file_reader_respects_window() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let content: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
        file.write_all(&content).unwrap();

        let mut reader = FileReader::new(file.path().to_path_buf(), 100, 100);
        reader.open().unwrap();

        let mut served = Vec::new();
        loop {
            let chunk = reader.read().unwrap();
            if chunk.is_empty() {
                break;
            }
            served.extend_from_slice(&chunk);
        }
        reader.close();

        assert_eq!(served, &content[100..200]);
    }

    #[test]
    fn file_reader_chunks_large_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let content = vec![7u8; FILE_CHUNK_SIZE + 1234];
        file.write_all(&content).unwrap();

        let mut reader = FileReader::new(file.path().to_path_buf(), 0, content.len() as u64);
        reader.open().unwrap();

        let first = reader.read().unwrap();
        assert_eq!(first.len(), FILE_CHUNK_SIZE);
        let second = reader.read().unwrap();
        assert_eq!(second.len(), 1234);
        assert!(reader.read().unwrap().is_empty());
    }
}
