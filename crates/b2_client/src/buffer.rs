//! Chunk buffers: the staging area between `Writer::write` and an upload
//! worker.
//!
//! A buffer must be rewindable. When a worker loses its upload endpoint it
//! acquires a fresh one and re-streams the same bytes, so the payload handle
//! has to survive any number of read passes.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use bytes::Bytes;
use sha1::{Digest, Sha1};
use tokio_util::io::ReaderStream;

/// One in-flight chunk's worth of bytes.
pub(crate) trait WriteBuffer: Send {
    fn write(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Bytes written so far.
    fn len(&self) -> u64;

    /// Lowercase hex SHA-1 of everything written so far.
    fn sha1_hex(&self) -> String;

    /// A rewindable handle over all written bytes.
    fn payload(&self) -> io::Result<ChunkSource>;
}

/// A rewindable chunk payload, cheap to clone.
///
/// Each call to [`ChunkSource::to_body`] yields a fresh stream over the same
/// bytes, starting at offset zero.
#[derive(Clone)]
pub(crate) enum ChunkSource {
    Memory(Bytes),
    File { file: Arc<std::fs::File>, len: u64 },
}

impl ChunkSource {
    pub(crate) fn len(&self) -> u64 {
        match self {
            ChunkSource::Memory(b) => b.len() as u64,
            ChunkSource::File { len, .. } => *len,
        }
    }

    /// A fresh request body over the full payload.
    pub(crate) fn to_body(&self) -> io::Result<reqwest::Body> {
        match self {
            ChunkSource::Memory(b) => Ok(reqwest::Body::from(b.clone())),
            ChunkSource::File { file, .. } => {
                let mut f = file.try_clone()?;
                f.seek(SeekFrom::Start(0))?;
                let stream = ReaderStream::new(tokio::fs::File::from_std(f));
                Ok(reqwest::Body::wrap_stream(stream))
            }
        }
    }

    /// Reads the whole payload into memory. Test backends use this in place
    /// of streaming.
    pub(crate) fn read_bytes(&self) -> io::Result<Bytes> {
        match self {
            ChunkSource::Memory(b) => Ok(b.clone()),
            ChunkSource::File { file, len } => {
                let mut f = file.try_clone()?;
                f.seek(SeekFrom::Start(0))?;
                let mut buf = Vec::with_capacity(*len as usize);
                f.read_to_end(&mut buf)?;
                Ok(buf.into())
            }
        }
    }
}

/// Growable in-memory buffer with a streaming SHA-1.
pub(crate) struct MemoryBuffer {
    buf: Vec<u8>,
    hasher: Sha1,
}

impl MemoryBuffer {
    pub(crate) fn new() -> Self {
        Self {
            buf: Vec::new(),
            hasher: Sha1::new(),
        }
    }
}

impl WriteBuffer for MemoryBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.hasher.update(buf);
        self.buf.extend_from_slice(buf);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.buf.len() as u64
    }

    fn sha1_hex(&self) -> String {
        hex::encode(self.hasher.clone().finalize())
    }

    fn payload(&self) -> io::Result<ChunkSource> {
        Ok(ChunkSource::Memory(Bytes::from(self.buf.clone())))
    }
}

/// Buffer backed by an anonymous temporary file, for callers that trade RSS
/// for disk.
///
/// `tempfile::tempfile` unlinks the file at creation, so the bytes disappear
/// when the last handle drops no matter how the process exits.
pub(crate) struct FileBuffer {
    file: Arc<std::fs::File>,
    len: u64,
    hasher: Sha1,
}

impl FileBuffer {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            file: Arc::new(tempfile::tempfile()?),
            len: 0,
            hasher: Sha1::new(),
        })
    }
}

impl WriteBuffer for FileBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        (&*self.file).write_all(buf)?;
        self.hasher.update(buf);
        self.len += buf.len() as u64;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn sha1_hex(&self) -> String {
        hex::encode(self.hasher.clone().finalize())
    }

    fn payload(&self) -> io::Result<ChunkSource> {
        Ok(ChunkSource::File {
            file: self.file.clone(),
            len: self.len,
        })
    }
}

/// Hex SHA-1 of a byte slice.
pub(crate) fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    // echo -n "hello world" | sha1sum
    const HELLO_SHA1: &str = "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed";

    #[test]
    fn memory_buffer_tracks_len_and_digest() {
        let mut buf = MemoryBuffer::new();
        buf.write(b"hello ").unwrap();
        buf.write(b"world").unwrap();
        assert_eq!(buf.len(), 11);
        assert_eq!(buf.sha1_hex(), HELLO_SHA1);
        // The digest is non-destructive.
        assert_eq!(buf.sha1_hex(), HELLO_SHA1);
    }

    #[test]
    fn file_buffer_tracks_len_and_digest() {
        let mut buf = FileBuffer::new().unwrap();
        buf.write(b"hello ").unwrap();
        buf.write(b"world").unwrap();
        assert_eq!(buf.len(), 11);
        assert_eq!(buf.sha1_hex(), HELLO_SHA1);
    }

    #[test]
    fn memory_payload_rewinds() {
        let mut buf = MemoryBuffer::new();
        buf.write(b"abc").unwrap();
        let payload = buf.payload().unwrap();
        assert_eq!(payload.len(), 3);
        assert_eq!(payload.read_bytes().unwrap().as_ref(), b"abc");
        // A second pass sees the same bytes from offset zero.
        assert_eq!(payload.read_bytes().unwrap().as_ref(), b"abc");
    }

    #[test]
    fn file_payload_rewinds() {
        let mut buf = FileBuffer::new().unwrap();
        buf.write(b"abcdef").unwrap();
        let payload = buf.payload().unwrap();
        assert_eq!(payload.len(), 6);
        assert_eq!(payload.read_bytes().unwrap().as_ref(), b"abcdef");
        assert_eq!(payload.read_bytes().unwrap().as_ref(), b"abcdef");
    }

    #[test]
    fn empty_buffers_hash_the_empty_string() {
        // da39... is SHA-1 of zero bytes.
        let empty = "da39a3ee5e6b4b0d3255bfef95601890afd80709";
        assert_eq!(MemoryBuffer::new().sha1_hex(), empty);
        assert_eq!(FileBuffer::new().unwrap().sha1_hex(), empty);
        assert_eq!(sha1_hex(b""), empty);
    }
}
