#![forbid(unsafe_code)]
//! Read-only byte and block access to a filesystem image.
//!
//! Provides the `ByteDevice` trait with file-backed and in-memory
//! implementations, plus whole-block reads at a validated block size. The
//! checker is a single synchronous pass over a frozen image, so there is no
//! cache, no write path and no dirty tracking.

use apck_error::{CheckError, Result};
use apck_types::{BlockNumber, BlockSize};
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::trace;

/// Positioned byte reads over a raw image (pread semantics).
pub trait ByteDevice {
    /// Total size of the device in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes starting at `offset`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

/// A `ByteDevice` backed by a regular file or block device node.
#[derive(Debug)]
pub struct FileByteDevice {
    file: File,
    len: u64,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        trace!(
            target: "apck::block",
            event = "read",
            offset = offset,
            len = buf.len()
        );
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }
}

/// A `ByteDevice` over an in-memory image, used by tests and synthetic
/// containers.
#[derive(Debug, Clone)]
pub struct MemByteDevice {
    bytes: Vec<u8>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        let end = start
            .checked_add(buf.len())
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| CheckError::Io(io::Error::from(io::ErrorKind::UnexpectedEof)))?;
        buf.copy_from_slice(&self.bytes[start..end]);
        Ok(())
    }
}

/// Read one whole block into a fresh buffer.
pub fn read_block(dev: &dyn ByteDevice, block_size: BlockSize, bno: BlockNumber) -> Result<Vec<u8>> {
    let offset = block_size.block_to_byte(bno).ok_or_else(|| {
        CheckError::Io(io::Error::from(io::ErrorKind::UnexpectedEof))
    })?;
    let mut buf = vec![0_u8; block_size.as_usize()];
    dev.read_exact_at(offset, &mut buf)?;
    Ok(buf)
}
