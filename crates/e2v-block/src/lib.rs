#![forbid(unsafe_code)]
//! Read-only byte-addressed device layer.
//!
//! Provides the `ByteDevice` trait with positioned-read semantics, a
//! file-backed implementation using `pread`-style I/O, and an in-memory
//! implementation for tests and the image harness. All access is read-only;
//! this crate never mutates an image.

use e2v_error::{E2Error, Result};
use e2v_types::{BlockNumber, BlockSize, EXT2_SUPERBLOCK_OFFSET, EXT2_SUPERBLOCK_SIZE};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Byte-addressed read-only device for fixed-offset I/O (pread semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    ///
    /// A read past the end of the device is `E2Error::ShortRead`, never a
    /// partial fill.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

fn check_bounds(len: u64, offset: u64, wanted: usize) -> Result<()> {
    let wanted_u64 = u64::try_from(wanted).map_err(|_| E2Error::ShortRead {
        offset,
        needed: wanted,
    })?;
    let end = offset.checked_add(wanted_u64).ok_or(E2Error::ShortRead {
        offset,
        needed: wanted,
    })?;
    if end > len {
        return Err(E2Error::ShortRead {
            offset,
            needed: wanted,
        });
    }
    Ok(())
}

/// File-backed byte device using `std::os::unix::fs::FileExt`.
///
/// Positioned reads are thread-safe and share no seek position, so the
/// device is `Clone` over an `Arc<File>`.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    /// Open a disk image read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_bounds(self.len, offset, buf.len())?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }
}

/// In-memory byte device over an owned image buffer.
///
/// Used by the test harness and anywhere an image is already resident.
#[derive(Debug, Clone)]
pub struct MemByteDevice {
    bytes: Arc<Vec<u8>>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(bytes),
        }
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.len()).unwrap_or(u64::MAX)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_bounds(self.len_bytes(), offset, buf.len())?;
        let start = usize::try_from(offset).map_err(|_| E2Error::ShortRead {
            offset,
            needed: buf.len(),
        })?;
        buf.copy_from_slice(&self.bytes[start..start + buf.len()]);
        Ok(())
    }
}

/// Read the superblock region (1024 bytes at offset 1024).
pub fn read_superblock_region(dev: &dyn ByteDevice) -> Result<[u8; EXT2_SUPERBLOCK_SIZE]> {
    let mut buf = [0_u8; EXT2_SUPERBLOCK_SIZE];
    let offset = u64::try_from(EXT2_SUPERBLOCK_OFFSET).map_err(|_| E2Error::ShortRead {
        offset: 0,
        needed: EXT2_SUPERBLOCK_SIZE,
    })?;
    dev.read_exact_at(offset, &mut buf)?;
    Ok(buf)
}

/// Read one whole filesystem block into an owned buffer.
pub fn read_block(dev: &dyn ByteDevice, block_size: BlockSize, block: BlockNumber) -> Result<Vec<u8>> {
    let offset = block_size.block_to_byte(block);
    let len = usize::try_from(block_size.get()).map_err(|_| E2Error::ShortRead {
        offset: offset.0,
        needed: 0,
    })?;
    let mut buf = vec![0_u8; len];
    dev.read_exact_at(offset.0, &mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn mem_device_positioned_reads() {
        let dev = MemByteDevice::new((0_u8..=255).collect());
        assert_eq!(dev.len_bytes(), 256);

        let mut buf = [0_u8; 4];
        dev.read_exact_at(10, &mut buf).unwrap();
        assert_eq!(buf, [10, 11, 12, 13]);

        // Reads do not disturb each other (no shared cursor).
        dev.read_exact_at(0, &mut buf).unwrap();
        assert_eq!(buf, [0, 1, 2, 3]);
    }

    #[test]
    fn out_of_bounds_read_is_short_read() {
        let dev = MemByteDevice::new(vec![0_u8; 100]);
        let mut buf = [0_u8; 8];
        let err = dev.read_exact_at(96, &mut buf).unwrap_err();
        assert!(matches!(
            err,
            E2Error::ShortRead {
                offset: 96,
                needed: 8,
            }
        ));
    }

    #[test]
    fn superblock_region_comes_from_offset_1024() {
        let mut image = vec![0_u8; 4096];
        image[1024] = 0xAB;
        image[2047] = 0xCD;
        let dev = MemByteDevice::new(image);
        let region = read_superblock_region(&dev).unwrap();
        assert_eq!(region[0], 0xAB);
        assert_eq!(region[1023], 0xCD);
    }

    #[test]
    fn superblock_region_requires_2048_bytes() {
        let dev = MemByteDevice::new(vec![0_u8; 1500]);
        assert!(read_superblock_region(&dev).is_err());
    }

    #[test]
    fn read_block_addresses_by_block_number() {
        let mut image = vec![0_u8; 8192];
        image[3 * 1024] = 0x42;
        let dev = MemByteDevice::new(image);
        let bs = BlockSize::new(1024).unwrap();
        let block = read_block(&dev, bs, BlockNumber(3)).unwrap();
        assert_eq!(block.len(), 1024);
        assert_eq!(block[0], 0x42);
    }

    #[test]
    fn file_device_reads_without_seeking() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[9_u8; 2048]).unwrap();
        tmp.flush().unwrap();

        let dev = FileByteDevice::open(tmp.path()).unwrap();
        assert_eq!(dev.len_bytes(), 2048);

        let mut buf = [0_u8; 16];
        dev.read_exact_at(1000, &mut buf).unwrap();
        assert_eq!(buf, [9_u8; 16]);

        let err = dev.read_exact_at(2040, &mut buf).unwrap_err();
        assert!(matches!(err, E2Error::ShortRead { .. }));
    }
}
