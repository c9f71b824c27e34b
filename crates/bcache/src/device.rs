//! Block-addressed backing-store interface consumed by the cache.
//!
//! The write side is a scatter-run write: a maximal set of contiguous block
//! numbers written in one call, atomic from the cache's perspective (either
//! every buffer of the run is written, or the run failed and nothing is
//! assumed about partial completion).

use bcache_error::{CacheError, Result};
use bcache_types::{BlockNumber, BlockSize};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Block-addressed device for fixed-size I/O.
pub trait BlockDevice: Send + Sync {
    /// Device block size in bytes.
    fn block_size(&self) -> BlockSize;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Read a block by number.
    fn read_block(&self, block: BlockNumber) -> Result<Vec<u8>>;

    /// Write a run of contiguous blocks starting at `first`.
    ///
    /// Every buffer MUST be exactly `block_size()` long. Equivalent to one
    /// `pwritev` call: the run either completes or fails as a unit.
    fn write_blocks(&self, first: BlockNumber, buffers: &[&[u8]]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn check_run(
    block_size: BlockSize,
    block_count: u64,
    first: BlockNumber,
    buffers: &[&[u8]],
) -> Result<u64> {
    let run_len = u64::try_from(buffers.len())
        .map_err(|_| CacheError::BadValue("run length overflows u64".to_owned()))?;
    let end = first
        .0
        .checked_add(run_len)
        .ok_or_else(|| CacheError::BadValue("run end overflows u64".to_owned()))?;
    if end > block_count {
        return Err(CacheError::BadValue(format!(
            "run out of range: first={first} len={run_len} block_count={block_count}"
        )));
    }
    for buf in buffers {
        if buf.len() != block_size.as_usize() {
            return Err(CacheError::BadValue(format!(
                "run buffer size mismatch: got={} expected={}",
                buf.len(),
                block_size.get()
            )));
        }
    }
    block_size
        .block_to_byte(first)
        .ok_or_else(|| CacheError::BadValue("block offset overflows u64".to_owned()))
}

/// File-backed block device using `pread`/`pwrite` style I/O.
///
/// `std::os::unix::fs::FileExt` is thread-safe and does not require a
/// shared seek position. Opens read-write when possible, read-only
/// otherwise.
#[derive(Debug, Clone)]
pub struct FileBlockDevice {
    file: Arc<File>,
    block_size: BlockSize,
    block_count: u64,
    writable: bool,
}

impl FileBlockDevice {
    pub fn open(path: impl AsRef<Path>, block_size: BlockSize) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        let block_size_u64 = u64::from(block_size.get());
        if len % block_size_u64 != 0 {
            return Err(CacheError::BadValue(format!(
                "image length is not block-aligned: len_bytes={len} block_size={}",
                block_size.get()
            )));
        }
        Ok(Self {
            file: Arc::new(file),
            block_size,
            block_count: len / block_size_u64,
            writable,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl BlockDevice for FileBlockDevice {
    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&self, block: BlockNumber) -> Result<Vec<u8>> {
        if block.0 >= self.block_count {
            return Err(CacheError::BadValue(format!(
                "block out of range: block={block} block_count={}",
                self.block_count
            )));
        }
        let offset = self
            .block_size
            .block_to_byte(block)
            .ok_or_else(|| CacheError::BadValue("block offset overflows u64".to_owned()))?;
        let mut buf = vec![0_u8; self.block_size.as_usize()];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    fn write_blocks(&self, first: BlockNumber, buffers: &[&[u8]]) -> Result<()> {
        if !self.writable {
            return Err(CacheError::ReadOnly);
        }
        let mut offset = check_run(self.block_size, self.block_count, first, buffers)?;
        for buf in buffers {
            self.file.write_all_at(buf, offset)?;
            offset += u64::from(self.block_size.get());
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory block device for tests and benchmarks.
#[derive(Debug)]
pub struct MemBlockDevice {
    bytes: Mutex<Vec<u8>>,
    block_size: BlockSize,
    block_count: u64,
}

impl MemBlockDevice {
    #[must_use]
    pub fn new(block_size: BlockSize, block_count: u64) -> Self {
        let len = usize::try_from(block_count).unwrap_or(usize::MAX) * block_size.as_usize();
        Self {
            bytes: Mutex::new(vec![0_u8; len]),
            block_size,
            block_count,
        }
    }

    /// Raw device contents, for test assertions.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl BlockDevice for MemBlockDevice {
    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&self, block: BlockNumber) -> Result<Vec<u8>> {
        if block.0 >= self.block_count {
            return Err(CacheError::BadValue(format!(
                "block out of range: block={block} block_count={}",
                self.block_count
            )));
        }
        let start = usize::try_from(block.0).unwrap_or(usize::MAX) * self.block_size.as_usize();
        let bytes = self.bytes.lock();
        Ok(bytes[start..start + self.block_size.as_usize()].to_vec())
    }

    fn write_blocks(&self, first: BlockNumber, buffers: &[&[u8]]) -> Result<()> {
        let offset = check_run(self.block_size, self.block_count, first, buffers)?;
        let mut start = usize::try_from(offset)
            .map_err(|_| CacheError::BadValue("offset overflows usize".to_owned()))?;
        let mut bytes = self.bytes.lock();
        for buf in buffers {
            bytes[start..start + buf.len()].copy_from_slice(buf);
            start += buf.len();
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bs() -> BlockSize {
        BlockSize::new(512).expect("block size")
    }

    #[test]
    fn mem_device_round_trips_a_run() {
        let dev = MemBlockDevice::new(bs(), 8);
        let a = vec![1_u8; 512];
        let b = vec![2_u8; 512];
        dev.write_blocks(BlockNumber(2), &[&a, &b]).expect("write");
        assert_eq!(dev.read_block(BlockNumber(2)).expect("read"), a);
        assert_eq!(dev.read_block(BlockNumber(3)).expect("read"), b);
    }

    #[test]
    fn run_past_end_is_rejected() {
        let dev = MemBlockDevice::new(bs(), 4);
        let buf = vec![0_u8; 512];
        let err = dev
            .write_blocks(BlockNumber(3), &[&buf, &buf])
            .expect_err("out of range");
        assert!(matches!(err, CacheError::BadValue(_)));
    }

    #[test]
    fn wrong_buffer_size_is_rejected() {
        let dev = MemBlockDevice::new(bs(), 4);
        let buf = vec![0_u8; 100];
        let err = dev
            .write_blocks(BlockNumber(0), &[buf.as_slice()])
            .expect_err("size mismatch");
        assert!(matches!(err, CacheError::BadValue(_)));
    }

    #[test]
    fn file_device_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("image.img");
        std::fs::write(&path, vec![0_u8; 512 * 16]).expect("create image");

        let dev = FileBlockDevice::open(&path, bs()).expect("open");
        assert_eq!(dev.block_count(), 16);
        assert!(dev.is_writable());

        let payload = vec![0x42_u8; 512];
        dev.write_blocks(BlockNumber(5), &[payload.as_slice()])
            .expect("write");
        assert_eq!(dev.read_block(BlockNumber(5)).expect("read"), payload);
    }

    #[test]
    fn misaligned_image_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("short.img");
        std::fs::write(&path, vec![0_u8; 700]).expect("create image");
        assert!(matches!(
            FileBlockDevice::open(&path, bs()),
            Err(CacheError::BadValue(_))
        ));
    }
}
