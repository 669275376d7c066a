#![forbid(unsafe_code)]
//! Block I/O layer: the single boundary between the engine and the volume.
//!
//! Provides the [`BlockDevice`] trait, a file-backed device using
//! pread/pwrite-style positioned I/O, and an in-memory device for tests.
//!
//! Error contract: a block index out of the device's declared range is a
//! caller programming error and asserts; device-level I/O failure surfaces
//! as `CifsError::Io` so the engine can report it instead of dying.

use cifs_error::Result;
use cifs_types::BlockIndex;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Owned block buffer.
///
/// Invariant: length == block size of the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read the block at `index`.
    ///
    /// # Panics
    /// If `index` is not below [`BlockDevice::block_count`].
    fn read_block(&self, index: BlockIndex) -> Result<BlockBuf>;

    /// Write the block at `index`. `data.len()` MUST equal `block_size()`.
    ///
    /// # Panics
    /// If `index` is out of range or `data` is not exactly one block.
    fn write_block(&self, index: BlockIndex, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u16;

    /// Total number of blocks.
    fn block_count(&self) -> u16;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

impl<D: BlockDevice + ?Sized> BlockDevice for Arc<D> {
    fn read_block(&self, index: BlockIndex) -> Result<BlockBuf> {
        (**self).read_block(index)
    }

    fn write_block(&self, index: BlockIndex, data: &[u8]) -> Result<()> {
        (**self).write_block(index, data)
    }

    fn block_size(&self) -> u16 {
        (**self).block_size()
    }

    fn block_count(&self) -> u16 {
        (**self).block_count()
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

fn check_range(index: BlockIndex, count: u16) {
    assert!(
        index.0 < count,
        "block index {index} out of range (block_count {count})"
    );
}

/// File-backed block device using positioned reads and writes.
///
/// `std::os::unix::fs::FileExt` is thread-safe and carries no shared seek
/// position, so `&self` access is sound.
#[derive(Debug, Clone)]
pub struct FileBlockDevice {
    file: Arc<File>,
    block_size: u16,
    block_count: u16,
}

impl FileBlockDevice {
    /// Open an existing volume file. The file length must be an exact
    /// multiple of `block_size` and match `block_count`.
    pub fn open(path: impl AsRef<Path>, block_size: u16, block_count: u16) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let dev = Self {
            file: Arc::new(file),
            block_size,
            block_count,
        };
        Ok(dev)
    }

    /// Create (or truncate) a volume file sized `block_count * block_size`.
    pub fn create(path: impl AsRef<Path>, block_size: u16, block_count: u16) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(u64::from(block_size) * u64::from(block_count))?;
        Ok(Self {
            file: Arc::new(file),
            block_size,
            block_count,
        })
    }

    /// Length of the backing file in bytes.
    pub fn len_bytes(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

impl BlockDevice for FileBlockDevice {
    fn read_block(&self, index: BlockIndex) -> Result<BlockBuf> {
        check_range(index, self.block_count);
        let offset = u64::from(index.0) * u64::from(self.block_size);
        let mut buf = vec![0_u8; usize::from(self.block_size)];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, index: BlockIndex, data: &[u8]) -> Result<()> {
        check_range(index, self.block_count);
        assert_eq!(
            data.len(),
            usize::from(self.block_size),
            "write_block data must be exactly one block"
        );
        let offset = u64::from(index.0) * u64::from(self.block_size);
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    fn block_size(&self) -> u16 {
        self.block_size
    }

    fn block_count(&self) -> u16 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory block device for tests and crash simulation.
///
/// Blocks are materialized lazily; unwritten blocks read back zeroed.
#[derive(Debug)]
pub struct MemBlockDevice {
    block_size: u16,
    block_count: u16,
    blocks: Mutex<Vec<Option<Vec<u8>>>>,
}

impl MemBlockDevice {
    #[must_use]
    pub fn new(block_size: u16, block_count: u16) -> Self {
        Self {
            block_size,
            block_count,
            blocks: Mutex::new(vec![None; usize::from(block_count)]),
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, index: BlockIndex) -> Result<BlockBuf> {
        check_range(index, self.block_count);
        let blocks = self.blocks.lock();
        let bytes = blocks[usize::from(index.0)]
            .clone()
            .unwrap_or_else(|| vec![0_u8; usize::from(self.block_size)]);
        Ok(BlockBuf::new(bytes))
    }

    fn write_block(&self, index: BlockIndex, data: &[u8]) -> Result<()> {
        check_range(index, self.block_count);
        assert_eq!(
            data.len(),
            usize::from(self.block_size),
            "write_block data must be exactly one block"
        );
        self.blocks.lock()[usize::from(index.0)] = Some(data.to_vec());
        Ok(())
    }

    fn block_size(&self) -> u16 {
        self.block_size
    }

    fn block_count(&self) -> u16 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
