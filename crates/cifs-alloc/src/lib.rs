#![forbid(unsafe_code)]
//! Block allocation bitvector.
//!
//! One bit per block, MSB-first within each byte: bit `i` lives at
//! `bytes[i / 8] & (0x80 >> (i % 8))`. Set means allocated. The bitvector
//! occupies the first blocks of the volume as raw bitmap bytes (no tag) and
//! is held fully in memory while mounted; each flip writes back only the one
//! on-volume block containing the changed byte.
//!
//! First-fit scan: whole 0xFF bytes are skipped before bits are examined.

use cifs_block::BlockDevice;
use cifs_error::{CifsError, Result};
use cifs_types::{BlockIndex, Geometry};

fn mask(bit: u16) -> u8 {
    0x80 >> (bit % 8)
}

/// In-memory copy of the on-volume allocation bitmap.
#[derive(Debug, Clone)]
pub struct BitVector {
    // Sized to the full bitvector region (bitvector_blocks * block_size) so
    // whole blocks can be sliced out for write-back.
    bytes: Vec<u8>,
    geo: Geometry,
}

impl BitVector {
    /// Fresh bitvector for a new volume: everything free except the layout's
    /// reserved blocks (bitvector region, superblock, root descriptor, root
    /// index), whose bits are set once and never cleared.
    #[must_use]
    pub fn new_formatted(geo: Geometry) -> Self {
        let len = usize::from(geo.bitvector_blocks()) * usize::from(geo.block_size());
        let mut bv = Self {
            bytes: vec![0_u8; len],
            geo,
        };
        for block in 0..=geo.root_content_index().0 {
            bv.set(BlockIndex(block));
        }
        bv
    }

    /// Read the bitvector region from a mounted volume.
    pub fn load(dev: &dyn BlockDevice, geo: Geometry) -> Result<Self> {
        let mut bytes =
            Vec::with_capacity(usize::from(geo.bitvector_blocks()) * usize::from(geo.block_size()));
        for block in 0..geo.bitvector_blocks() {
            bytes.extend_from_slice(dev.read_block(BlockIndex(block))?.as_slice());
        }
        Ok(Self { bytes, geo })
    }

    fn check(&self, index: BlockIndex) {
        assert!(
            self.geo.is_valid(index),
            "block index {index} outside the volume"
        );
    }

    #[must_use]
    pub fn is_set(&self, index: BlockIndex) -> bool {
        self.check(index);
        self.bytes[usize::from(index.0 / 8)] & mask(index.0) != 0
    }

    pub fn set(&mut self, index: BlockIndex) {
        self.check(index);
        self.bytes[usize::from(index.0 / 8)] |= mask(index.0);
    }

    pub fn clear(&mut self, index: BlockIndex) {
        self.check(index);
        self.bytes[usize::from(index.0 / 8)] &= !mask(index.0);
    }

    /// First free block, scanning from the start of the volume. Bytes with
    /// no free bit are skipped without per-bit inspection.
    #[must_use]
    pub fn find_free(&self) -> Option<BlockIndex> {
        let count = self.geo.block_count();
        for (byte_at, &byte) in self.bytes.iter().enumerate() {
            if byte == 0xFF {
                continue;
            }
            let base = byte_at * 8;
            for bit in 0..8_usize {
                let index = base + bit;
                if index >= usize::from(count) {
                    return None;
                }
                if byte & mask(bit as u16) == 0 {
                    return Some(BlockIndex(index as u16));
                }
            }
        }
        None
    }

    /// Number of free blocks. Used as the write preflight so allocation
    /// failures surface before any mutation.
    #[must_use]
    pub fn count_free(&self) -> usize {
        let count = usize::from(self.geo.block_count());
        let full_bytes = count / 8;
        let mut free: usize = self.bytes[..full_bytes]
            .iter()
            .map(|b| usize::from(b.count_zeros() as u8))
            .sum();
        for bit in (full_bytes * 8)..count {
            if self.bytes[bit / 8] & mask(bit as u16) == 0 {
                free += 1;
            }
        }
        free
    }

    /// Claim the first free block and persist the containing bitmap block.
    pub fn allocate(&mut self, dev: &dyn BlockDevice) -> Result<BlockIndex> {
        let index = self.find_free().ok_or(CifsError::AllocationExhausted)?;
        self.set(index);
        self.write_containing_block(dev, index)?;
        Ok(index)
    }

    /// Return a block to the pool and persist the containing bitmap block.
    /// The block's content is left in place; only the bit changes.
    pub fn release(&mut self, dev: &dyn BlockDevice, index: BlockIndex) -> Result<()> {
        self.clear(index);
        self.write_containing_block(dev, index)
    }

    /// Write every bitmap block. Used at format time.
    pub fn flush_all(&self, dev: &dyn BlockDevice) -> Result<()> {
        let bs = usize::from(self.geo.block_size());
        for block in 0..self.geo.bitvector_blocks() {
            let at = usize::from(block) * bs;
            dev.write_block(BlockIndex(block), &self.bytes[at..at + bs])?;
        }
        Ok(())
    }

    fn write_containing_block(&self, dev: &dyn BlockDevice, index: BlockIndex) -> Result<()> {
        let bs = usize::from(self.geo.block_size());
        let block = usize::from(index.0 / 8) / bs;
        let at = block * bs;
        dev.write_block(BlockIndex(block as u16), &self.bytes[at..at + bs])
    }
}
