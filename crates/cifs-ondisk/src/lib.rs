#![forbid(unsafe_code)]
//! On-volume metadata codec.
//!
//! Every block on the volume starts with a two-byte little-endian tag that
//! identifies its shape: folder descriptor, file descriptor, index block, or
//! data block. The superblock lives at a fixed, geometry-derived position and
//! carries a magic value instead of a tag. All multi-byte fields are
//! little-endian regardless of host, so a volume written on one machine
//! decodes on any other.
//!
//! Decoding reports `ParseError`; the core layer wraps that into a
//! `CorruptBlock` error carrying the offending block index.

use cifs_types::{
    ensure_slice, read_le_u16, read_le_u32, read_le_u64, trim_nul_padded, AccessRights,
    BlockIndex, FileId, FileKind, FileName, Geometry, ParseError, Uid, BLOCK_TAG_LEN,
    MAX_NAME_LEN,
};
use serde::{Deserialize, Serialize};

/// Block tag: index block.
pub const TAG_INDEX: u16 = 2;
/// Block tag: data block.
pub const TAG_DATA: u16 = 3;

/// First two bytes of the superblock. Not a block tag; checked at mount.
pub const SUPERBLOCK_MAGIC: u16 = 0xC1F5;

/// Encoded size of a descriptor including its tag.
pub const DESCRIPTOR_LEN: usize = 182;

// Descriptor field offsets. The tag doubles as the file kind.
const OFF_ID: usize = 2;
const OFF_NAME: usize = 10;
const OFF_CREATED: usize = 138;
const OFF_ACCESSED: usize = 146;
const OFF_MODIFIED: usize = 154;
const OFF_RIGHTS: usize = 162;
const OFF_OWNER: usize = 164;
const OFF_SIZE: usize = 168;
const OFF_CONTENT: usize = 176;
const OFF_PARENT: usize = 178;
const OFF_SELF: usize = 180;

// ── Superblock ──────────────────────────────────────────────────────────────

/// Volume metadata kept at the first block after the bitvector region.
///
/// `next_id` is the monotonic identifier counter; it only grows, so ids are
/// never reused even after deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub next_id: FileId,
    pub block_size: u16,
    pub block_count: u16,
    pub root_index: BlockIndex,
}

impl Superblock {
    /// Initial superblock for a freshly formatted volume. Id 0 is taken by
    /// the root folder, so the counter starts at 1.
    #[must_use]
    pub fn initial(geo: Geometry) -> Self {
        Self {
            next_id: FileId(1),
            block_size: geo.block_size(),
            block_count: geo.block_count(),
            root_index: geo.root_index(),
        }
    }

    #[must_use]
    pub fn encode(&self, geo: Geometry) -> Vec<u8> {
        let mut out = vec![0_u8; usize::from(geo.block_size())];
        out[0..2].copy_from_slice(&SUPERBLOCK_MAGIC.to_le_bytes());
        out[2..10].copy_from_slice(&self.next_id.0.to_le_bytes());
        out[10..12].copy_from_slice(&self.block_size.to_le_bytes());
        out[12..14].copy_from_slice(&self.block_count.to_le_bytes());
        out[14..16].copy_from_slice(&self.root_index.0.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u16(bytes, 0)?;
        if magic != SUPERBLOCK_MAGIC {
            return Err(ParseError::InvalidField {
                field: "magic",
                reason: "superblock magic mismatch",
            });
        }
        Ok(Self {
            next_id: FileId(read_le_u64(bytes, 2)?),
            block_size: read_le_u16(bytes, 10)?,
            block_count: read_le_u16(bytes, 12)?,
            root_index: BlockIndex(read_le_u16(bytes, 14)?),
        })
    }
}

// ── Descriptor ──────────────────────────────────────────────────────────────

/// File or folder metadata, one block each.
///
/// `content` refers to the first index block (folders always have one; files
/// carry the sentinel until their first non-empty write). `this` is the
/// descriptor's own block, recorded so index slots can be mapped back during
/// the mount traversal. Timestamps are unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub id: FileId,
    pub kind: FileKind,
    pub name: FileName,
    pub created: u64,
    pub accessed: u64,
    pub modified: u64,
    pub rights: AccessRights,
    pub owner: Uid,
    pub size: u64,
    pub content: BlockIndex,
    pub parent: BlockIndex,
    pub this: BlockIndex,
}

impl Descriptor {
    #[must_use]
    pub fn encode(&self, geo: Geometry) -> Vec<u8> {
        let mut out = vec![0_u8; usize::from(geo.block_size())];
        out[0..2].copy_from_slice(&self.kind.tag().to_le_bytes());
        out[OFF_ID..OFF_ID + 8].copy_from_slice(&self.id.0.to_le_bytes());
        let name = self.name.as_bytes();
        out[OFF_NAME..OFF_NAME + name.len()].copy_from_slice(name);
        out[OFF_CREATED..OFF_CREATED + 8].copy_from_slice(&self.created.to_le_bytes());
        out[OFF_ACCESSED..OFF_ACCESSED + 8].copy_from_slice(&self.accessed.to_le_bytes());
        out[OFF_MODIFIED..OFF_MODIFIED + 8].copy_from_slice(&self.modified.to_le_bytes());
        out[OFF_RIGHTS..OFF_RIGHTS + 2].copy_from_slice(&self.rights.0.to_le_bytes());
        out[OFF_OWNER..OFF_OWNER + 4].copy_from_slice(&self.owner.0.to_le_bytes());
        out[OFF_SIZE..OFF_SIZE + 8].copy_from_slice(&self.size.to_le_bytes());
        out[OFF_CONTENT..OFF_CONTENT + 2].copy_from_slice(&self.content.0.to_le_bytes());
        out[OFF_PARENT..OFF_PARENT + 2].copy_from_slice(&self.parent.0.to_le_bytes());
        out[OFF_SELF..OFF_SELF + 2].copy_from_slice(&self.this.0.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ParseError> {
        let tag = read_le_u16(bytes, 0)?;
        let kind = FileKind::from_tag(tag).ok_or(ParseError::InvalidTag(tag))?;
        let name_bytes = ensure_slice(bytes, OFF_NAME, MAX_NAME_LEN)?;
        let name = FileName::new(&trim_nul_padded(name_bytes)).map_err(|_| {
            ParseError::InvalidField {
                field: "name",
                reason: "empty or malformed descriptor name",
            }
        })?;
        Ok(Self {
            id: FileId(read_le_u64(bytes, OFF_ID)?),
            kind,
            name,
            created: read_le_u64(bytes, OFF_CREATED)?,
            accessed: read_le_u64(bytes, OFF_ACCESSED)?,
            modified: read_le_u64(bytes, OFF_MODIFIED)?,
            rights: AccessRights(read_le_u16(bytes, OFF_RIGHTS)?),
            owner: Uid(read_le_u32(bytes, OFF_OWNER)?),
            size: read_le_u64(bytes, OFF_SIZE)?,
            content: BlockIndex(read_le_u16(bytes, OFF_CONTENT)?),
            parent: BlockIndex(read_le_u16(bytes, OFF_PARENT)?),
            this: BlockIndex(read_le_u16(bytes, OFF_SELF)?),
        })
    }
}

// ── Index block ─────────────────────────────────────────────────────────────

/// Fixed array of block references; the last slot chains to a continuation.
///
/// Empty slots hold the geometry's sentinel value. Folders store child
/// descriptor references here; files store data block references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexBlock {
    slots: Vec<u16>,
    sentinel: u16,
}

impl IndexBlock {
    /// A fresh index block with every slot empty.
    #[must_use]
    pub fn empty(geo: Geometry) -> Self {
        Self {
            slots: vec![geo.sentinel().0; geo.index_capacity()],
            sentinel: geo.sentinel().0,
        }
    }

    /// Number of payload slots (total slots minus the chain slot).
    #[must_use]
    pub fn fanout(&self) -> usize {
        self.slots.len() - 1
    }

    /// The payload reference at `slot`, `None` when the slot is empty.
    ///
    /// # Panics
    /// If `slot` is not a payload slot.
    #[must_use]
    pub fn slot(&self, slot: usize) -> Option<BlockIndex> {
        assert!(slot < self.fanout(), "slot {slot} is not a payload slot");
        let value = self.slots[slot];
        (value != self.sentinel).then_some(BlockIndex(value))
    }

    /// Store `index` in payload slot `slot`.
    pub fn set_slot(&mut self, slot: usize, index: BlockIndex) {
        assert!(slot < self.fanout(), "slot {slot} is not a payload slot");
        self.slots[slot] = index.0;
    }

    /// Clear payload slot `slot` back to empty.
    pub fn clear_slot(&mut self, slot: usize) {
        assert!(slot < self.fanout(), "slot {slot} is not a payload slot");
        self.slots[slot] = self.sentinel;
    }

    /// First empty payload slot, `None` when the block is full.
    #[must_use]
    pub fn first_free_slot(&self) -> Option<usize> {
        self.slots[..self.fanout()]
            .iter()
            .position(|&s| s == self.sentinel)
    }

    /// Occupied payload references in slot order.
    pub fn refs(&self) -> impl Iterator<Item = BlockIndex> + '_ {
        let sentinel = self.sentinel;
        self.slots[..self.fanout()]
            .iter()
            .filter(move |&&s| s != sentinel)
            .map(|&s| BlockIndex(s))
    }

    /// Position of `index` among the payload slots, if present.
    #[must_use]
    pub fn position_of(&self, index: BlockIndex) -> Option<usize> {
        self.slots[..self.fanout()].iter().position(|&s| s == index.0)
    }

    /// Continuation index block, `None` when this is the last in the chain.
    #[must_use]
    pub fn chain(&self) -> Option<BlockIndex> {
        let value = self.slots[self.slots.len() - 1];
        (value != self.sentinel).then_some(BlockIndex(value))
    }

    /// Link a continuation index block.
    pub fn set_chain(&mut self, index: BlockIndex) {
        let last = self.slots.len() - 1;
        self.slots[last] = index.0;
    }

    #[must_use]
    pub fn encode(&self, geo: Geometry) -> Vec<u8> {
        let mut out = vec![0_u8; usize::from(geo.block_size())];
        out[0..2].copy_from_slice(&TAG_INDEX.to_le_bytes());
        for (i, slot) in self.slots.iter().enumerate() {
            let at = BLOCK_TAG_LEN + i * 2;
            out[at..at + 2].copy_from_slice(&slot.to_le_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8], geo: Geometry) -> Result<Self, ParseError> {
        let tag = read_le_u16(bytes, 0)?;
        if tag != TAG_INDEX {
            return Err(ParseError::InvalidTag(tag));
        }
        let mut slots = Vec::with_capacity(geo.index_capacity());
        for i in 0..geo.index_capacity() {
            slots.push(read_le_u16(bytes, BLOCK_TAG_LEN + i * 2)?);
        }
        Ok(Self {
            slots,
            sentinel: geo.sentinel().0,
        })
    }
}

// ── Block union ─────────────────────────────────────────────────────────────

/// Decoded view of any allocatable block on the volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Descriptor(Descriptor),
    Index(IndexBlock),
    /// Full data payload (`geometry.data_capacity()` bytes); the live prefix
    /// length comes from the owning descriptor's size.
    Data(Vec<u8>),
}

impl Block {
    pub fn decode(bytes: &[u8], geo: Geometry) -> Result<Self, ParseError> {
        let tag = read_le_u16(bytes, 0)?;
        match tag {
            t if FileKind::from_tag(t).is_some() => {
                Ok(Self::Descriptor(Descriptor::decode(bytes)?))
            }
            TAG_INDEX => Ok(Self::Index(IndexBlock::decode(bytes, geo)?)),
            TAG_DATA => {
                let payload = ensure_slice(bytes, BLOCK_TAG_LEN, geo.data_capacity())?;
                Ok(Self::Data(payload.to_vec()))
            }
            other => Err(ParseError::InvalidTag(other)),
        }
    }

    #[must_use]
    pub fn encode(&self, geo: Geometry) -> Vec<u8> {
        match self {
            Self::Descriptor(d) => d.encode(geo),
            Self::Index(i) => i.encode(geo),
            Self::Data(payload) => encode_data(payload, geo),
        }
    }
}

/// Encode one data block: tag, payload, zero padding to the block size.
///
/// # Panics
/// If `payload` exceeds the geometry's data capacity.
#[must_use]
pub fn encode_data(payload: &[u8], geo: Geometry) -> Vec<u8> {
    assert!(
        payload.len() <= geo.data_capacity(),
        "data payload exceeds block capacity"
    );
    let mut out = vec![0_u8; usize::from(geo.block_size())];
    out[0..2].copy_from_slice(&TAG_DATA.to_le_bytes());
    out[BLOCK_TAG_LEN..BLOCK_TAG_LEN + payload.len()].copy_from_slice(payload);
    out
}
