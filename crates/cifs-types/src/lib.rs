#![forbid(unsafe_code)]
//! Shared value types for the CIFS storage engine.
//!
//! Newtypes for block references and caller identity, the validated volume
//! [`Geometry`], the bounded [`FileName`] type, and little-endian byte
//! helpers used by the on-volume codec.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Maximum length of a file or folder name in bytes.
pub const MAX_NAME_LEN: usize = 128;

/// Width of the block tag prefix on every on-volume block.
pub const BLOCK_TAG_LEN: usize = 2;

/// Number of hash buckets in the mount-time registry (prime, > 2^16).
pub const REGISTRY_BUCKETS: usize = 65_537;

/// Reference to a block on the volume.
///
/// On-volume references are two bytes wide, which caps the volume at 65535
/// blocks. The value equal to the volume's block count is the "no reference"
/// sentinel and never addresses a real block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockIndex(pub u16);

impl BlockIndex {
    /// The next block index, or `None` on overflow.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }
}

impl fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique file/folder identifier issued by the superblock counter.
///
/// Monotonically increasing, never reused, even across deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId(pub u64);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller (process owner) identity supplied by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Uid(pub u32);

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── File kind ───────────────────────────────────────────────────────────────

/// Whether a descriptor describes a folder or a regular file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileKind {
    Folder,
    File,
}

impl FileKind {
    /// On-volume tag value for this kind.
    #[must_use]
    pub fn tag(self) -> u16 {
        match self {
            Self::Folder => 0,
            Self::File => 1,
        }
    }

    /// Decode a tag value, `None` for anything that is not a descriptor tag.
    #[must_use]
    pub fn from_tag(tag: u16) -> Option<Self> {
        match tag {
            0 => Some(Self::Folder),
            1 => Some(Self::File),
            _ => None,
        }
    }
}

// ── Access rights and modes ─────────────────────────────────────────────────

/// Owner read permission bit.
pub const MODE_OWNER_READ: u16 = 0o400;
/// Owner write permission bit.
pub const MODE_OWNER_WRITE: u16 = 0o200;

/// POSIX-style mode bits stored in a descriptor.
///
/// Only the owner read/write bits participate in access checks; the rest are
/// carried for the adapter's benefit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRights(pub u16);

impl AccessRights {
    #[must_use]
    pub fn owner_may_read(self) -> bool {
        self.0 & MODE_OWNER_READ != 0
    }

    #[must_use]
    pub fn owner_may_write(self) -> bool {
        self.0 & MODE_OWNER_WRITE != 0
    }
}

/// Access requested when opening a file, and granted on the open entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

impl AccessMode {
    #[must_use]
    pub fn wants_read(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    #[must_use]
    pub fn wants_write(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

// ── Bounded file name ───────────────────────────────────────────────────────

/// Why a candidate name was rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NameError {
    #[error("name cannot be empty")]
    Empty,
    #[error("name exceeds {MAX_NAME_LEN} bytes: {0}")]
    TooLong(usize),
    #[error("name contains an illegal byte: {0:#04x}")]
    IllegalByte(u8),
}

/// Validated file/folder name, at most [`MAX_NAME_LEN`] bytes.
///
/// Oversized or malformed names are an explicit error, never a silent
/// truncation. `/` and NUL are reserved for the path-parsing adapter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileName(String);

impl FileName {
    /// The root folder's name.
    pub const ROOT: &'static str = "/";

    pub fn new(name: &str) -> Result<Self, NameError> {
        if name.is_empty() {
            return Err(NameError::Empty);
        }
        if name.len() > MAX_NAME_LEN {
            return Err(NameError::TooLong(name.len()));
        }
        // The root name is minted internally at format time; callers never
        // create children named "/".
        if name != Self::ROOT {
            if let Some(&bad) = name.as_bytes().iter().find(|&&b| b == 0 || b == b'/') {
                return Err(NameError::IllegalByte(bad));
            }
        }
        Ok(Self(name.to_owned()))
    }

    /// Construct the root name; infallible by definition.
    #[must_use]
    pub fn root() -> Self {
        Self(Self::ROOT.to_owned())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for FileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Volume geometry ─────────────────────────────────────────────────────────

/// Smallest supported block size; must hold a full descriptor encoding.
pub const MIN_BLOCK_SIZE: u16 = 256;
/// Largest supported block size.
pub const MAX_BLOCK_SIZE: u16 = 32_768;

/// Volume geometry, fixed at creation and recorded in the superblock.
///
/// Derives the on-volume layout: bitvector region at blocks `0..B`,
/// superblock at `B`, root descriptor at `B+1`, root index at `B+2`, with
/// `B = ceil(block_count / 8 / block_size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    block_size: u16,
    block_count: u16,
}

impl Geometry {
    /// Geometry of the reference volume: 256-byte blocks, 65535 blocks.
    pub const DEFAULT: Self = Self {
        block_size: 256,
        block_count: u16::MAX,
    };

    pub fn new(block_size: u16, block_count: u16) -> Result<Self, ParseError> {
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be in 256..=32768",
            });
        }
        let geo = Self {
            block_size,
            block_count,
        };
        // Layout must leave at least one allocatable block after the
        // bitvector region, superblock, and the two root blocks.
        let reserved = u32::from(geo.bitvector_blocks()) + 3;
        if u32::from(block_count) <= reserved {
            return Err(ParseError::InvalidField {
                field: "block_count",
                reason: "volume too small for bitvector, superblock, and root",
            });
        }
        Ok(geo)
    }

    #[must_use]
    pub fn block_size(self) -> u16 {
        self.block_size
    }

    #[must_use]
    pub fn block_count(self) -> u16 {
        self.block_count
    }

    /// Number of blocks occupied by the bitvector region.
    #[must_use]
    pub fn bitvector_blocks(self) -> u16 {
        let bytes = (u32::from(self.block_count)).div_ceil(8);
        let blocks = bytes.div_ceil(u32::from(self.block_size));
        // block_count <= 65535 and block_size >= 256 bound this well below u16::MAX.
        blocks.try_into().unwrap_or(u16::MAX)
    }

    /// Block index of the superblock (first block after the bitvector).
    #[must_use]
    pub fn superblock_index(self) -> BlockIndex {
        BlockIndex(self.bitvector_blocks())
    }

    /// Block index of the root folder's descriptor.
    #[must_use]
    pub fn root_index(self) -> BlockIndex {
        BlockIndex(self.bitvector_blocks() + 1)
    }

    /// Block index of the root folder's first index block.
    #[must_use]
    pub fn root_content_index(self) -> BlockIndex {
        BlockIndex(self.bitvector_blocks() + 2)
    }

    /// The "no reference" sentinel: equal to the block count, never valid.
    #[must_use]
    pub fn sentinel(self) -> BlockIndex {
        BlockIndex(self.block_count)
    }

    /// Whether `index` addresses a real block on this volume.
    #[must_use]
    pub fn is_valid(self, index: BlockIndex) -> bool {
        index.0 < self.block_count
    }

    /// Byte capacity of a data block (block size minus the tag).
    #[must_use]
    pub fn data_capacity(self) -> usize {
        usize::from(self.block_size) - BLOCK_TAG_LEN
    }

    /// Number of reference slots in an index block.
    ///
    /// The final slot is reserved for chaining to a continuation block, so
    /// `index_capacity() - 1` slots carry payload references.
    #[must_use]
    pub fn index_capacity(self) -> usize {
        (usize::from(self.block_size) - BLOCK_TAG_LEN) / 2
    }

    /// Payload reference slots per index block (capacity minus the chain slot).
    #[must_use]
    pub fn index_fanout(self) -> usize {
        self.index_capacity() - 1
    }

    /// Total volume length in bytes.
    #[must_use]
    pub fn volume_len(self) -> u64 {
        u64::from(self.block_size) * u64::from(self.block_count)
    }
}

// ── Codec parse errors ──────────────────────────────────────────────────────

/// On-volume format violations detected during byte parsing.
///
/// Converted into `CifsError` at the `cifs-core` boundary; this crate stays
/// independent of `cifs-error` to avoid cyclic dependencies.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("unrecognized block tag: {0:#06x}")]
    InvalidTag(u16),
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };
    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

/// Decode a NUL-padded fixed-width name field.
#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_helpers() {
        let bytes = [0x34_u8, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90];
        assert_eq!(read_le_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&bytes, 0).expect("u32"), 0x5678_1234);
        assert_eq!(read_le_u64(&bytes, 0).expect("u64"), 0x90AB_CDEF_5678_1234);
        assert!(matches!(
            read_le_u32(&bytes, 6),
            Err(ParseError::InsufficientData { .. })
        ));
    }

    #[test]
    fn trim_nul_padded_stops_at_first_nul() {
        assert_eq!(trim_nul_padded(b"a.txt\0\0\0"), "a.txt");
        assert_eq!(trim_nul_padded(b"full"), "full");
    }

    #[test]
    fn default_geometry_matches_reference_volume() {
        let geo = Geometry::DEFAULT;
        assert_eq!(geo.block_size(), 256);
        assert_eq!(geo.block_count(), 65_535);
        // 65535 bits → 8192 bytes → 32 blocks of 256 bytes.
        assert_eq!(geo.bitvector_blocks(), 32);
        assert_eq!(geo.superblock_index(), BlockIndex(32));
        assert_eq!(geo.root_index(), BlockIndex(33));
        assert_eq!(geo.root_content_index(), BlockIndex(34));
        assert_eq!(geo.sentinel(), BlockIndex(65_535));
        assert_eq!(geo.data_capacity(), 254);
        assert_eq!(geo.index_capacity(), 127);
        assert_eq!(geo.index_fanout(), 126);
    }

    #[test]
    fn small_geometry_layout() {
        let geo = Geometry::new(256, 16).expect("geometry");
        assert_eq!(geo.bitvector_blocks(), 1);
        assert_eq!(geo.superblock_index(), BlockIndex(1));
        assert_eq!(geo.root_index(), BlockIndex(2));
        assert_eq!(geo.root_content_index(), BlockIndex(3));
        assert_eq!(geo.sentinel(), BlockIndex(16));
        assert!(geo.is_valid(BlockIndex(15)));
        assert!(!geo.is_valid(BlockIndex(16)));
    }

    #[test]
    fn geometry_rejects_degenerate_volumes() {
        assert!(Geometry::new(128, 1000).is_err());
        assert!(Geometry::new(256, 4).is_err());
        assert!(Geometry::new(256, 5).is_ok());
    }

    #[test]
    fn file_name_validation() {
        assert!(FileName::new("a.txt").is_ok());
        assert_eq!(FileName::new(""), Err(NameError::Empty));
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert_eq!(
            FileName::new(&long),
            Err(NameError::TooLong(MAX_NAME_LEN + 1))
        );
        assert_eq!(
            FileName::new("a/b"),
            Err(NameError::IllegalByte(b'/'))
        );
        assert_eq!(
            FileName::new("a\0b"),
            Err(NameError::IllegalByte(0))
        );
        let max = "x".repeat(MAX_NAME_LEN);
        assert!(FileName::new(&max).is_ok());
    }

    #[test]
    fn access_rights_bits() {
        assert!(AccessRights(0o644).owner_may_read());
        assert!(AccessRights(0o644).owner_may_write());
        assert!(!AccessRights(0o444).owner_may_write());
        assert!(!AccessRights(0o200).owner_may_read());
    }

    #[test]
    fn access_mode_predicates() {
        assert!(AccessMode::Read.wants_read());
        assert!(!AccessMode::Read.wants_write());
        assert!(AccessMode::Write.wants_write());
        assert!(!AccessMode::Write.wants_read());
        assert!(AccessMode::ReadWrite.wants_read());
        assert!(AccessMode::ReadWrite.wants_write());
    }

    #[test]
    fn file_kind_tag_round_trip() {
        assert_eq!(FileKind::from_tag(FileKind::Folder.tag()), Some(FileKind::Folder));
        assert_eq!(FileKind::from_tag(FileKind::File.tag()), Some(FileKind::File));
        assert_eq!(FileKind::from_tag(2), None);
    }
}
