#![forbid(unsafe_code)]
//! Error types for the CIFS storage engine.
//!
//! Two-layer error model: byte-level format violations are reported as
//! `cifs_types::ParseError` by the codec, and converted into [`CifsError`]
//! at the `cifs-core` boundary. `cifs-error` stays independent of
//! `cifs-types` so the dependency graph has no cycles.
//!
//! Every variant maps to exactly one POSIX errno via [`CifsError::to_errno`]
//! so the user-space filesystem adapter can translate results mechanically.
//! The mapping is exhaustive; adding a variant without an errno is a
//! compile error.

use thiserror::Error;

/// Unified error type for all CIFS operations.
#[derive(Debug, Error)]
pub enum CifsError {
    /// Device-level I/O failure (wraps `std::io::Error`). Surfaced to the
    /// caller, never retried here; retry policy belongs to the adapter.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A block decoded to an unrecognized tag or malformed payload.
    #[error("corrupt block {block}: {detail}")]
    CorruptBlock { block: u16, detail: String },

    /// The superblock's geometry disagrees with the opened store.
    #[error("not a CIFS volume: {0}")]
    NotAFilesystem(String),

    /// The bitvector has no free block left (or too few for a write).
    #[error("allocation exhausted: no free blocks")]
    AllocationExhausted,

    /// No entry for the requested name or handle.
    #[error("not found: {0}")]
    NotFound(String),

    /// An entry with the same name already exists under the same parent.
    #[error("duplicate name under parent")]
    Duplicate,

    /// Folder still has live entries.
    #[error("folder not empty")]
    NotEmpty,

    /// The file is open somewhere; it cannot be deleted.
    #[error("file in use")]
    InUse,

    /// The parent folder is not open by the calling process.
    #[error("parent folder not open")]
    NotOpen,

    /// The file is already open by some caller (exclusive-open policy).
    #[error("file already open")]
    OpenConflict,

    /// Caller identity does not satisfy the owner-only access check, or the
    /// caller holds no matching open-file entry.
    #[error("access denied")]
    AccessDenied,

    /// The folder's index chain cannot be extended for lack of space.
    #[error("directory full")]
    DirectoryFull,

    /// Candidate name is empty, oversized, or contains reserved bytes.
    #[error("invalid name: {0}")]
    InvalidName(String),
}

impl CifsError {
    /// Convert this error into a POSIX errno suitable for adapter replies.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::CorruptBlock { .. } => libc::EIO,
            Self::NotAFilesystem(_) => libc::EINVAL,
            Self::AllocationExhausted | Self::DirectoryFull => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::Duplicate => libc::EEXIST,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::InUse | Self::OpenConflict => libc::EBUSY,
            Self::NotOpen => libc::EBADF,
            Self::AccessDenied => libc::EACCES,
            Self::InvalidName(_) => libc::ENAMETOOLONG,
        }
    }
}

/// Result alias using `CifsError`.
pub type Result<T> = std::result::Result<T, CifsError>;
