#![forbid(unsafe_code)]
//! Session layer: volume lifecycle and the file operation surface.
//!
//! A [`Session`] owns a mounted volume end to end: the block device, the
//! superblock, the allocation bitvector, and the registry of live files.
//! Adapters (FUSE, test harnesses) talk to a session through explicit
//! [`Caller`] identities; there is no ambient "current user".
//!
//! Every operation takes `&mut self`, making the single-writer contract a
//! compile-time property. [`SharedSession`] wraps a session in
//! `Arc<parking_lot::Mutex>` for adapters that must serialize callers.

mod session;

pub use session::Session;

pub use cifs_block::{BlockBuf, BlockDevice, FileBlockDevice, MemBlockDevice};
pub use cifs_error::{CifsError, Result};
pub use cifs_ondisk::Descriptor;
pub use cifs_registry::FileHandle;
pub use cifs_types::{
    AccessMode, AccessRights, BlockIndex, FileId, FileKind, FileName, Geometry, Uid,
};

use parking_lot::Mutex;
use std::sync::Arc;

/// Identity of the process invoking an operation, supplied by the adapter
/// per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub uid: Uid,
    /// Mode bits masked off newly created files and folders.
    pub umask: u16,
}

impl Caller {
    #[must_use]
    pub fn new(uid: Uid, umask: u16) -> Self {
        Self { uid, umask }
    }
}

/// Cloneable handle to a mutex-guarded session.
///
/// The engine itself is single-writer; this wrapper is how an adapter with
/// several request threads serializes them onto one session.
pub struct SharedSession<D: BlockDevice> {
    inner: Arc<Mutex<Session<D>>>,
}

impl<D: BlockDevice> Clone for SharedSession<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: BlockDevice> SharedSession<D> {
    #[must_use]
    pub fn new(session: Session<D>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(session)),
        }
    }

    /// Run `f` with exclusive access to the session.
    pub fn with<R>(&self, f: impl FnOnce(&mut Session<D>) -> R) -> R {
        let mut guard = self.inner.lock();
        f(&mut guard)
    }

    /// Recover the owned session, e.g. to unmount. `None` while other
    /// clones are alive.
    #[must_use]
    pub fn into_inner(self) -> Option<Session<D>> {
        Arc::into_inner(self.inner).map(Mutex::into_inner)
    }
}
