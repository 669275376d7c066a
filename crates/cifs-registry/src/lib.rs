#![forbid(unsafe_code)]
//! In-memory registry of every live file and folder on a mounted volume.
//!
//! Rebuilt from the on-volume tree at mount time; purely a cache, never the
//! source of truth. Entries live in a slab so a [`FileHandle`] stays valid
//! for the life of the mount, with a fixed prime-sized bucket table on top
//! for name lookup. The lookup key is (parent handle, name), so equal names
//! under different parents never collide.

use cifs_error::{CifsError, Result};
use cifs_ondisk::Descriptor;
use cifs_types::REGISTRY_BUCKETS;
use std::fmt;

/// Stable reference to a registry entry, valid until the entry is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(usize);

impl fmt::Display for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One live file or folder.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    /// Cached copy of the on-volume descriptor. Mutations go to the volume
    /// first, then to this copy.
    pub descriptor: Descriptor,
    /// Registry handle of the containing folder; `None` only for root.
    pub parent: Option<FileHandle>,
    /// Number of open-file entries referencing this entry across all callers.
    pub open_refs: u32,
}

/// djb2 variant (xor fold), the classic string hash. The parent handle is
/// folded in after the name so the bucket depends on the full lookup key.
fn bucket_of(parent: Option<FileHandle>, name: &str) -> usize {
    let mut hash: u64 = 5381;
    for &byte in name.as_bytes() {
        hash = (hash << 5).wrapping_add(hash) ^ u64::from(byte);
    }
    let parent_tag = match parent {
        // Slot ids start at 0, so offset by 1 to keep "no parent" distinct.
        Some(handle) => handle.0 as u64 + 1,
        None => 0,
    };
    for byte in parent_tag.to_le_bytes() {
        hash = (hash << 5).wrapping_add(hash) ^ u64::from(byte);
    }
    (hash % REGISTRY_BUCKETS as u64) as usize
}

/// Slab of entries plus a (parent, name) hash index.
#[derive(Debug)]
pub struct Registry {
    slots: Vec<Option<RegistryEntry>>,
    free_slots: Vec<usize>,
    buckets: Vec<Vec<usize>>,
    len: usize,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            buckets: vec![Vec::new(); REGISTRY_BUCKETS],
            len: 0,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert an entry under `parent`. `Duplicate` if the (parent, name) key
    /// is already present.
    pub fn insert(
        &mut self,
        descriptor: Descriptor,
        parent: Option<FileHandle>,
    ) -> Result<FileHandle> {
        if self.lookup(parent, descriptor.name.as_str()).is_some() {
            return Err(CifsError::Duplicate);
        }
        let bucket = bucket_of(parent, descriptor.name.as_str());
        let entry = RegistryEntry {
            descriptor,
            parent,
            open_refs: 0,
        };
        let slot = match self.free_slots.pop() {
            Some(slot) => {
                self.slots[slot] = Some(entry);
                slot
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };
        self.buckets[bucket].push(slot);
        self.len += 1;
        Ok(FileHandle(slot))
    }

    /// Resolve a name under `parent` to its handle.
    #[must_use]
    pub fn lookup(&self, parent: Option<FileHandle>, name: &str) -> Option<FileHandle> {
        let bucket = bucket_of(parent, name);
        self.buckets[bucket]
            .iter()
            .copied()
            .find(|&slot| {
                self.slots[slot].as_ref().is_some_and(|entry| {
                    entry.parent == parent && entry.descriptor.name.as_str() == name
                })
            })
            .map(FileHandle)
    }

    #[must_use]
    pub fn get(&self, handle: FileHandle) -> Option<&RegistryEntry> {
        self.slots.get(handle.0).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, handle: FileHandle) -> Option<&mut RegistryEntry> {
        self.slots.get_mut(handle.0).and_then(Option::as_mut)
    }

    /// Remove an entry, freeing its slot for reuse. The handle is dead after
    /// this; a later insert may mint an equal handle for a different entry.
    pub fn remove(&mut self, handle: FileHandle) -> Option<RegistryEntry> {
        let entry = self.slots.get_mut(handle.0)?.take()?;
        let bucket = bucket_of(entry.parent, entry.descriptor.name.as_str());
        self.buckets[bucket].retain(|&slot| slot != handle.0);
        self.free_slots.push(handle.0);
        self.len -= 1;
        Some(entry)
    }
}
