//! Mounted-volume state machine: format, mount, unmount, and the file
//! operations.
//!
//! Durability ordering is the load-bearing invariant here. Writes are
//! copy-on-write: new content lands on fresh blocks and the descriptor
//! swings over in a single block write, so a crash leaves the volume either
//! fully old or fully new. The in-memory registry follows that swap
//! immediately, and superseded blocks are released only after both agree,
//! so a failed write-back can leak blocks but never leave the cache
//! pointing at a freed or superseded chain.

use crate::Caller;
use cifs_alloc::BitVector;
use cifs_block::{BlockDevice, FileBlockDevice};
use cifs_error::{CifsError, Result};
use cifs_ondisk::{encode_data, Block, Descriptor, IndexBlock, Superblock};
use cifs_registry::{FileHandle, Registry};
use cifs_types::{
    AccessMode, AccessRights, BlockIndex, FileId, FileKind, FileName, Geometry, ParseError, Uid,
};
use std::collections::HashMap;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn corrupt(at: BlockIndex, err: ParseError) -> CifsError {
    CifsError::CorruptBlock {
        block: at.0,
        detail: err.to_string(),
    }
}

/// Owner-only access model: the caller must be the owner, and the owner
/// mode bit for each requested direction must be set.
fn check_owner_access(caller: &Caller, desc: &Descriptor, mode: AccessMode) -> Result<()> {
    if caller.uid != desc.owner {
        return Err(CifsError::AccessDenied);
    }
    if mode.wants_read() && !desc.rights.owner_may_read() {
        return Err(CifsError::AccessDenied);
    }
    if mode.wants_write() && !desc.rights.owner_may_write() {
        return Err(CifsError::AccessDenied);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct OpenFile {
    handle: FileHandle,
    mode: AccessMode,
}

/// Per-caller bookkeeping, created lazily on first use.
#[derive(Debug, Default)]
struct CallerRecord {
    open: Vec<OpenFile>,
    cwd: Option<FileHandle>,
}

/// A mounted volume.
///
/// Constructed by [`Session::mount`] / [`Session::mount_device`], consumed
/// by [`Session::unmount`]; move semantics make double-unmount a compile
/// error.
pub struct Session<D: BlockDevice> {
    dev: D,
    geo: Geometry,
    superblock: Superblock,
    bitvector: BitVector,
    registry: Registry,
    callers: HashMap<Uid, CallerRecord>,
    root: FileHandle,
}

impl Session<FileBlockDevice> {
    /// Create and initialize a volume file at `path`.
    pub fn format(path: impl AsRef<Path>, geo: Geometry, caller: &Caller) -> Result<()> {
        let dev = FileBlockDevice::create(path, geo.block_size(), geo.block_count())?;
        Self::format_device(&dev, geo, caller)
    }

    /// Mount the volume file at `path`, expected to match `geo`.
    pub fn mount(path: impl AsRef<Path>, geo: Geometry) -> Result<Self> {
        let dev = FileBlockDevice::open(path, geo.block_size(), geo.block_count())?;
        if dev.len_bytes()? != geo.volume_len() {
            return Err(CifsError::NotAFilesystem(
                "volume file length does not match the geometry".into(),
            ));
        }
        Self::mount_device(dev, geo)
    }
}

impl<D: BlockDevice> Session<D> {
    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Write an empty filesystem onto `dev`: bitvector with the layout
    /// blocks reserved, root folder (id 0) with an empty index, and the
    /// initial superblock.
    pub fn format_device(dev: &D, geo: Geometry, caller: &Caller) -> Result<()> {
        let bitvector = BitVector::new_formatted(geo);
        bitvector.flush_all(dev)?;

        let now = now_unix();
        let root = Descriptor {
            id: FileId(0),
            kind: FileKind::Folder,
            name: FileName::root(),
            created: now,
            accessed: now,
            modified: now,
            rights: AccessRights(0o777 & !caller.umask),
            owner: caller.uid,
            size: 0,
            content: geo.root_content_index(),
            parent: geo.sentinel(),
            this: geo.root_index(),
        };
        dev.write_block(geo.root_content_index(), &IndexBlock::empty(geo).encode(geo))?;
        dev.write_block(geo.root_index(), &root.encode(geo))?;
        dev.write_block(geo.superblock_index(), &Superblock::initial(geo).encode(geo))?;
        dev.sync()?;
        info!(
            block_size = geo.block_size(),
            block_count = geo.block_count(),
            owner = %caller.uid,
            "formatted volume"
        );
        Ok(())
    }

    /// Mount `dev`, expected to hold a filesystem with geometry `geo`.
    ///
    /// Verifies the superblock against the supplied geometry, loads the
    /// bitvector, and rebuilds the registry by a pre-order walk of the
    /// folder tree (parents are inserted before their children).
    pub fn mount_device(dev: D, geo: Geometry) -> Result<Self> {
        if dev.block_size() != geo.block_size() || dev.block_count() != geo.block_count() {
            return Err(CifsError::NotAFilesystem(
                "device geometry does not match the expected geometry".into(),
            ));
        }
        let buf = dev.read_block(geo.superblock_index())?;
        let superblock = Superblock::decode(buf.as_slice())
            .map_err(|e| CifsError::NotAFilesystem(e.to_string()))?;
        if superblock.block_size != geo.block_size()
            || superblock.block_count != geo.block_count()
            || superblock.root_index != geo.root_index()
        {
            return Err(CifsError::NotAFilesystem(
                "superblock disagrees with the expected geometry".into(),
            ));
        }

        let bitvector = BitVector::load(&dev, geo)?;
        let mut registry = Registry::new();
        let root_buf = dev.read_block(superblock.root_index)?;
        let root_desc =
            Descriptor::decode(root_buf.as_slice()).map_err(|e| corrupt(superblock.root_index, e))?;
        if root_desc.kind != FileKind::Folder {
            return Err(CifsError::NotAFilesystem(
                "root descriptor is not a folder".into(),
            ));
        }
        let root_content = root_desc.content;
        let root = registry.insert(root_desc, None)?;

        let mut session = Self {
            dev,
            geo,
            superblock,
            bitvector,
            registry,
            callers: HashMap::new(),
            root,
        };

        let mut stack = vec![(root, root_content)];
        while let Some((folder, content)) = stack.pop() {
            for child_at in session.chain_refs(content)? {
                let child = session.read_descriptor(child_at)?;
                let child_kind = child.kind;
                let child_content = child.content;
                // Two siblings with the same name means the volume itself is
                // damaged, not that a caller raced a create.
                let handle = session
                    .registry
                    .insert(child, Some(folder))
                    .map_err(|_| CifsError::CorruptBlock {
                        block: child_at.0,
                        detail: "duplicate name within one folder".into(),
                    })?;
                if child_kind == FileKind::Folder {
                    stack.push((handle, child_content));
                }
            }
        }
        info!(
            entries = session.registry.len(),
            next_id = %session.superblock.next_id,
            "mounted volume"
        );
        Ok(session)
    }

    /// Persist the superblock, flush the device, and consume the session.
    pub fn unmount(self) -> Result<()> {
        self.dev.write_block(
            self.geo.superblock_index(),
            &self.superblock.encode(self.geo),
        )?;
        self.dev.sync()?;
        info!(next_id = %self.superblock.next_id, "unmounted volume");
        Ok(())
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    /// Handle of the root folder.
    #[must_use]
    pub fn root(&self) -> FileHandle {
        self.root
    }

    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.geo
    }

    /// Free blocks remaining in the pool.
    #[must_use]
    pub fn free_blocks(&self) -> usize {
        self.bitvector.count_free()
    }

    /// The caller's current working folder, defaulting to root.
    #[must_use]
    pub fn current_folder(&self, caller: &Caller) -> FileHandle {
        self.callers
            .get(&caller.uid)
            .and_then(|record| record.cwd)
            .unwrap_or(self.root)
    }

    /// Point the caller's session at a new working folder.
    pub fn set_current_folder(&mut self, caller: &Caller, handle: FileHandle) -> Result<()> {
        let entry = self
            .registry
            .get(handle)
            .ok_or_else(|| CifsError::NotFound(format!("handle {handle}")))?;
        if entry.descriptor.kind != FileKind::Folder {
            return Err(CifsError::NotFound(format!(
                "handle {handle} is not a folder"
            )));
        }
        self.callers.entry(caller.uid).or_default().cwd = Some(handle);
        Ok(())
    }

    /// Resolve `name` under the folder `parent`.
    pub fn lookup(&self, parent: FileHandle, name: &str) -> Result<FileHandle> {
        if self.registry.get(parent).is_none() {
            return Err(CifsError::NotFound(format!("handle {parent}")));
        }
        self.registry
            .lookup(Some(parent), name)
            .ok_or_else(|| CifsError::NotFound(name.to_owned()))
    }

    /// Copy of the descriptor behind `handle`. Side-effect free.
    pub fn get_info(&self, handle: FileHandle) -> Result<Descriptor> {
        self.registry
            .get(handle)
            .map(|entry| entry.descriptor.clone())
            .ok_or_else(|| CifsError::NotFound(format!("handle {handle}")))
    }

    // ── Operations ──────────────────────────────────────────────────────────

    /// Create a file or folder named `name` under the folder `parent`.
    ///
    /// The caller must hold `parent` open. The new entry's identifier comes
    /// from the superblock counter and is never reused; its rights are the
    /// kind's full mode masked by the caller's umask.
    pub fn create(
        &mut self,
        caller: &Caller,
        parent: FileHandle,
        name: &str,
        kind: FileKind,
    ) -> Result<FileHandle> {
        let name = FileName::new(name).map_err(|e| CifsError::InvalidName(e.to_string()))?;
        // The parent must be a folder the caller holds open.
        let parent_desc = {
            let entry = self.registry.get(parent).ok_or(CifsError::NotOpen)?;
            if entry.descriptor.kind != FileKind::Folder {
                return Err(CifsError::NotOpen);
            }
            entry.descriptor.clone()
        };
        if self.open_mode(caller, parent).is_none() {
            return Err(CifsError::NotOpen);
        }
        if self.registry.lookup(Some(parent), name.as_str()).is_some() {
            return Err(CifsError::Duplicate);
        }

        // Locate the parent index slot the child reference will land in,
        // then preflight the allocation so failures happen before any
        // mutation reaches the volume.
        let (slot_block, mut slot_index, free_slot) = self.find_append_slot(parent_desc.content)?;
        let child_blocks = 1 + usize::from(kind == FileKind::Folder);
        let free = self.bitvector.count_free();
        if free < child_blocks {
            return Err(CifsError::AllocationExhausted);
        }
        if free_slot.is_none() && free < child_blocks + 1 {
            return Err(CifsError::DirectoryFull);
        }

        let now = now_unix();
        let full_mode = match kind {
            FileKind::Folder => 0o777,
            FileKind::File => 0o666,
        };
        let desc_block = self.bitvector.allocate(&self.dev)?;
        let content = match kind {
            FileKind::Folder => {
                let index_block = self.bitvector.allocate(&self.dev)?;
                self.dev
                    .write_block(index_block, &IndexBlock::empty(self.geo).encode(self.geo))?;
                index_block
            }
            FileKind::File => self.geo.sentinel(),
        };
        let child = Descriptor {
            id: self.superblock.next_id,
            kind,
            name,
            created: now,
            accessed: now,
            modified: now,
            rights: AccessRights(full_mode & !caller.umask),
            owner: caller.uid,
            size: 0,
            content,
            parent: parent_desc.this,
            this: desc_block,
        };
        self.dev.write_block(desc_block, &child.encode(self.geo))?;

        // Link the child into the parent's index chain.
        match free_slot {
            Some(slot) => {
                slot_index.set_slot(slot, desc_block);
                self.dev
                    .write_block(slot_block, &slot_index.encode(self.geo))?;
            }
            None => {
                let continuation = self.bitvector.allocate(&self.dev)?;
                let mut cont_index = IndexBlock::empty(self.geo);
                cont_index.set_slot(0, desc_block);
                self.dev
                    .write_block(continuation, &cont_index.encode(self.geo))?;
                slot_index.set_chain(continuation);
                self.dev
                    .write_block(slot_block, &slot_index.encode(self.geo))?;
            }
        }

        let mut updated_parent = parent_desc;
        updated_parent.size += 1;
        updated_parent.modified = now;
        self.dev
            .write_block(updated_parent.this, &updated_parent.encode(self.geo))?;

        self.superblock.next_id = FileId(self.superblock.next_id.0 + 1);

        // Volume state is durable; now update the caches.
        if let Some(entry) = self.registry.get_mut(parent) {
            entry.descriptor = updated_parent;
        }
        let id = child.id;
        let handle = self.registry.insert(child, Some(parent))?;
        debug!(%handle, %id, parent = %parent, "created entry");
        Ok(handle)
    }

    /// Delete the file or empty folder behind `handle`.
    ///
    /// Freed blocks are only unmarked in the bitvector; their content is
    /// left in place until reallocation overwrites it.
    pub fn delete(&mut self, caller: &Caller, handle: FileHandle) -> Result<()> {
        let (desc, parent) = {
            let entry = self
                .registry
                .get(handle)
                .ok_or_else(|| CifsError::NotFound(format!("handle {handle}")))?;
            let Some(parent) = entry.parent else {
                // The root folder is not deletable.
                return Err(CifsError::AccessDenied);
            };
            if entry.open_refs > 0 {
                return Err(CifsError::InUse);
            }
            (entry.descriptor.clone(), parent)
        };
        if desc.kind == FileKind::Folder && desc.size > 0 {
            return Err(CifsError::NotEmpty);
        }
        check_owner_access(caller, &desc, AccessMode::Write)?;

        // Everything the entry occupies (content chain for files, the empty
        // index chain for folders, the descriptor block), collected while
        // still reachable.
        let mut to_release = Vec::new();
        if desc.content != self.geo.sentinel() {
            to_release.extend(self.chain_refs(desc.content)?);
            to_release.extend(self.chain_blocks(desc.content)?);
        }
        to_release.push(desc.this);

        // Unlink from the parent's index chain.
        let parent_desc = self
            .registry
            .get(parent)
            .map(|entry| entry.descriptor.clone())
            .ok_or_else(|| CifsError::NotFound(format!("handle {parent}")))?;
        self.clear_chain_slot(parent_desc.content, desc.this)?;

        let mut updated_parent = parent_desc;
        updated_parent.size = updated_parent.size.saturating_sub(1);
        updated_parent.modified = now_unix();
        self.dev
            .write_block(updated_parent.this, &updated_parent.encode(self.geo))?;

        // The unlink is durable; bring the caches in line before releasing
        // anything, so a failed bitmap write-back below can only leak the
        // entry's blocks, never leave the registry serving a freed chain.
        if let Some(entry) = self.registry.get_mut(parent) {
            entry.descriptor = updated_parent;
        }
        self.registry.remove(handle);
        // Working-folder references to the removed entry fall back to root.
        for record in self.callers.values_mut() {
            if record.cwd == Some(handle) {
                record.cwd = None;
            }
        }

        for block in to_release {
            self.bitvector.release(&self.dev, block)?;
        }
        debug!(%handle, id = %desc.id, "deleted entry");
        Ok(())
    }

    /// Open `handle` for `desired` access. Opens are exclusive: a second
    /// open of the same entry fails while the first is outstanding,
    /// regardless of caller or mode.
    pub fn open(
        &mut self,
        caller: &Caller,
        handle: FileHandle,
        desired: AccessMode,
    ) -> Result<FileHandle> {
        {
            let entry = self
                .registry
                .get(handle)
                .ok_or_else(|| CifsError::NotFound(format!("handle {handle}")))?;
            if entry.open_refs > 0 {
                return Err(CifsError::OpenConflict);
            }
            check_owner_access(caller, &entry.descriptor, desired)?;
        }
        if let Some(entry) = self.registry.get_mut(handle) {
            entry.open_refs += 1;
        }
        self.callers
            .entry(caller.uid)
            .or_default()
            .open
            .push(OpenFile {
                handle,
                mode: desired,
            });
        debug!(%handle, uid = %caller.uid, ?desired, "opened entry");
        Ok(handle)
    }

    /// Close a previously opened handle. `AccessDenied` when the caller has
    /// no matching open-file entry.
    pub fn close(&mut self, caller: &Caller, handle: FileHandle) -> Result<()> {
        let record = self
            .callers
            .get_mut(&caller.uid)
            .ok_or(CifsError::AccessDenied)?;
        let at = record
            .open
            .iter()
            .position(|open| open.handle == handle)
            .ok_or(CifsError::AccessDenied)?;
        record.open.remove(at);
        if let Some(entry) = self.registry.get_mut(handle) {
            entry.open_refs = entry.open_refs.saturating_sub(1);
        }
        debug!(%handle, uid = %caller.uid, "closed entry");
        Ok(())
    }

    /// Read the whole content of an open file.
    pub fn read(&self, caller: &Caller, handle: FileHandle) -> Result<Vec<u8>> {
        let entry = self
            .registry
            .get(handle)
            .ok_or_else(|| CifsError::NotFound(format!("handle {handle}")))?;
        let desc = &entry.descriptor;
        if desc.kind != FileKind::File {
            return Err(CifsError::AccessDenied);
        }
        let mode = self
            .open_mode(caller, handle)
            .ok_or(CifsError::AccessDenied)?;
        if !mode.wants_read() {
            return Err(CifsError::AccessDenied);
        }

        let size = usize::try_from(desc.size).unwrap_or(usize::MAX);
        let mut out = Vec::with_capacity(size);
        let mut remaining = size;
        if desc.content != self.geo.sentinel() {
            for data_at in self.chain_refs(desc.content)? {
                if remaining == 0 {
                    break;
                }
                let buf = self.dev.read_block(data_at)?;
                let block =
                    Block::decode(buf.as_slice(), self.geo).map_err(|e| corrupt(data_at, e))?;
                let Block::Data(payload) = block else {
                    return Err(CifsError::CorruptBlock {
                        block: data_at.0,
                        detail: "expected a data block in a file's index chain".into(),
                    });
                };
                let take = remaining.min(self.geo.data_capacity());
                out.extend_from_slice(&payload[..take]);
                remaining -= take;
            }
        }
        Ok(out)
    }

    /// Replace the whole content of an open file, copy-on-write.
    ///
    /// New data and index blocks are written first, then the descriptor is
    /// swung over in one block write, then the old chain is released. A
    /// failure before the swap leaves the old content untouched; a failure
    /// after it can leak blocks but never corrupts.
    pub fn write(&mut self, caller: &Caller, handle: FileHandle, content: &[u8]) -> Result<()> {
        let desc = {
            let entry = self
                .registry
                .get(handle)
                .ok_or_else(|| CifsError::NotFound(format!("handle {handle}")))?;
            if entry.descriptor.kind != FileKind::File {
                return Err(CifsError::AccessDenied);
            }
            entry.descriptor.clone()
        };
        let mode = self
            .open_mode(caller, handle)
            .ok_or(CifsError::AccessDenied)?;
        if !mode.wants_write() {
            return Err(CifsError::AccessDenied);
        }

        let cap = self.geo.data_capacity();
        let fanout = self.geo.index_fanout();
        let data_blocks = content.len().div_ceil(cap);
        let index_blocks = if data_blocks == 0 {
            0
        } else {
            data_blocks.div_ceil(fanout)
        };
        if self.bitvector.count_free() < data_blocks + index_blocks {
            return Err(CifsError::AllocationExhausted);
        }

        // Phase 1: new content on fresh blocks.
        let mut data_refs = Vec::with_capacity(data_blocks);
        for chunk in content.chunks(cap) {
            let at = self.bitvector.allocate(&self.dev)?;
            self.dev.write_block(at, &encode_data(chunk, self.geo))?;
            data_refs.push(at);
        }
        let mut index_refs = Vec::with_capacity(index_blocks);
        for _ in 0..index_blocks {
            index_refs.push(self.bitvector.allocate(&self.dev)?);
        }
        for (i, &at) in index_refs.iter().enumerate() {
            let mut index = IndexBlock::empty(self.geo);
            let start = i * fanout;
            let end = (start + fanout).min(data_refs.len());
            for (slot, &data_at) in data_refs[start..end].iter().enumerate() {
                index.set_slot(slot, data_at);
            }
            if i + 1 < index_refs.len() {
                index.set_chain(index_refs[i + 1]);
            }
            self.dev.write_block(at, &index.encode(self.geo))?;
        }

        // Collect the old chain before the swap makes it unreachable.
        let old_blocks = if desc.content != self.geo.sentinel() {
            let mut blocks = self.chain_refs(desc.content)?;
            blocks.extend(self.chain_blocks(desc.content)?);
            blocks
        } else {
            Vec::new()
        };

        // Phase 2: single-block descriptor swap. The cache must follow the
        // swap immediately: once the volume serves the new chain, a failure
        // further down may not leave the registry on the old one.
        let now = now_unix();
        let mut updated = desc;
        updated.content = index_refs.first().copied().unwrap_or(self.geo.sentinel());
        updated.size = content.len() as u64;
        updated.modified = now;
        updated.accessed = now;
        self.dev
            .write_block(updated.this, &updated.encode(self.geo))?;
        let id = updated.id;
        if let Some(entry) = self.registry.get_mut(handle) {
            entry.descriptor = updated;
        }

        // Phase 3: release the superseded chain. A failed write-back here
        // leaks old blocks; it can no longer corrupt anything reachable.
        for block in old_blocks {
            self.bitvector.release(&self.dev, block)?;
        }
        debug!(%handle, %id, bytes = content.len(), "wrote file content");
        Ok(())
    }

    // ── Chain helpers ───────────────────────────────────────────────────────

    fn read_descriptor(&self, at: BlockIndex) -> Result<Descriptor> {
        let buf = self.dev.read_block(at)?;
        Descriptor::decode(buf.as_slice()).map_err(|e| corrupt(at, e))
    }

    fn read_index(&self, at: BlockIndex) -> Result<IndexBlock> {
        let buf = self.dev.read_block(at)?;
        IndexBlock::decode(buf.as_slice(), self.geo).map_err(|e| corrupt(at, e))
    }

    /// All payload references in an index chain, in slot order.
    fn chain_refs(&self, content: BlockIndex) -> Result<Vec<BlockIndex>> {
        let mut refs = Vec::new();
        let mut at = Some(content);
        let mut hops = 0_u32;
        while let Some(cur) = at {
            self.check_chain_hops(cur, &mut hops)?;
            let index = self.read_index(cur)?;
            refs.extend(index.refs());
            at = index.chain();
        }
        Ok(refs)
    }

    /// The index blocks of a chain themselves, in chain order.
    fn chain_blocks(&self, content: BlockIndex) -> Result<Vec<BlockIndex>> {
        let mut blocks = Vec::new();
        let mut at = Some(content);
        let mut hops = 0_u32;
        while let Some(cur) = at {
            self.check_chain_hops(cur, &mut hops)?;
            blocks.push(cur);
            at = self.read_index(cur)?.chain();
        }
        Ok(blocks)
    }

    /// First block in the chain with a free payload slot, or the chain's
    /// last block when every slot is taken (a continuation is needed).
    fn find_append_slot(
        &self,
        content: BlockIndex,
    ) -> Result<(BlockIndex, IndexBlock, Option<usize>)> {
        let mut at = content;
        let mut hops = 0_u32;
        loop {
            self.check_chain_hops(at, &mut hops)?;
            let index = self.read_index(at)?;
            if let Some(slot) = index.first_free_slot() {
                return Ok((at, index, Some(slot)));
            }
            match index.chain() {
                Some(next) => at = next,
                None => return Ok((at, index, None)),
            }
        }
    }

    /// Clear the payload slot holding `target` somewhere in the chain.
    fn clear_chain_slot(&mut self, content: BlockIndex, target: BlockIndex) -> Result<()> {
        let mut at = Some(content);
        let mut hops = 0_u32;
        while let Some(cur) = at {
            self.check_chain_hops(cur, &mut hops)?;
            let mut index = self.read_index(cur)?;
            if let Some(slot) = index.position_of(target) {
                index.clear_slot(slot);
                return self.dev.write_block(cur, &index.encode(self.geo));
            }
            at = index.chain();
        }
        Err(CifsError::CorruptBlock {
            block: content.0,
            detail: format!("child reference {target} missing from folder index chain"),
        })
    }

    /// A chain longer than the volume has blocks must contain a cycle.
    fn check_chain_hops(&self, at: BlockIndex, hops: &mut u32) -> Result<()> {
        *hops += 1;
        if *hops > u32::from(self.geo.block_count()) {
            return Err(CifsError::CorruptBlock {
                block: at.0,
                detail: "index chain cycle".into(),
            });
        }
        Ok(())
    }

    fn open_mode(&self, caller: &Caller, handle: FileHandle) -> Option<AccessMode> {
        self.callers
            .get(&caller.uid)?
            .open
            .iter()
            .find(|open| open.handle == handle)
            .map(|open| open.mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cifs_block::MemBlockDevice;
    use std::sync::Arc;

    const UID: Uid = Uid(1000);

    fn caller() -> Caller {
        Caller::new(UID, 0o022)
    }

    fn mounted(block_count: u16) -> (Session<Arc<MemBlockDevice>>, Caller) {
        let geo = Geometry::new(256, block_count).expect("geometry");
        let dev = Arc::new(MemBlockDevice::new(geo.block_size(), geo.block_count()));
        Session::format_device(&dev, geo, &caller()).expect("format");
        let session = Session::mount_device(dev, geo).expect("mount");
        (session, caller())
    }

    fn open_root(session: &mut Session<Arc<MemBlockDevice>>, caller: &Caller) -> FileHandle {
        let root = session.root();
        session
            .open(caller, root, AccessMode::ReadWrite)
            .expect("open root")
    }

    #[test]
    fn fresh_mount_has_only_root() {
        let (session, _) = mounted(64);
        let info = session.get_info(session.root()).expect("root info");
        assert_eq!(info.id, FileId(0));
        assert_eq!(info.kind, FileKind::Folder);
        assert_eq!(info.name.as_str(), "/");
        assert_eq!(info.size, 0);
        assert_eq!(info.rights, AccessRights(0o755));
    }

    #[test]
    fn create_requires_open_parent() {
        let (mut session, caller) = mounted(64);
        let root = session.root();
        assert!(matches!(
            session.create(&caller, root, "a.txt", FileKind::File),
            Err(CifsError::NotOpen)
        ));
    }

    #[test]
    fn create_sets_ownership_and_masked_rights() {
        let (mut session, caller) = mounted(64);
        let root = open_root(&mut session, &caller);
        let file = session
            .create(&caller, root, "a.txt", FileKind::File)
            .expect("create");
        let info = session.get_info(file).expect("info");
        assert_eq!(info.owner, UID);
        assert_eq!(info.rights, AccessRights(0o644));
        assert_eq!(info.id, FileId(1));
        assert_eq!(info.kind, FileKind::File);
        assert_eq!(info.size, 0);
        // Parent size counts entries.
        assert_eq!(session.get_info(root).expect("root").size, 1);
    }

    #[test]
    fn identifiers_increase_and_are_never_reused() {
        let (mut session, caller) = mounted(64);
        let root = open_root(&mut session, &caller);
        let first = session
            .create(&caller, root, "a.txt", FileKind::File)
            .expect("create");
        let first_id = session.get_info(first).expect("info").id;
        session.delete(&caller, first).expect("delete");
        let second = session
            .create(&caller, root, "b.txt", FileKind::File)
            .expect("create");
        let second_id = session.get_info(second).expect("info").id;
        assert!(second_id > first_id);
    }

    #[test]
    fn duplicate_names_rejected_but_siblings_allowed() {
        let (mut session, caller) = mounted(64);
        let root = open_root(&mut session, &caller);
        let dir_a = session
            .create(&caller, root, "a", FileKind::Folder)
            .expect("a");
        let dir_b = session
            .create(&caller, root, "b", FileKind::Folder)
            .expect("b");
        assert!(matches!(
            session.create(&caller, root, "a", FileKind::Folder),
            Err(CifsError::Duplicate)
        ));

        session.open(&caller, dir_a, AccessMode::Write).expect("open a");
        session.open(&caller, dir_b, AccessMode::Write).expect("open b");
        session
            .create(&caller, dir_a, "same.txt", FileKind::File)
            .expect("in a");
        session
            .create(&caller, dir_b, "same.txt", FileKind::File)
            .expect("in b");
        assert_ne!(
            session.lookup(dir_a, "same.txt").expect("lookup a"),
            session.lookup(dir_b, "same.txt").expect("lookup b")
        );
    }

    #[test]
    fn mount_flags_duplicate_sibling_names_as_corruption() {
        let geo = Geometry::new(256, 64).expect("geometry");
        let dev = Arc::new(MemBlockDevice::new(geo.block_size(), geo.block_count()));
        let caller = caller();
        Session::format_device(&dev, geo, &caller).expect("format");
        let mut session = Session::mount_device(Arc::clone(&dev), geo).expect("mount");
        let root = open_root(&mut session, &caller);
        session
            .create(&caller, root, "a.txt", FileKind::File)
            .expect("a");
        let b = session
            .create(&caller, root, "b.txt", FileKind::File)
            .expect("b");
        let mut forged = session.get_info(b).expect("info");
        session.unmount().expect("unmount");

        // Rewrite the second descriptor in place so two siblings carry the
        // same name, something no create sequence can produce.
        forged.name = FileName::new("a.txt").expect("name");
        dev.write_block(forged.this, &forged.encode(geo)).expect("forge");

        assert!(matches!(
            Session::mount_device(dev, geo),
            Err(CifsError::CorruptBlock { .. })
        ));
    }

    #[test]
    fn invalid_names_rejected() {
        let (mut session, caller) = mounted(64);
        let root = open_root(&mut session, &caller);
        for bad in ["", "a/b", "a\0b"] {
            assert!(matches!(
                session.create(&caller, root, bad, FileKind::File),
                Err(CifsError::InvalidName(_))
            ));
        }
        let long = "x".repeat(129);
        assert!(matches!(
            session.create(&caller, root, &long, FileKind::File),
            Err(CifsError::InvalidName(_))
        ));
    }

    #[test]
    fn delete_refuses_nonempty_folder_then_succeeds() {
        let (mut session, caller) = mounted(64);
        let root = open_root(&mut session, &caller);
        let baseline = session.free_blocks();

        let folder = session
            .create(&caller, root, "dir", FileKind::Folder)
            .expect("folder");
        session.open(&caller, folder, AccessMode::Write).expect("open");
        let inner = session
            .create(&caller, folder, "f.txt", FileKind::File)
            .expect("file");
        session.close(&caller, folder).expect("close");

        assert!(matches!(
            session.delete(&caller, folder),
            Err(CifsError::NotEmpty)
        ));
        session.delete(&caller, inner).expect("delete file");
        session.delete(&caller, folder).expect("delete folder");

        // Every block the pair occupied is back in the pool.
        assert_eq!(session.free_blocks(), baseline);
        assert!(matches!(
            session.lookup(root, "dir"),
            Err(CifsError::NotFound(_))
        ));
    }

    #[test]
    fn delete_open_file_is_in_use() {
        let (mut session, caller) = mounted(64);
        let root = open_root(&mut session, &caller);
        let file = session
            .create(&caller, root, "a.txt", FileKind::File)
            .expect("create");
        session.open(&caller, file, AccessMode::Read).expect("open");
        assert!(matches!(
            session.delete(&caller, file),
            Err(CifsError::InUse)
        ));
        session.close(&caller, file).expect("close");
        session.delete(&caller, file).expect("delete");
    }

    #[test]
    fn root_is_not_deletable() {
        let (mut session, caller) = mounted(64);
        let root = session.root();
        assert!(matches!(
            session.delete(&caller, root),
            Err(CifsError::AccessDenied)
        ));
    }

    #[test]
    fn open_is_exclusive() {
        let (mut session, caller) = mounted(64);
        let root = open_root(&mut session, &caller);
        let file = session
            .create(&caller, root, "a.txt", FileKind::File)
            .expect("create");
        session.open(&caller, file, AccessMode::Read).expect("open");
        assert!(matches!(
            session.open(&caller, file, AccessMode::Read),
            Err(CifsError::OpenConflict)
        ));
        session.close(&caller, file).expect("close");
        session.open(&caller, file, AccessMode::Read).expect("reopen");
    }

    #[test]
    fn open_enforces_owner_and_mode_bits() {
        let (mut session, caller) = mounted(64);
        let root = open_root(&mut session, &caller);
        let file = session
            .create(&caller, root, "a.txt", FileKind::File)
            .expect("create");

        let stranger = Caller::new(Uid(2000), 0o022);
        assert!(matches!(
            session.open(&stranger, file, AccessMode::Read),
            Err(CifsError::AccessDenied)
        ));

        // 0o644 grants the owner read and write; a read-only descriptor
        // must refuse a write open.
        let readonly_caller = Caller::new(UID, 0o222);
        let readonly = session
            .create(&readonly_caller, root, "ro.txt", FileKind::File)
            .expect("create");
        assert!(matches!(
            session.open(&caller, readonly, AccessMode::Write),
            Err(CifsError::AccessDenied)
        ));
        session
            .open(&caller, readonly, AccessMode::Read)
            .expect("read open");
    }

    #[test]
    fn close_without_open_is_denied() {
        let (mut session, caller) = mounted(64);
        let root = open_root(&mut session, &caller);
        let file = session
            .create(&caller, root, "a.txt", FileKind::File)
            .expect("create");
        assert!(matches!(
            session.close(&caller, file),
            Err(CifsError::AccessDenied)
        ));
    }

    #[test]
    fn write_then_read_round_trips() {
        let (mut session, caller) = mounted(64);
        let root = open_root(&mut session, &caller);
        let file = session
            .create(&caller, root, "a.txt", FileKind::File)
            .expect("create");
        session
            .open(&caller, file, AccessMode::ReadWrite)
            .expect("open");

        // Spans several 254-byte data blocks.
        let content: Vec<u8> = (0..1000_u32).map(|i| (i % 251) as u8).collect();
        session.write(&caller, file, &content).expect("write");
        assert_eq!(session.read(&caller, file).expect("read"), content);
        assert_eq!(
            session.get_info(file).expect("info").size,
            content.len() as u64
        );
    }

    #[test]
    fn rewrite_replaces_content_and_frees_old_blocks() {
        let (mut session, caller) = mounted(64);
        let root = open_root(&mut session, &caller);
        let file = session
            .create(&caller, root, "a.txt", FileKind::File)
            .expect("create");
        session
            .open(&caller, file, AccessMode::ReadWrite)
            .expect("open");

        session.write(&caller, file, &[1_u8; 600]).expect("first");
        let after_first = session.free_blocks();
        session.write(&caller, file, &[2_u8; 600]).expect("second");
        // Same size, same footprint: the old chain was released.
        assert_eq!(session.free_blocks(), after_first);
        assert_eq!(session.read(&caller, file).expect("read"), vec![2_u8; 600]);
    }

    #[test]
    fn empty_write_leaves_no_content_blocks() {
        let (mut session, caller) = mounted(64);
        let root = open_root(&mut session, &caller);
        let file = session
            .create(&caller, root, "a.txt", FileKind::File)
            .expect("create");
        session
            .open(&caller, file, AccessMode::ReadWrite)
            .expect("open");
        session.write(&caller, file, b"something").expect("write");
        let before_empty = session.free_blocks();

        session.write(&caller, file, b"").expect("empty write");
        let info = session.get_info(file).expect("info");
        assert_eq!(info.size, 0);
        assert_eq!(info.content, session.geometry().sentinel());
        assert!(session.read(&caller, file).expect("read").is_empty());
        assert!(session.free_blocks() > before_empty);
    }

    #[test]
    fn write_spanning_index_chain_continuation() {
        // 126 payload slots per index block; 127 data blocks force a
        // two-block index chain.
        let (mut session, caller) = mounted(200);
        let root = open_root(&mut session, &caller);
        let file = session
            .create(&caller, root, "big.bin", FileKind::File)
            .expect("create");
        session
            .open(&caller, file, AccessMode::ReadWrite)
            .expect("open");

        let cap = session.geometry().data_capacity();
        let fanout = session.geometry().index_fanout();
        let content: Vec<u8> = (0..cap * (fanout + 1)).map(|i| (i % 241) as u8).collect();
        session.write(&caller, file, &content).expect("write");
        assert_eq!(session.read(&caller, file).expect("read"), content);
    }

    #[test]
    fn oversized_write_fails_before_any_mutation() {
        let (mut session, caller) = mounted(16);
        let root = open_root(&mut session, &caller);
        let file = session
            .create(&caller, root, "a.txt", FileKind::File)
            .expect("create");
        session
            .open(&caller, file, AccessMode::ReadWrite)
            .expect("open");
        session.write(&caller, file, b"old content").expect("write");
        let free_before = session.free_blocks();

        // 16-block volume cannot hold ~100 data blocks.
        let huge = vec![0_u8; 25_000];
        assert!(matches!(
            session.write(&caller, file, &huge),
            Err(CifsError::AllocationExhausted)
        ));
        assert_eq!(session.free_blocks(), free_before);
        assert_eq!(
            session.read(&caller, file).expect("read"),
            b"old content".to_vec()
        );
    }

    #[test]
    fn read_requires_read_access_mode() {
        let (mut session, caller) = mounted(64);
        let root = open_root(&mut session, &caller);
        let file = session
            .create(&caller, root, "a.txt", FileKind::File)
            .expect("create");
        session.open(&caller, file, AccessMode::Write).expect("open");
        assert!(matches!(
            session.read(&caller, file),
            Err(CifsError::AccessDenied)
        ));
        assert!(matches!(
            session.write(&caller, file, b"ok"),
            Ok(())
        ));
    }

    #[test]
    fn folder_create_spills_into_continuation_block() {
        // 126 payload slots per index block on 256-byte blocks; the 127th
        // child lands in a freshly chained continuation block.
        let (mut session, caller) = mounted(300);
        let root = open_root(&mut session, &caller);
        let fanout = session.geometry().index_fanout();
        for i in 0..=fanout {
            let name = format!("f{i}");
            session
                .create(&caller, root, &name, FileKind::File)
                .expect("create");
        }
        assert_eq!(session.get_info(root).expect("root").size, fanout as u64 + 1);
        let last = session
            .lookup(root, &format!("f{fanout}"))
            .expect("lookup last");
        session.delete(&caller, last).expect("delete last");
        assert_eq!(session.get_info(root).expect("root").size, fanout as u64);
    }

    #[test]
    fn current_folder_defaults_to_root_and_resets_on_delete() {
        let (mut session, caller) = mounted(64);
        let root = open_root(&mut session, &caller);
        assert_eq!(session.current_folder(&caller), root);

        let folder = session
            .create(&caller, root, "dir", FileKind::Folder)
            .expect("folder");
        session.set_current_folder(&caller, folder).expect("set cwd");
        assert_eq!(session.current_folder(&caller), folder);

        let file = session
            .create(&caller, root, "a.txt", FileKind::File)
            .expect("file");
        assert!(matches!(
            session.set_current_folder(&caller, file),
            Err(CifsError::NotFound(_))
        ));

        session.delete(&caller, folder).expect("delete");
        assert_eq!(session.current_folder(&caller), root);
    }

    #[test]
    fn lookup_missing_name_is_not_found() {
        let (session, _) = mounted(64);
        assert!(matches!(
            session.lookup(session.root(), "ghost"),
            Err(CifsError::NotFound(_))
        ));
    }

    #[test]
    fn mount_rejects_blank_device() {
        let geo = Geometry::new(256, 64).expect("geometry");
        let dev = Arc::new(MemBlockDevice::new(geo.block_size(), geo.block_count()));
        assert!(matches!(
            Session::mount_device(dev, geo),
            Err(CifsError::NotAFilesystem(_))
        ));
    }

    #[test]
    fn mount_rejects_geometry_mismatch() {
        let geo = Geometry::new(256, 64).expect("geometry");
        let dev = Arc::new(MemBlockDevice::new(geo.block_size(), geo.block_count()));
        Session::format_device(&dev, geo, &caller()).expect("format");
        let other = Geometry::new(256, 32).expect("geometry");
        assert!(matches!(
            Session::mount_device(dev, other),
            Err(CifsError::NotAFilesystem(_))
        ));
    }

    #[test]
    fn remount_rebuilds_registry_from_volume() {
        let geo = Geometry::new(256, 64).expect("geometry");
        let dev = Arc::new(MemBlockDevice::new(geo.block_size(), geo.block_count()));
        Session::format_device(&dev, geo, &caller()).expect("format");

        let mut session = Session::mount_device(Arc::clone(&dev), geo).expect("mount");
        let caller = caller();
        let root = open_root(&mut session, &caller);
        let folder = session
            .create(&caller, root, "docs", FileKind::Folder)
            .expect("folder");
        session.open(&caller, folder, AccessMode::Write).expect("open");
        let file = session
            .create(&caller, folder, "note.txt", FileKind::File)
            .expect("file");
        session.open(&caller, file, AccessMode::Write).expect("open file");
        session.write(&caller, file, b"persisted").expect("write");
        session.unmount().expect("unmount");

        let mut session = Session::mount_device(dev, geo).expect("remount");
        let root = session.root();
        let folder = session.lookup(root, "docs").expect("folder survives");
        let file = session.lookup(folder, "note.txt").expect("file survives");
        session.open(&caller, file, AccessMode::Read).expect("open");
        assert_eq!(
            session.read(&caller, file).expect("read"),
            b"persisted".to_vec()
        );

        // Open-file state did not survive the remount, and the id counter did.
        session.close(&caller, file).expect("close");
        session.open(&caller, root, AccessMode::ReadWrite).expect("reopen root");
        let later = session
            .create(&caller, root, "later", FileKind::Folder)
            .expect("create");
        assert_eq!(session.get_info(later).expect("info").id, FileId(3));
    }
}
