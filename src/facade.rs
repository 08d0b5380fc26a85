//! Filesystem operations facade (§4.11, C11): the kernel-filesystem
//! contract. Each operation resolves ids via the inode graph, may trigger
//! hydration via the download manager, records changes via the metadata
//! store and upload manager, and updates status via the status engine.

use std::sync::Arc;

use crate::cache::ContentCache;
use crate::concurrency::OpContext;
use crate::download::DownloadManager;
use crate::error::{Error, Result};
use crate::ids::{canonical_name, is_local, IdTable};
use crate::inode::{Inode, InodeGraph};
use crate::metadata::{
    now_millis, ItemKind, LifecycleState, MetadataEntry, MetadataStore, OfflineChangeKind, OfflineChangeRecord,
    OverlayPolicy, PinMode,
};
use crate::overlay::{CollisionOutcome, OverlayRegistry};
use crate::remote::RemoteClient;
use crate::status::{FileStatus, StatusEngine};
use crate::upload::{UploadManager, UploadPriority};

/// Derived-status xattr name (§6). `<ns>` is fixed to `cloudfs` for this
/// implementation.
pub const XATTR_STATUS: &str = "user.cloudfs.status";
/// Last-error xattr name, present only while status is `Error` (§6).
pub const XATTR_ERROR: &str = "user.cloudfs.error";

/// The filesystem operations facade (C11). Owns every other component and
/// lives for the process (§3.4).
pub struct Facade {
    ids: Arc<IdTable>,
    inodes: Arc<InodeGraph>,
    metadata: Arc<MetadataStore>,
    cache: ContentCache,
    remote: Arc<dyn RemoteClient>,
    downloads: Arc<DownloadManager>,
    uploads: Arc<UploadManager>,
    status: Arc<StatusEngine>,
    overlay: Arc<OverlayRegistry>,
}

impl Facade {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ids: Arc<IdTable>,
        inodes: Arc<InodeGraph>,
        metadata: Arc<MetadataStore>,
        cache: ContentCache,
        remote: Arc<dyn RemoteClient>,
        downloads: Arc<DownloadManager>,
        uploads: Arc<UploadManager>,
        status: Arc<StatusEngine>,
        overlay: Arc<OverlayRegistry>,
    ) -> Self {
        Self {
            ids,
            inodes,
            metadata,
            cache,
            remote,
            downloads,
            uploads,
            status,
            overlay,
        }
    }

    /// Resolve one name within `parent_id`, honoring the overlay's
    /// collision policy (§4.12). Never calls remote (§4.2 local-first).
    pub fn lookup(&self, parent_id: &str, name: &str) -> Result<Inode> {
        let remote = self.inodes.get_child(parent_id, name)?;
        match self.overlay.resolve_collision(parent_id, name, remote.is_some()) {
            CollisionOutcome::VirtualOnly => self
                .overlay
                .children_of(parent_id)
                .into_iter()
                .find(|i| canonical_name(&i.name) == canonical_name(name))
                .ok_or(Error::NotFound),
            CollisionOutcome::RemoteOnly | CollisionOutcome::Both => remote.ok_or(Error::NotFound),
        }
    }

    /// List `dir_id`'s children with virtual entries merged in (§4.11:
    /// "must return virtual children interleaved with real ones"). Virtual
    /// entries are listed first, in registration order, per the frozen
    /// ordering decision; a `local-wins` virtual entry suppresses the
    /// remote entry of the same name, and vice versa for `remote-wins`.
    pub fn readdir(&self, dir_id: &str) -> Result<Vec<Inode>> {
        let remote_children = self.inodes.get_children_id(dir_id)?;
        let mut out = Vec::with_capacity(remote_children.len());
        let mut shown = std::collections::HashSet::new();

        for virtual_entry in self.overlay.children_of(dir_id) {
            let canonical = canonical_name(&virtual_entry.name);
            let remote_exists = remote_children.contains_key(&canonical);
            if matches!(
                self.overlay.resolve_collision(dir_id, &virtual_entry.name, remote_exists),
                CollisionOutcome::VirtualOnly
            ) {
                shown.insert(canonical);
                out.push(virtual_entry);
            }
        }
        for (canonical, inode) in remote_children {
            if !shown.contains(&canonical) {
                out.push(inode);
            }
        }
        Ok(out)
    }

    /// Trigger hydration if `id` is cold (`GHOST`), then wait for it to
    /// complete. A no-op for virtual and already-hydrated entries.
    pub async fn open(&self, id: &str, ctx: &OpContext) -> Result<()> {
        if self.overlay.is_virtual(id) {
            return Ok(());
        }
        let entry = self.metadata.get(id)?.ok_or(Error::NotFound)?;
        if entry.state != LifecycleState::Ghost {
            return Ok(());
        }
        self.metadata.transition(id, LifecycleState::Hydrating)?;
        let handle = self.downloads.queue_download(id);
        tokio::select! {
            _ = ctx.cancelled() => Err(Error::Cancelled),
            state = handle.wait() => match state {
                crate::download::DownloadState::Completed => Ok(()),
                crate::download::DownloadState::Cancelled => Err(Error::Cancelled),
                _ => Err(Error::RemoteTransient(
                    handle.last_error().await.unwrap_or_else(|| "download failed".into()),
                )),
            },
        }
    }

    /// Read `len` bytes at `offset`, hydrating first if necessary.
    pub async fn read(&self, id: &str, offset: u64, len: usize, ctx: &OpContext) -> Result<Vec<u8>> {
        if let Some(bytes) = self.overlay.read_content(id) {
            return Ok(slice_at(&bytes, offset, len));
        }
        self.open(id, ctx).await?;
        let bytes = self.cache.read_all(id)?;
        self.cache.note_access(id);
        Ok(slice_at(&bytes, offset, len))
    }

    /// Write `data` at `offset`, growing the cached blob as needed, and
    /// queue the result for upload (§4.6, §3.3 `HYDRATED -> DIRTY_LOCAL`).
    pub async fn write(&self, id: &str, offset: u64, data: &[u8], ctx: &OpContext) -> Result<usize> {
        if self.overlay.is_virtual(id) {
            return Err(Error::Internal("virtual entries are read-only".into()));
        }
        self.open(id, ctx).await?;

        let mut bytes = self.cache.read_all(id).unwrap_or_default();
        let end = offset as usize + data.len();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[offset as usize..end].copy_from_slice(data);
        self.cache.insert(id, &bytes)?;

        let entry = self.metadata.update(id, |e| {
            e.size = bytes.len() as u64;
        })?;
        if entry.state != LifecycleState::DirtyLocal {
            self.metadata.transition(id, LifecycleState::DirtyLocal)?;
        }
        // Unsaved local bytes must survive eviction pressure until they are
        // uploaded (§4.4): pin the slot for the lifetime of DIRTY_LOCAL.
        self.cache.set_pinned(id, true);
        let parent_id = entry.parent_id.clone().unwrap_or_else(|| self.inodes.root_id().to_string());
        self.uploads
            .queue_upload(id, UploadPriority::Normal, bytes.len() as u64, &parent_id, &entry.name)?;
        Ok(data.len())
    }

    /// Create a new local-only entry under `parent_id` (§4.1: locally
    /// minted ids get the `local-` prefix until an upload promotes them).
    pub fn create(&self, parent_id: &str, name: &str, kind: ItemKind) -> Result<Inode> {
        if name.is_empty() {
            return Err(Error::Internal("entry name must be non-empty".into()));
        }
        if self.inodes.get_child(parent_id, name)?.is_some() {
            return Err(Error::AlreadyExists);
        }
        let id = self.ids.mint_local_id();
        let mut entry = MetadataEntry::new_root(&id, now_millis());
        entry.name = name.to_string();
        entry.kind = kind;
        entry.parent_id = Some(parent_id.to_string());
        entry.state = LifecycleState::Hydrated;
        entry.pin_mode = PinMode::Never;
        entry.overlay_policy = OverlayPolicy::RemoteWins;
        self.metadata.save(&entry)?;
        if kind == ItemKind::File {
            self.cache.insert(&id, &[])?;
        }
        self.inodes.insert_id(&id, Inode::from_entry(&entry));
        self.inodes.insert_child(parent_id, &id)?;
        self.metadata.record_offline_change(&OfflineChangeRecord {
            id: id.clone(),
            kind: OfflineChangeKind::Create,
            timestamp: now_millis(),
        })?;
        Ok(Inode::from_entry(&entry))
    }

    /// Remove `name` from `parent_id`. Directories must be empty (§4.2).
    /// Propagates the deletion to remote when `id` is remote-assigned;
    /// falls back to an offline-change record when the remote is
    /// unreachable (§4.6's offline-queueing pattern, applied to deletes).
    pub async fn unlink(&self, parent_id: &str, name: &str, ctx: &OpContext) -> Result<()> {
        let child = self.inodes.get_child(parent_id, name)?.ok_or(Error::NotFound)?;
        if child.is_directory() && !child.children.is_empty() {
            return Err(Error::NotEmpty);
        }
        if !is_local(&child.id) {
            match self.remote.delete_item(ctx, &child.id).await {
                Ok(()) => {}
                Err(Error::Offline) => {
                    self.metadata.record_offline_change(&OfflineChangeRecord {
                        id: child.id.clone(),
                        kind: OfflineChangeKind::Delete,
                        timestamp: now_millis(),
                    })?;
                }
                Err(e) => return Err(e),
            }
        }
        let _ = self.cache.delete(&child.id);
        self.inodes.delete_id(&child.id)?;
        self.status.clear_explicit(&child.id);
        Ok(())
    }

    /// Move/rename a child (§4.2 `move_path`). The remote port named in
    /// this crate's scope has no rename endpoint, so the change is applied
    /// locally and recorded as an offline change; a future provider
    /// integration drains it the way `process_offline_changes` drains
    /// uploads.
    pub fn rename(&self, old_parent: &str, new_parent: &str, old_name: &str, new_name: &str) -> Result<()> {
        let child = self.inodes.get_child(old_parent, old_name)?.ok_or(Error::NotFound)?;
        if self.inodes.get_child(new_parent, new_name)?.is_some() {
            return Err(Error::AlreadyExists);
        }
        self.inodes.move_path(old_parent, new_parent, old_name, new_name)?;
        self.metadata.record_offline_change(&OfflineChangeRecord {
            id: child.id,
            kind: OfflineChangeKind::Move,
            timestamp: now_millis(),
        })?;
        Ok(())
    }

    pub fn getattr(&self, id: &str) -> Result<Inode> {
        if let Some(virtual_inode) = self.overlay.get(id) {
            return Ok(virtual_inode);
        }
        self.inodes.get_id(id)?.ok_or(Error::NotFound)
    }

    /// Truncate/extend `id`'s content to `size` bytes, if given.
    pub fn setattr(&self, id: &str, size: Option<u64>) -> Result<Inode> {
        if let Some(size) = size {
            let mut bytes = self.cache.read_all(id).unwrap_or_default();
            bytes.resize(size as usize, 0);
            self.cache.insert(id, &bytes)?;
            self.metadata.update(id, |e| e.size = size)?;
            if let Some(entry) = self.metadata.get(id)? {
                if entry.state == LifecycleState::Hydrated {
                    self.metadata.transition(id, LifecycleState::DirtyLocal)?;
                }
            }
        }
        self.getattr(id)
    }

    /// The two derived xattrs (§6) are synthesized on read, never stored;
    /// anything else falls through to the warm inode's in-memory xattr map
    /// (never persisted — the limited-xattr scope this crate supports).
    pub fn getxattr(&self, id: &str, name: &str) -> Result<Option<Vec<u8>>> {
        if name == XATTR_STATUS {
            let status = self.status.get_file_status(id)?;
            return Ok(Some(status.as_str().as_bytes().to_vec()));
        }
        if name == XATTR_ERROR {
            if self.status.get_file_status(id)? != FileStatus::Error {
                return Ok(None);
            }
            let message = self
                .uploads
                .last_error_for(id)
                .or_else(|| self.downloads.last_error_for(id));
            return Ok(message.map(|m| m.into_bytes()));
        }
        Ok(self.getattr(id)?.xattrs.get(name).cloned())
    }

    pub fn setxattr(&self, id: &str, name: &str, value: Vec<u8>) -> Result<()> {
        if name == XATTR_STATUS || name == XATTR_ERROR {
            return Err(Error::Internal(format!("{name} is a derived, read-only attribute")));
        }
        self.inodes.set_xattr(id, name, value)
    }

    pub fn listxattr(&self, id: &str) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.getattr(id)?.xattrs.keys().cloned().collect();
        names.push(XATTR_STATUS.to_string());
        if self.status.get_file_status(id)? == FileStatus::Error {
            names.push(XATTR_ERROR.to_string());
        }
        Ok(names)
    }

    /// Pass-through readiness probe: callers poll file status rather than a
    /// kernel-level event mask.
    pub fn poll(&self, id: &str) -> Result<FileStatus> {
        self.status.get_file_status(id)
    }
}

fn slice_at(bytes: &[u8], offset: u64, len: usize) -> Vec<u8> {
    let start = (offset as usize).min(bytes.len());
    let end = start.saturating_add(len).min(bytes.len());
    bytes[start..end].to_vec()
}
