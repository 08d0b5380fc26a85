//! Delta reconciliation loop (§4.7, C7): the long-lived task that keeps
//! local state converging on the remote namespace.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::cache::ContentCache;
use crate::concurrency::{OpContext, TaskGroup};
use crate::config::{ConflictStrategy, DeltaTuning, RealtimeOptions};
use crate::conflict;
use crate::download::DownloadManager;
use crate::error::{Error, Result};
use crate::inode::InodeGraph;
use crate::metadata::{now_millis, ItemKind, LifecycleState, MetadataEntry, MetadataStore, PinMode};
use crate::remote::{DriveItem, NotifierStatus, RealtimeNotifier, RemoteClient};
use crate::upload::UploadManager;

fn drive_item_to_entry(item: &DriveItem) -> MetadataEntry {
    MetadataEntry {
        id: item.id.clone(),
        parent_id: item.parent_id.clone(),
        name: item.name.clone(),
        kind: if item.is_directory {
            ItemKind::Directory
        } else {
            ItemKind::File
        },
        state: LifecycleState::Ghost,
        etag: Some(item.etag.clone()),
        size: item.size,
        last_modified: item.last_modified_millis,
        hash: item.hash,
        overlay_policy: crate::metadata::OverlayPolicy::RemoteWins,
        pin_mode: PinMode::Never,
        pending_remote: false,
        children: Vec::new(),
        created_at: now_millis(),
        updated_at: now_millis(),
    }
}

/// The reconciliation loop (C7). Owns no state of its own beyond scheduling
/// — every mutation goes through the metadata store and inode graph so a
/// restart mid-cycle just resumes from the last persisted continuation
/// token.
pub struct DeltaLoop {
    remote: Arc<dyn RemoteClient>,
    metadata: Arc<MetadataStore>,
    inodes: Arc<InodeGraph>,
    cache: ContentCache,
    downloads: Arc<DownloadManager>,
    uploads: Arc<UploadManager>,
    notifier: Option<Arc<dyn RealtimeNotifier>>,
    tuning: DeltaTuning,
    realtime: RealtimeOptions,
    conflict_strategy: ConflictStrategy,
    online: Arc<AtomicBool>,
    last_activity: Mutex<Option<Instant>>,
}

impl DeltaLoop {
    /// `online` is the flag shared with [`InodeGraph`] (via
    /// [`InodeGraph::online_flag`]) so a cold, missing parent can tell
    /// `OFFLINE_AND_COLD` apart from a confirmed `NOT_FOUND` (§4.2).
    pub fn new(
        remote: Arc<dyn RemoteClient>,
        metadata: Arc<MetadataStore>,
        inodes: Arc<InodeGraph>,
        cache: ContentCache,
        downloads: Arc<DownloadManager>,
        uploads: Arc<UploadManager>,
        notifier: Option<Arc<dyn RealtimeNotifier>>,
        tuning: DeltaTuning,
        realtime: RealtimeOptions,
        conflict_strategy: ConflictStrategy,
        online: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            remote,
            metadata,
            inodes,
            cache,
            downloads,
            uploads,
            notifier,
            tuning,
            realtime,
            conflict_strategy,
            online,
            last_activity: Mutex::new(None),
        })
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Record foreground filesystem activity, so the loop runs at
    /// `active_interval` for the next `active_window` (§4.7 rule 4).
    pub fn note_activity(&self) {
        *self.last_activity.lock() = Some(Instant::now());
    }

    /// Compute the current cadence, per the four rules in §4.7, in order.
    pub fn desired_delta_interval(&self) -> Duration {
        if matches!(*self.last_activity.lock(), Some(t) if t.elapsed() < self.tuning.active_window) {
            return self.tuning.active_interval;
        }

        match &self.notifier {
            Some(notifier) if notifier.is_active() => match notifier.health().status {
                NotifierStatus::Healthy => self.realtime.realtime_fallback_interval,
                NotifierStatus::Degraded => self.realtime.default_polling_interval,
                NotifierStatus::Failed => self.realtime.default_recovery_interval,
            },
            _ => self.realtime.default_recovery_interval,
        }
    }

    /// Spawn the long-lived loop task under `group`.
    pub fn spawn(self: &Arc<Self>, group: &TaskGroup) {
        let loop_ = self.clone();
        let root = group.root_context();
        group.spawn(async move {
            loop_.run(root).await;
        });
    }

    async fn run(self: Arc<Self>, root: OpContext) {
        loop {
            let interval = self.desired_delta_interval();
            tokio::select! {
                _ = root.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            if root.is_cancelled() {
                return;
            }
            let was_offline = !self.is_online();
            match self.run_cycle(&root).await {
                Ok(applied) => {
                    if applied > 0 {
                        debug!("delta cycle applied {applied} changes");
                    }
                    self.online.store(true, Ordering::SeqCst);
                    if was_offline {
                        info!("delta loop back online, draining offline changes");
                        if let Err(e) = self.uploads.process_offline_changes().await {
                            warn!("process_offline_changes failed: {e}");
                        }
                    }
                }
                Err(e) => {
                    warn!("delta cycle failed: {e}");
                    self.online.store(false, Ordering::SeqCst);
                }
            }
        }
    }

    /// Run one reconciliation cycle: page through remote deltas, apply them
    /// (with the directory-not-empty second pass), persist the new
    /// continuation token. Returns the number of deltas applied.
    async fn run_cycle(&self, ctx: &OpContext) -> Result<usize> {
        let mut token = self.metadata.get_delta_token()?;
        let mut by_id = std::collections::HashMap::new();
        let mut done_token = None;

        loop {
            ctx.check()?;
            let page = self.remote.delta(ctx, token.as_deref()).await?;
            for item in page.items {
                by_id.insert(item.id.clone(), item);
            }
            match page.next {
                Some(next) => token = Some(next),
                None => {
                    done_token = page.done_token;
                    break;
                }
            }
        }

        let items: Vec<DriveItem> = by_id.into_values().collect();
        let mut retry_second_pass = Vec::new();
        for item in &items {
            match self.apply_delta(item) {
                Ok(()) => {}
                Err(Error::NotEmpty) => retry_second_pass.push(item.clone()),
                Err(e) => return Err(e),
            }
        }
        let mut applied = items.len() - retry_second_pass.len();
        for item in &retry_second_pass {
            self.apply_delta(item)?;
            applied += 1;
        }

        if let Some(token) = done_token {
            self.metadata.save_delta_token(&token)?;
        }
        Ok(applied)
    }

    /// Apply one delta, per the `apply_delta` procedure of §4.7.
    fn apply_delta(&self, item: &DriveItem) -> Result<()> {
        if let Some(parent_id) = &item.parent_id {
            if self.metadata.get(parent_id)?.is_none() {
                // Parent unknown locally: lazy, fetched on next access.
                return Ok(());
            }
        }

        let local = self.metadata.get(&item.id)?;

        if item.deleted {
            return self.apply_delete(item, local);
        }

        let local = match local {
            None => {
                let entry = drive_item_to_entry(item);
                self.metadata.save(&entry)?;
                if let Some(parent_id) = &item.parent_id {
                    self.inodes.insert_child(parent_id, &item.id)?;
                }
                return Ok(());
            }
            Some(l) => l,
        };

        if local.parent_id != item.parent_id || local.name != item.name {
            if let (Some(old_parent), Some(new_parent)) = (&local.parent_id, &item.parent_id) {
                self.inodes
                    .move_path(old_parent, new_parent, &local.name, &item.name)?;
            }
        }

        self.apply_content_change(&local, item)
    }

    fn apply_delete(&self, item: &DriveItem, local: Option<MetadataEntry>) -> Result<()> {
        let Some(local) = local else { return Ok(()) };
        if local.kind == ItemKind::Directory && !local.children.is_empty() {
            return Err(Error::NotEmpty);
        }
        let _ = item;
        self.inodes.delete_id(&local.id)
    }

    /// Steps 4-5 of §4.7: compare mtime/ETag, diff hashes, and either apply
    /// a metadata-only update or hand off to the conflict resolver.
    fn apply_content_change(&self, local: &MetadataEntry, item: &DriveItem) -> Result<()> {
        let etag_differs = local.etag.as_deref() != Some(item.etag.as_str());
        if item.last_modified_millis <= local.last_modified || !etag_differs {
            return Ok(());
        }

        if local.hash == item.hash {
            self.metadata.update(&local.id, |e| {
                e.etag = Some(item.etag.clone());
                e.size = item.size;
                e.last_modified = item.last_modified_millis;
            })?;
            return Ok(());
        }

        if local.state == LifecycleState::DirtyLocal {
            let remote_entry = drive_item_to_entry(item);
            conflict::resolve(
                &self.metadata,
                &self.inodes,
                &self.cache,
                self.conflict_strategy,
                local,
                &remote_entry,
            )?;
            return Ok(());
        }

        self.metadata.update(&local.id, |e| {
            e.etag = Some(item.etag.clone());
            e.size = item.size;
            e.hash = item.hash;
            e.last_modified = item.last_modified_millis;
        })?;
        self.metadata.transition(&local.id, LifecycleState::Ghost)?;
        let _ = self.cache.delete(&local.id);

        if local.pin_mode == PinMode::Always {
            self.downloads.queue_download(&local.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ContentCache;
    use crate::config::{DownloadConfig, UploadConfig};
    use crate::hash::ContentHash;
    use crate::ids::IdTable;
    use crate::remote::MockRemoteClient;

    fn setup() -> (
        tempfile::TempDir,
        Arc<DeltaLoop>,
        Arc<MetadataStore>,
        Arc<MockRemoteClient>,
        Arc<InodeGraph>,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let metadata = Arc::new(MetadataStore::open(&dir.path().join("m.db")).unwrap());
        metadata.ensure_root("root").unwrap();
        let content = ContentCache::open(dir.path().join("content"), 0).unwrap();
        let ids = Arc::new(IdTable::new());
        let inodes = Arc::new(InodeGraph::new(metadata.clone(), ids, "root".to_string()));
        inodes.insert_id("root", crate::inode::Inode::from_entry(&metadata.get("root").unwrap().unwrap()));
        let remote = Arc::new(MockRemoteClient::new());
        let downloads = DownloadManager::new(remote.clone(), content.clone(), metadata.clone(), DownloadConfig::default());
        let uploads = UploadManager::new(remote.clone(), content.clone(), metadata.clone(), inodes.clone(), UploadConfig::default());
        let online = inodes.online_flag();
        let loop_ = DeltaLoop::new(
            remote.clone(),
            metadata.clone(),
            inodes.clone(),
            content,
            downloads,
            uploads,
            None,
            DeltaTuning::default(),
            RealtimeOptions::default(),
            ConflictStrategy::KeepBoth,
            online,
        );
        (dir, loop_, metadata, remote, inodes)
    }

    fn item(id: &str, name: &str, hash: Option<ContentHash>) -> DriveItem {
        DriveItem {
            id: id.to_string(),
            name: name.to_string(),
            parent_id: Some("root".to_string()),
            size: 5,
            hash,
            etag: "e1".to_string(),
            last_modified_millis: now_millis() + 1000,
            is_directory: false,
            deleted: false,
        }
    }

    #[tokio::test]
    async fn new_item_is_inserted_and_linked_to_parent() {
        let (_d, loop_, metadata, remote, inodes) = setup();
        remote.push_delta(item("remote-1", "a.txt", Some(ContentHash::of_bytes(b"hello"))));
        let ctx = OpContext::new();
        let applied = loop_.run_cycle(&ctx).await.unwrap();
        assert_eq!(applied, 1);
        assert!(metadata.get("remote-1").unwrap().is_some());
        assert!(inodes.get_child("root", "a.txt").unwrap().is_some());
    }

    #[tokio::test]
    async fn delta_with_unknown_parent_is_skipped() {
        let (_d, loop_, metadata, remote, _inodes) = setup();
        let mut orphan = item("remote-2", "b.txt", None);
        orphan.parent_id = Some("missing-parent".to_string());
        remote.push_delta(orphan);
        let ctx = OpContext::new();
        loop_.run_cycle(&ctx).await.unwrap();
        assert!(metadata.get("remote-2").unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_of_nonempty_directory_triggers_second_pass_then_succeeds() {
        let (_d, loop_, metadata, remote, inodes) = setup();
        let mut dir_entry = MetadataEntry::new_root("dir-1", now_millis());
        dir_entry.kind = ItemKind::Directory;
        dir_entry.parent_id = Some("root".into());
        dir_entry.name = "sub".into();
        dir_entry.children = vec!["child-1".into()];
        metadata.save(&dir_entry).unwrap();
        inodes.insert_id("dir-1", crate::inode::Inode::from_entry(&dir_entry));
        inodes.insert_child("root", "dir-1").unwrap();

        let mut child_entry = MetadataEntry::new_root("child-1", now_millis());
        child_entry.parent_id = Some("dir-1".into());
        child_entry.name = "c.txt".into();
        metadata.save(&child_entry).unwrap();

        let mut delete_dir = item("dir-1", "sub", None);
        delete_dir.deleted = true;
        remote.push_delta(delete_dir);
        let mut delete_child = item("child-1", "c.txt", None);
        delete_child.parent_id = Some("dir-1".to_string());
        delete_child.deleted = true;
        remote.push_delta(delete_child);

        let ctx = OpContext::new();
        let applied = loop_.run_cycle(&ctx).await.unwrap();
        assert_eq!(applied, 2);
        assert!(metadata.get("dir-1").unwrap().is_none());
    }

    #[tokio::test]
    async fn dirty_local_divergence_goes_to_conflict_resolver() {
        let (_d, loop_, metadata, remote, inodes) = setup();
        let mut local = MetadataEntry::new_root("remote-3", now_millis());
        local.parent_id = Some("root".into());
        local.name = "x.txt".into();
        local.state = LifecycleState::DirtyLocal;
        local.hash = Some(ContentHash::of_bytes(b"local"));
        local.etag = Some("e0".into());
        metadata.save(&local).unwrap();
        inodes.insert_child("root", "remote-3").unwrap();

        remote.push_delta(item("remote-3", "x.txt", Some(ContentHash::of_bytes(b"remote"))));
        let ctx = OpContext::new();
        loop_.run_cycle(&ctx).await.unwrap();

        let updated = metadata.get("remote-3").unwrap().unwrap();
        assert_eq!(updated.state, LifecycleState::Conflict);
    }

    #[tokio::test]
    async fn active_window_override_wins_regardless_of_notifier() {
        let (_d, loop_, _metadata, _remote, _inodes) = setup();
        loop_.note_activity();
        assert_eq!(loop_.desired_delta_interval(), loop_.tuning.active_interval);
    }

    #[tokio::test]
    async fn offline_to_online_transition_drains_offline_changes() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = Arc::new(MetadataStore::open(&dir.path().join("m.db")).unwrap());
        metadata.ensure_root("root").unwrap();
        let content = ContentCache::open(dir.path().join("content"), 0).unwrap();
        let ids = Arc::new(IdTable::new());
        let inodes = Arc::new(InodeGraph::new(metadata.clone(), ids, "root".to_string()));
        inodes.insert_id("root", crate::inode::Inode::from_entry(&metadata.get("root").unwrap().unwrap()));
        let remote = Arc::new(MockRemoteClient::new());
        let downloads = DownloadManager::new(remote.clone(), content.clone(), metadata.clone(), DownloadConfig::default());
        let uploads = UploadManager::new(remote.clone(), content.clone(), metadata.clone(), inodes.clone(), UploadConfig::default());

        let mut realtime = RealtimeOptions::default();
        realtime.default_recovery_interval = Duration::from_millis(5);
        let online = inodes.online_flag();
        let loop_ = DeltaLoop::new(
            remote.clone(),
            metadata.clone(),
            inodes.clone(),
            content,
            downloads,
            uploads.clone(),
            None,
            DeltaTuning::default(),
            realtime,
            ConflictStrategy::KeepBoth,
            online,
        );

        let mut entry = MetadataEntry::new_root("local-1", now_millis());
        entry.parent_id = Some("root".into());
        entry.name = "a.txt".into();
        metadata.save(&entry).unwrap();
        inodes.insert_child("root", "local-1").unwrap();
        uploads
            .queue_upload("local-1", crate::upload::UploadPriority::Normal, 5, "root", "a.txt")
            .unwrap();

        loop_.online.store(false, Ordering::SeqCst);
        let group = TaskGroup::new();
        loop_.spawn(&group);
        tokio::time::sleep(Duration::from_millis(80)).await;
        group.shutdown().await;
        assert!(loop_.is_online());
    }
}
