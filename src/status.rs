//! File-status derivation (§4.9, C9): per-id status with an explicit-status
//! override map, a TTL-bounded derivation cache, and an observer signal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::cache::ContentCache;
use crate::error::Result;
use crate::hash::ContentHash;
use crate::ids::is_local;
use crate::metadata::MetadataStore;
use crate::remote::StatusObserver;
use crate::upload::{UploadManager, UploadState};

/// Derived file status (§4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Cloud,
    Local,
    LocalModified,
    Syncing,
    Downloading,
    OutofSync,
    Error,
    Conflict,
}

impl FileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FileStatus::Cloud => "Cloud",
            FileStatus::Local => "Local",
            FileStatus::LocalModified => "LocalModified",
            FileStatus::Syncing => "Syncing",
            FileStatus::Downloading => "Downloading",
            FileStatus::OutofSync => "OutofSync",
            FileStatus::Error => "Error",
            FileStatus::Conflict => "Conflict",
        }
    }
}

struct CacheEntry {
    status: FileStatus,
    expires_at: Instant,
}

/// Status derivation surface (C9). Holds the explicit-status override map
/// and the TTL cache; consults the upload manager and metadata store to
/// derive a status on a cache miss.
pub struct StatusEngine {
    metadata: Arc<MetadataStore>,
    content: ContentCache,
    uploads: Arc<UploadManager>,
    explicit: RwLock<HashMap<String, FileStatus>>,
    ttl_cache: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
    observer: Arc<dyn StatusObserver>,
}

impl StatusEngine {
    pub fn new(
        metadata: Arc<MetadataStore>,
        content: ContentCache,
        uploads: Arc<UploadManager>,
        observer: Arc<dyn StatusObserver>,
        ttl: Duration,
    ) -> Self {
        Self {
            metadata,
            content,
            uploads,
            explicit: RwLock::new(HashMap::new()),
            ttl_cache: RwLock::new(HashMap::new()),
            ttl,
            observer,
        }
    }

    /// Record an explicit status override for `id`, emitting the
    /// transition on the observer surface. Supersedes derivation until
    /// cleared with [`StatusEngine::clear_explicit`].
    pub fn set_explicit(&self, id: &str, path: &str, status: FileStatus) {
        self.explicit.write().insert(id.to_string(), status);
        self.observer.emit(path, status);
    }

    pub fn clear_explicit(&self, id: &str) {
        self.explicit.write().remove(id);
    }

    /// Derive (or serve cached) status for `id`. Consults, in order: the
    /// explicit map, the TTL cache, then derivation (§4.9).
    pub fn get_file_status(&self, id: &str) -> Result<FileStatus> {
        if let Some(status) = self.explicit.read().get(id).copied() {
            return Ok(status);
        }
        if let Some(entry) = self.ttl_cache.read().get(id) {
            if entry.expires_at > Instant::now() {
                return Ok(entry.status);
            }
        }
        let status = self.derive(id, true)?;
        self.ttl_cache.write().insert(
            id.to_string(),
            CacheEntry {
                status,
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(status)
    }

    /// Batch path (§4.9): a single metadata transaction backs the
    /// offline-change lookup, and the expensive hash verification is
    /// skipped — callers accept a possibly-stale `OutofSync`.
    pub fn get_file_status_batch(&self, ids: &[String]) -> Result<Vec<(String, FileStatus)>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(status) = self.explicit.read().get(id).copied() {
                out.push((id.clone(), status));
                continue;
            }
            let status = self.derive(id, false)?;
            out.push((id.clone(), status));
        }
        Ok(out)
    }

    fn derive(&self, id: &str, verify_hash: bool) -> Result<FileStatus> {
        if let Some(upload_state) = self.uploads.get_state_for(id) {
            return Ok(match upload_state {
                UploadState::NotStarted | UploadState::Started => FileStatus::Syncing,
                UploadState::Complete => FileStatus::Local,
                UploadState::Errored => FileStatus::Error,
                UploadState::Cancelled => FileStatus::LocalModified,
            });
        }

        if self.metadata.has_offline_changes(id)? {
            return Ok(FileStatus::LocalModified);
        }

        if self.content.has_content(id) {
            let entry = self.metadata.get(id)?;
            let remote_hash = entry.as_ref().and_then(|e| e.hash);
            if !is_local(id) {
                if let Some(expected) = remote_hash {
                    // The non-batch path's offline behavior was an open
                    // question (§9); the decision taken here is to skip
                    // verification while offline, since there is no remote
                    // call available to resolve a mismatch anyway.
                    if verify_hash {
                        return Ok(self.verify_against(id, expected)?);
                    }
                    return Ok(FileStatus::Local);
                }
            }
            return Ok(FileStatus::Local);
        }

        Ok(FileStatus::Cloud)
    }

    /// Sweep entries whose TTL has elapsed. Backs the periodic
    /// status-cache-cleanup background task (§4.10); `get_file_status`
    /// already re-derives on a stale read, so this only bounds the cache's
    /// memory footprint rather than affecting correctness.
    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let mut cache = self.ttl_cache.write();
        let before = cache.len();
        cache.retain(|_, entry| entry.expires_at > now);
        before - cache.len()
    }

    fn verify_against(&self, id: &str, expected: ContentHash) -> Result<FileStatus> {
        match self.content.verify(id, expected) {
            Ok(true) => Ok(FileStatus::Local),
            Ok(false) => Ok(FileStatus::OutofSync),
            Err(_) => Ok(FileStatus::OutofSync),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UploadConfig;
    use crate::ids::IdTable;
    use crate::inode::InodeGraph;
    use crate::metadata::{now_millis, ItemKind, MetadataEntry};
    use crate::remote::{BroadcastObserver, MockRemoteClient};

    fn engine() -> (tempfile::TempDir, StatusEngine, Arc<MetadataStore>, ContentCache) {
        let dir = tempfile::tempdir().unwrap();
        let metadata = Arc::new(MetadataStore::open(&dir.path().join("m.db")).unwrap());
        metadata.ensure_root("root").unwrap();
        let content = ContentCache::open(dir.path().join("content"), 0).unwrap();
        let ids = Arc::new(IdTable::new());
        let inodes = Arc::new(InodeGraph::new(metadata.clone(), ids, "root".to_string()));
        let remote = Arc::new(MockRemoteClient::new());
        let uploads = UploadManager::new(remote, content.clone(), metadata.clone(), inodes, UploadConfig::default());
        let observer = Arc::new(BroadcastObserver::new());
        let status = StatusEngine::new(metadata.clone(), content.clone(), uploads, observer, Duration::from_secs(2));
        (dir, status, metadata, content)
    }

    fn file_entry(id: &str, hash: Option<ContentHash>) -> MetadataEntry {
        let mut e = MetadataEntry::new_root(id, now_millis());
        e.kind = ItemKind::File;
        e.parent_id = Some("root".into());
        e.hash = hash;
        e
    }

    #[test]
    fn no_content_no_changes_is_cloud() {
        let (_d, status, metadata, _content) = engine();
        metadata.save(&file_entry("remote-1", None)).unwrap();
        assert_eq!(status.get_file_status("remote-1").unwrap(), FileStatus::Cloud);
    }

    #[test]
    fn offline_change_is_local_modified() {
        let (_d, status, metadata, _content) = engine();
        metadata.save(&file_entry("remote-1", None)).unwrap();
        metadata
            .record_offline_change(&crate::metadata::OfflineChangeRecord {
                id: "remote-1".into(),
                kind: crate::metadata::OfflineChangeKind::Modify,
                timestamp: now_millis(),
            })
            .unwrap();
        assert_eq!(
            status.get_file_status("remote-1").unwrap(),
            FileStatus::LocalModified
        );
    }

    #[test]
    fn cached_content_matching_hash_is_local() {
        let (_d, status, metadata, content) = engine();
        let hash = ContentHash::of_bytes(b"hello");
        metadata.save(&file_entry("remote-1", Some(hash))).unwrap();
        content.insert("remote-1", b"hello").unwrap();
        assert_eq!(status.get_file_status("remote-1").unwrap(), FileStatus::Local);
    }

    #[test]
    fn cached_content_mismatched_hash_is_out_of_sync() {
        let (_d, status, metadata, content) = engine();
        let hash = ContentHash::of_bytes(b"hello");
        metadata.save(&file_entry("remote-1", Some(hash))).unwrap();
        content.insert("remote-1", b"corrupted").unwrap();
        assert_eq!(status.get_file_status("remote-1").unwrap(), FileStatus::OutofSync);
    }

    #[test]
    fn batch_path_skips_hash_verification() {
        let (_d, status, metadata, content) = engine();
        let hash = ContentHash::of_bytes(b"hello");
        metadata.save(&file_entry("remote-1", Some(hash))).unwrap();
        content.insert("remote-1", b"corrupted").unwrap();
        let results = status.get_file_status_batch(&["remote-1".to_string()]).unwrap();
        assert_eq!(results[0].1, FileStatus::Local);
    }

    #[test]
    fn explicit_override_takes_precedence() {
        let (_d, status, metadata, _content) = engine();
        metadata.save(&file_entry("remote-1", None)).unwrap();
        status.set_explicit("remote-1", "/remote-1", FileStatus::Error);
        assert_eq!(status.get_file_status("remote-1").unwrap(), FileStatus::Error);
    }

    #[test]
    fn prune_expired_drops_only_stale_entries() {
        let (_d, status, metadata, _content) = engine();
        metadata.save(&file_entry("remote-1", None)).unwrap();
        status.get_file_status("remote-1").unwrap();
        assert_eq!(status.prune_expired(), 0);

        status
            .ttl_cache
            .write()
            .get_mut("remote-1")
            .unwrap()
            .expires_at = Instant::now() - Duration::from_secs(1);
        assert_eq!(status.prune_expired(), 1);
        assert_eq!(status.ttl_cache.read().len(), 0);
    }
}
