//! Statistics & introspection (§4.13, C13): aggregate counts over the
//! metadata store, content cache, and in-flight transfer managers.
//!
//! `get_stats` is the expensive path: a TTL cache guards against repeated
//! full scans, and stores above `sampling_threshold` items are sampled at
//! `sampling_rate` rather than walked in full. `get_quick_stats` never
//! touches the metadata store at all, for callers that can't afford to
//! block on one (a `statfs` call, for instance).

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::cache::ContentCache;
use crate::config::StatsConfig;
use crate::download::DownloadManager;
use crate::error::Result;
use crate::metadata::{ItemKind, LifecycleState, MetadataStore, PinMode};
use crate::upload::UploadManager;

/// Full aggregate returned by [`StatsEngine::get_stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FsStats {
    pub total_items: u64,
    pub directories: u64,
    pub files: u64,
    pub hydrated: u64,
    pub ghost: u64,
    pub hydrating: u64,
    pub dirty_local: u64,
    pub conflict: u64,
    pub error: u64,
    pub cache_bytes_used: u64,
    pub cache_bytes_max: u64,
    pub pending_uploads: u64,
    pub pending_downloads: u64,
    /// Items HYDRATED, unpinned, and eligible for eviction under C4's LRU
    /// policy. Not named in the distilled spec; supplemented here as the
    /// counterpart of the port's dehydration-candidate listing.
    pub dehydration_candidates: u64,
    /// Set when `total_items` exceeded `sampling_threshold` and the
    /// per-state counts above were extrapolated from a sample.
    pub is_sampled: bool,
}

/// Cheap subset that never walks the metadata store, for callers on a
/// latency-sensitive path.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QuickStats {
    pub cache_bytes_used: u64,
    pub cache_bytes_max: u64,
    pub pending_uploads: u64,
    pub pending_downloads: u64,
}

struct CacheEntry {
    stats: FsStats,
    expires_at: Instant,
}

/// Statistics engine (C13).
pub struct StatsEngine {
    metadata: Arc<MetadataStore>,
    cache: ContentCache,
    uploads: Arc<UploadManager>,
    downloads: Arc<DownloadManager>,
    config: StatsConfig,
    cached: RwLock<Option<CacheEntry>>,
}

impl StatsEngine {
    pub fn new(
        metadata: Arc<MetadataStore>,
        cache: ContentCache,
        uploads: Arc<UploadManager>,
        downloads: Arc<DownloadManager>,
        config: StatsConfig,
    ) -> Self {
        Self {
            metadata,
            cache,
            uploads,
            downloads,
            config,
            cached: RwLock::new(None),
        }
    }

    pub fn get_quick_stats(&self) -> QuickStats {
        QuickStats {
            cache_bytes_used: self.cache.get_cache_size(),
            cache_bytes_max: self.cache.get_max_cache_size(),
            pending_uploads: self.uploads.pending_count() as u64,
            pending_downloads: self.downloads.pending_count() as u64,
        }
    }

    /// Full aggregate, served from the TTL cache when fresh.
    pub fn get_stats(&self) -> Result<FsStats> {
        if let Some(entry) = self.cached.read().as_ref() {
            if entry.expires_at > Instant::now() {
                return Ok(entry.stats);
            }
        }
        let stats = self.compute()?;
        *self.cached.write() = Some(CacheEntry {
            stats,
            expires_at: Instant::now() + self.config.cache_ttl,
        });
        Ok(stats)
    }

    /// Drop the cached aggregate so the next `get_stats` call recomputes.
    pub fn invalidate(&self) {
        *self.cached.write() = None;
    }

    fn compute(&self) -> Result<FsStats> {
        let total = self.metadata.count_entries()?;
        let (entries, is_sampled, scale) = if total > self.config.sampling_threshold as u64 {
            let stride = (1.0 / self.config.sampling_rate.max(0.001)).round().max(1.0) as u64;
            let sampled = self.metadata.sampled_entries(stride)?;
            let scale = if sampled.is_empty() {
                1.0
            } else {
                total as f64 / sampled.len() as f64
            };
            (sampled, true, scale)
        } else {
            (self.metadata.all_entries()?, false, 1.0)
        };

        let mut directories = 0u64;
        let mut files = 0u64;
        let mut hydrated = 0u64;
        let mut ghost = 0u64;
        let mut hydrating = 0u64;
        let mut dirty_local = 0u64;
        let mut conflict = 0u64;
        let mut error = 0u64;
        let mut dehydration_candidates = 0u64;

        for entry in &entries {
            match entry.kind {
                ItemKind::Directory => directories += 1,
                ItemKind::File => files += 1,
            }
            match entry.state {
                LifecycleState::Hydrated => {
                    hydrated += 1;
                    if entry.pin_mode != PinMode::Always {
                        dehydration_candidates += 1;
                    }
                }
                LifecycleState::Ghost => ghost += 1,
                LifecycleState::Hydrating => hydrating += 1,
                LifecycleState::DirtyLocal => dirty_local += 1,
                LifecycleState::Conflict => conflict += 1,
                LifecycleState::Error => error += 1,
            }
        }

        let scaled = |n: u64| (n as f64 * scale).round() as u64;
        Ok(FsStats {
            total_items: total,
            directories: scaled(directories),
            files: scaled(files),
            hydrated: scaled(hydrated),
            ghost: scaled(ghost),
            hydrating: scaled(hydrating),
            dirty_local: scaled(dirty_local),
            conflict: scaled(conflict),
            error: scaled(error),
            dehydration_candidates: scaled(dehydration_candidates),
            cache_bytes_used: self.cache.get_cache_size(),
            cache_bytes_max: self.cache.get_max_cache_size(),
            pending_uploads: self.uploads.pending_count() as u64,
            pending_downloads: self.downloads.pending_count() as u64,
            is_sampled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DownloadConfig, UploadConfig};
    use crate::ids::IdTable;
    use crate::inode::InodeGraph;
    use crate::metadata::{now_millis, MetadataEntry};
    use crate::remote::MockRemoteClient;

    fn engine(config: StatsConfig) -> (tempfile::TempDir, StatsEngine, Arc<MetadataStore>) {
        let dir = tempfile::tempdir().unwrap();
        let metadata = Arc::new(MetadataStore::open(&dir.path().join("m.db")).unwrap());
        metadata.ensure_root("root").unwrap();
        let content = ContentCache::open(dir.path().join("content"), 1024 * 1024).unwrap();
        let ids = Arc::new(IdTable::new());
        let inodes = Arc::new(InodeGraph::new(metadata.clone(), ids, "root".to_string()));
        let remote = Arc::new(MockRemoteClient::new());
        let uploads = UploadManager::new(
            remote.clone(),
            content.clone(),
            metadata.clone(),
            inodes,
            UploadConfig::default(),
        );
        let downloads = DownloadManager::new(remote, content.clone(), metadata.clone(), DownloadConfig::default());
        let stats = StatsEngine::new(metadata.clone(), content, uploads, downloads, config);
        (dir, stats, metadata)
    }

    fn file(id: &str, kind: ItemKind, state: LifecycleState, pin_mode: PinMode) -> MetadataEntry {
        let mut e = MetadataEntry::new_root(id, now_millis());
        e.kind = kind;
        e.parent_id = Some("root".into());
        e.state = state;
        e.pin_mode = pin_mode;
        e
    }

    #[test]
    fn counts_items_by_kind_and_state() {
        let (_d, stats, metadata) = engine(StatsConfig::default());
        metadata
            .save(&file("remote-1", ItemKind::File, LifecycleState::Hydrated, PinMode::Never))
            .unwrap();
        metadata
            .save(&file("remote-2", ItemKind::Directory, LifecycleState::Ghost, PinMode::Never))
            .unwrap();
        metadata
            .save(&file("remote-3", ItemKind::File, LifecycleState::DirtyLocal, PinMode::Never))
            .unwrap();

        let s = stats.get_stats().unwrap();
        assert_eq!(s.total_items, 3);
        assert_eq!(s.files, 2);
        assert_eq!(s.directories, 1);
        assert_eq!(s.hydrated, 1);
        assert_eq!(s.ghost, 1);
        assert_eq!(s.dirty_local, 1);
        assert!(!s.is_sampled);
    }

    #[test]
    fn pinned_hydrated_item_is_not_a_dehydration_candidate() {
        let (_d, stats, metadata) = engine(StatsConfig::default());
        metadata
            .save(&file("remote-1", ItemKind::File, LifecycleState::Hydrated, PinMode::Always))
            .unwrap();
        metadata
            .save(&file("remote-2", ItemKind::File, LifecycleState::Hydrated, PinMode::Never))
            .unwrap();

        let s = stats.get_stats().unwrap();
        assert_eq!(s.hydrated, 2);
        assert_eq!(s.dehydration_candidates, 1);
    }

    #[test]
    fn stats_are_cached_within_ttl() {
        let (_d, stats, metadata) = engine(StatsConfig {
            cache_ttl: Duration::from_secs(60),
            ..StatsConfig::default()
        });
        metadata
            .save(&file("remote-1", ItemKind::File, LifecycleState::Hydrated, PinMode::Never))
            .unwrap();
        let first = stats.get_stats().unwrap();
        metadata
            .save(&file("remote-2", ItemKind::File, LifecycleState::Hydrated, PinMode::Never))
            .unwrap();
        let second = stats.get_stats().unwrap();
        assert_eq!(first, second);

        stats.invalidate();
        let third = stats.get_stats().unwrap();
        assert_eq!(third.total_items, 2);
    }

    #[test]
    fn large_store_is_sampled() {
        let (_d, stats, metadata) = engine(StatsConfig {
            sampling_threshold: 5,
            sampling_rate: 0.5,
            ..StatsConfig::default()
        });
        for i in 0..20 {
            metadata
                .save(&file(
                    &format!("remote-{i}"),
                    ItemKind::File,
                    LifecycleState::Hydrated,
                    PinMode::Never,
                ))
                .unwrap();
        }
        let s = stats.get_stats().unwrap();
        assert_eq!(s.total_items, 20);
        assert!(s.is_sampled);
        // Extrapolated from a 50% sample; exact count depends on table
        // iteration order but should land in the right ballpark.
        assert!(s.files > 0);
    }

    #[test]
    fn quick_stats_never_touch_metadata() {
        let (_d, stats, metadata) = engine(StatsConfig::default());
        // Intentionally leave metadata empty; quick stats should still
        // return cache/transfer-manager state without error.
        let q = stats.get_quick_stats();
        assert_eq!(q.pending_uploads, 0);
        assert_eq!(q.pending_downloads, 0);
        let _ = metadata.count_entries().unwrap();
    }
}
