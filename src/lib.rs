//! `cloudfs-core`: the sync-engine half of a cloud-drive filesystem client.
//!
//! This crate owns everything between a kernel-facing filesystem shim and a
//! cloud storage provider's HTTP API: the inode graph, the durable metadata
//! store, the content cache, upload/download/delta background workers, the
//! conflict resolver, and the [`facade::Facade`] operations surface a FUSE
//! (or platform-equivalent) binding drives. Transport, authentication, and
//! the actual kernel binding are out of scope — [`remote::RemoteClient`] and
//! [`remote::RealtimeNotifier`] are the seams a caller plugs its own
//! provider integration into.
//!
//! [`CloudFs::mount`] wires every component together and starts the
//! background workers; [`CloudFs::shutdown`] tears them down gracefully.

pub mod cache;
pub mod concurrency;
pub mod config;
pub mod conflict;
pub mod delta;
pub mod download;
pub mod error;
pub mod facade;
pub mod hash;
pub mod ids;
pub mod inode;
pub mod metadata;
pub mod overlay;
pub mod remote;
pub mod stats;
pub mod status;
pub mod upload;

use std::sync::Arc;
use std::time::Duration;

use log::info;

use crate::cache::ContentCache;
use crate::concurrency::TaskGroup;
use crate::config::Config;
use crate::delta::DeltaLoop;
use crate::download::DownloadManager;
use crate::error::Result;
use crate::facade::Facade;
use crate::ids::IdTable;
use crate::inode::{Inode, InodeGraph};
use crate::metadata::MetadataStore;
use crate::overlay::OverlayRegistry;
use crate::remote::{BroadcastObserver, RealtimeNotifier, RemoteClient, StatusObserver};
use crate::stats::StatsEngine;
use crate::status::StatusEngine;
use crate::upload::UploadManager;

/// The id of the synthetic root directory entry (§4.1).
pub const ROOT_ID: &str = "root";

/// Number of concurrent upload workers. Unlike [`config::DownloadConfig`],
/// the upload side has no dedicated tuning field (its throughput is bounded
/// by the chunking/priority scheme instead), so this is a fixed constant
/// rather than something `Config` exposes.
const UPLOAD_WORKER_COUNT: usize = 4;

/// Tick cadence for the cache-cleanup background task (§4.10). The
/// expiration threshold itself comes from `Config::cache_expiration_days`;
/// this only bounds how often the sweep runs.
const CACHE_CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// The mounted filesystem (§3.4): owns every component and lives for the
/// process. Construct with [`CloudFs::mount`]; call [`CloudFs::shutdown`]
/// before the process exits so in-flight uploads get a chance to persist
/// their progress.
pub struct CloudFs {
    metadata: Arc<MetadataStore>,
    uploads: Arc<UploadManager>,
    stats: Arc<StatsEngine>,
    overlay: Arc<OverlayRegistry>,
    delta: Arc<DeltaLoop>,
    facade: Facade,
    tasks: TaskGroup,
}

impl CloudFs {
    /// Open the durable store, rebuild the warm inode cache's root, recover
    /// any upload sessions persisted before a restart, and start the
    /// background workers (download pool, upload pool, delta loop, and —
    /// when configured — the periodic stats refresh).
    pub fn mount(
        config: Config,
        remote: Arc<dyn RemoteClient>,
        notifier: Option<Arc<dyn RealtimeNotifier>>,
    ) -> Result<Arc<Self>> {
        let metadata = Arc::new(MetadataStore::open(&config.db_path())?);
        let root_entry = metadata.ensure_root(ROOT_ID)?;
        let cache = ContentCache::open(config.content_dir(), config.content_cache_max_size)?;

        let ids = Arc::new(IdTable::new());
        let inodes = Arc::new(InodeGraph::new(metadata.clone(), ids.clone(), ROOT_ID.to_string()));
        inodes.insert_id(ROOT_ID, Inode::from_entry(&root_entry));

        let downloads = DownloadManager::new(remote.clone(), cache.clone(), metadata.clone(), config.download);
        let uploads = UploadManager::new(remote.clone(), cache.clone(), metadata.clone(), inodes.clone(), config.upload);
        let recovered = uploads.recover_persisted()?;
        if recovered > 0 {
            info!("recovered {recovered} upload session(s) from a previous run");
        }

        let observer: Arc<dyn StatusObserver> = Arc::new(BroadcastObserver::new());
        let status = Arc::new(StatusEngine::new(
            metadata.clone(),
            cache.clone(),
            uploads.clone(),
            observer,
            config.status_cache_ttl,
        ));

        let overlay = Arc::new(OverlayRegistry::new());
        overlay.register_drive_info(ROOT_ID, 0, 0);

        let stats = Arc::new(StatsEngine::new(
            metadata.clone(),
            cache.clone(),
            uploads.clone(),
            downloads.clone(),
            config.stats,
        ));

        let delta = DeltaLoop::new(
            remote.clone(),
            metadata.clone(),
            inodes.clone(),
            cache.clone(),
            downloads.clone(),
            uploads.clone(),
            notifier,
            config.delta,
            config.realtime,
            config.conflict_strategy,
            inodes.online_flag(),
        );

        let facade = Facade::new(
            ids,
            inodes,
            metadata.clone(),
            cache.clone(),
            remote,
            downloads.clone(),
            uploads.clone(),
            status.clone(),
            overlay.clone(),
        );

        let tasks = TaskGroup::new();
        downloads.spawn_workers(&tasks);
        uploads.spawn_workers(&tasks, UPLOAD_WORKER_COUNT);
        delta.spawn(&tasks);
        if config.stats.background_calc_enabled {
            spawn_stats_refresh(&tasks, stats.clone(), config.stats.cache_ttl);
        }
        spawn_cache_cleanup(
            &tasks,
            cache,
            Duration::from_secs(u64::from(config.cache_expiration_days) * 24 * 60 * 60),
        );
        spawn_status_cache_cleanup(&tasks, status, config.status_cache_ttl);

        Ok(Arc::new(Self {
            metadata,
            uploads,
            stats,
            overlay,
            delta,
            facade,
            tasks,
        }))
    }

    /// The kernel-facing operations surface (§4.11).
    pub fn facade(&self) -> &Facade {
        &self.facade
    }

    pub fn stats(&self) -> &Arc<StatsEngine> {
        &self.stats
    }

    pub fn overlay(&self) -> &Arc<OverlayRegistry> {
        &self.overlay
    }

    pub fn is_online(&self) -> bool {
        self.delta.is_online()
    }

    /// Record foreground activity so the delta loop runs at its active
    /// cadence for a while (§4.7 rule 4); a binding calls this on every
    /// operation the facade serves.
    pub fn note_activity(&self) {
        self.delta.note_activity();
    }

    /// Update the synthesized `.drive-info` quota entry (§4.12) with a
    /// freshly fetched quota snapshot.
    pub fn set_drive_info(&self, quota_used: u64, quota_total: u64) {
        self.overlay.register_drive_info(ROOT_ID, quota_used, quota_total);
    }

    /// Give in-flight uploads a chance to persist their progress, then
    /// cancel every background task and await its completion (§4.10
    /// "graceful teardown").
    pub async fn shutdown(&self) {
        self.uploads.shutdown().await;
        self.tasks.shutdown().await;
    }

    /// The durable metadata store, for callers that need direct access
    /// (a provider-specific quota poller, for instance).
    pub fn metadata(&self) -> &Arc<MetadataStore> {
        &self.metadata
    }
}

fn spawn_stats_refresh(tasks: &TaskGroup, stats: Arc<StatsEngine>, ttl: std::time::Duration) {
    let root = tasks.root_context();
    tasks.spawn(async move {
        loop {
            tokio::select! {
                _ = root.cancelled() => return,
                _ = tokio::time::sleep(ttl) => {}
            }
            if let Err(e) = stats.get_stats() {
                log::warn!("background stats refresh failed: {e}");
            }
        }
    });
}

/// Periodically sweep content slots idle longer than `max_age` (§4.10
/// "cache cleanup"). Distinct from the size-bounded LRU eviction `insert`
/// performs inline; this one runs on a clock, not on insertion pressure.
fn spawn_cache_cleanup(tasks: &TaskGroup, cache: ContentCache, max_age: Duration) {
    let root = tasks.root_context();
    tasks.spawn(async move {
        loop {
            tokio::select! {
                _ = root.cancelled() => return,
                _ = tokio::time::sleep(CACHE_CLEANUP_INTERVAL) => {}
            }
            match cache.evict_expired(max_age) {
                Ok(0) => {}
                Ok(n) => log::debug!("cache cleanup evicted {n} expired slot(s)"),
                Err(e) => log::warn!("cache cleanup failed: {e}"),
            }
        }
    });
}

/// Periodically sweep expired entries from the status TTL cache (§4.10
/// "status-cache cleanup"). Purely a memory-footprint bound: a stale read
/// from `get_file_status` already re-derives on expiry.
fn spawn_status_cache_cleanup(tasks: &TaskGroup, status: Arc<StatusEngine>, ttl: std::time::Duration) {
    let root = tasks.root_context();
    tasks.spawn(async move {
        loop {
            tokio::select! {
                _ = root.cancelled() => return,
                _ = tokio::time::sleep(ttl) => {}
            }
            let n = status.prune_expired();
            if n > 0 {
                log::debug!("status-cache cleanup pruned {n} expired entr{}", if n == 1 { "y" } else { "ies" });
            }
        }
    });
}
