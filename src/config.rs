//! Configuration (§6, "Configuration (enumerated)").

use std::path::PathBuf;
use std::time::Duration;

/// Conflict resolution strategy (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ConflictStrategy {
    LastWriterWins,
    KeepBoth,
    Rename,
}

impl Default for ConflictStrategy {
    fn default() -> Self {
        ConflictStrategy::KeepBoth
    }
}

/// Offline mode (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum OfflineMode {
    Disabled,
    ReadOnly,
    ReadWrite,
}

impl Default for OfflineMode {
    fn default() -> Self {
        OfflineMode::ReadWrite
    }
}

/// Statistics tuning (§4.13).
#[derive(Debug, Clone, Copy)]
pub struct StatsConfig {
    pub cache_ttl: Duration,
    pub sampling_threshold: usize,
    pub sampling_rate: f64,
    pub background_calc_enabled: bool,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(5 * 60),
            sampling_threshold: 10_000,
            sampling_rate: 0.10,
            background_calc_enabled: false,
        }
    }
}

/// Delta reconciliation tuning (§4.7).
#[derive(Debug, Clone, Copy)]
pub struct DeltaTuning {
    pub active_interval: Duration,
    pub active_window: Duration,
}

impl Default for DeltaTuning {
    fn default() -> Self {
        Self {
            active_interval: Duration::from_secs(15),
            active_window: Duration::from_secs(2 * 60),
        }
    }
}

/// Realtime notifier tuning (§4.7, §6).
#[derive(Debug, Clone, Copy)]
pub struct RealtimeOptions {
    pub enabled: bool,
    pub polling_only: bool,
    pub realtime_fallback_interval: Duration,
    pub default_polling_interval: Duration,
    pub default_recovery_interval: Duration,
}

impl Default for RealtimeOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            polling_only: false,
            realtime_fallback_interval: Duration::from_secs(45 * 60),
            default_polling_interval: Duration::from_secs(3 * 60),
            default_recovery_interval: Duration::from_secs(30),
        }
    }
}

/// Upload manager tuning (§4.6, §6).
#[derive(Debug, Clone, Copy)]
pub struct UploadConfig {
    pub graceful_timeout: Duration,
    pub chunk_size: usize,
    pub large_threshold: u64,
    pub retry_ceiling: u32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            graceful_timeout: Duration::from_secs(10),
            chunk_size: 10 * 1024 * 1024,
            large_threshold: 4 * 1024 * 1024,
            retry_ceiling: 5,
        }
    }
}

/// Download manager tuning (§4.5, §6).
#[derive(Debug, Clone, Copy)]
pub struct DownloadConfig {
    pub worker_count: usize,
    pub retry_ceiling: u32,
    pub backoff_initial: Duration,
    pub backoff_cap: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            retry_ceiling: 5,
            backoff_initial: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
        }
    }
}

/// Top-level configuration for a mounted filesystem (§6).
#[derive(Debug, Clone)]
pub struct Config {
    pub cache_dir: PathBuf,
    pub content_cache_max_size: u64,
    pub cache_expiration_days: u32,
    pub status_cache_ttl: Duration,
    pub stats: StatsConfig,
    pub delta: DeltaTuning,
    pub realtime: RealtimeOptions,
    pub upload: UploadConfig,
    pub download: DownloadConfig,
    pub offline_mode: OfflineMode,
    pub conflict_strategy: ConflictStrategy,
}

impl Config {
    /// A config suitable for tests: a fresh temp cache dir, unlimited cache.
    pub fn for_dir(cache_dir: PathBuf) -> Self {
        Self {
            cache_dir,
            content_cache_max_size: 0,
            cache_expiration_days: 30,
            status_cache_ttl: Duration::from_secs(2),
            stats: StatsConfig::default(),
            delta: DeltaTuning::default(),
            realtime: RealtimeOptions::default(),
            upload: UploadConfig::default(),
            download: DownloadConfig::default(),
            offline_mode: OfflineMode::ReadWrite,
            conflict_strategy: ConflictStrategy::default(),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.cache_dir.join("cloudfs.db")
    }

    pub fn content_dir(&self) -> PathBuf {
        self.cache_dir.join("content")
    }
}
