//! Download manager (§4.5, C5): a deduplicating fetch queue with a bounded
//! worker pool, exponential backoff, and cancellation, styled after the
//! teacher's worker-loop + oneshot-teardown pattern in `session.rs`.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, warn};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};

use crate::cache::ContentCache;
use crate::concurrency::{OpContext, TaskGroup};
use crate::config::DownloadConfig;
use crate::error::{Error, Result};
use crate::hash::ContentHash;
use crate::metadata::{LifecycleState, MetadataStore, PinMode};
use crate::remote::RemoteClient;

/// Terminal/non-terminal states of one download session (§3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Queued,
    Started,
    Completed,
    Errored,
    Cancelled,
}

impl DownloadState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DownloadState::Completed | DownloadState::Errored | DownloadState::Cancelled
        )
    }
}

struct DownloadSessionInner {
    state: DownloadState,
    last_error: Option<String>,
    ctx: OpContext,
}

/// A handle to one id's download session: waiters call [`DownloadHandle::wait`]
/// to block until the session reaches a terminal state.
pub struct DownloadHandle {
    id: String,
    inner: AsyncMutex<DownloadSessionInner>,
    notify: Notify,
}

impl DownloadHandle {
    pub async fn state(&self) -> DownloadState {
        self.inner.lock().await.state
    }

    pub async fn last_error(&self) -> Option<String> {
        self.inner.lock().await.last_error.clone()
    }

    /// Block until the session reaches a terminal state.
    pub async fn wait(&self) -> DownloadState {
        loop {
            {
                let guard = self.inner.lock().await;
                if guard.state.is_terminal() {
                    return guard.state;
                }
            }
            self.notify.notified().await;
        }
    }

    async fn set_state(&self, state: DownloadState, last_error: Option<String>) {
        let mut guard = self.inner.lock().await;
        guard.state = state;
        guard.last_error = last_error;
        drop(guard);
        self.notify.notify_waiters();
    }

    pub fn cancel(&self) {
        // Best-effort: the context cancel is synchronous, the state flip
        // happens the next time the worker checks it.
        if let Ok(guard) = self.inner.try_lock() {
            guard.ctx.cancel();
        }
    }
}

/// The download manager (C5). At most one session per id exists at a time
/// (§8 invariant); `queue_download` returns the existing handle when one is
/// already in flight.
pub struct DownloadManager {
    sessions: DashMap<String, Arc<DownloadHandle>>,
    queue_tx: mpsc::UnboundedSender<String>,
    queue_rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<String>>>,
    remote: Arc<dyn RemoteClient>,
    cache: ContentCache,
    metadata: Arc<MetadataStore>,
    config: DownloadConfig,
    root: parking_lot::Mutex<OpContext>,
}

impl DownloadManager {
    pub fn new(remote: Arc<dyn RemoteClient>, cache: ContentCache, metadata: Arc<MetadataStore>, config: DownloadConfig) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            sessions: DashMap::new(),
            queue_tx,
            queue_rx: Arc::new(AsyncMutex::new(queue_rx)),
            remote,
            cache,
            metadata,
            config,
            root: parking_lot::Mutex::new(OpContext::new()),
        })
    }

    /// Start the configured number of worker loops under `group`, each
    /// pulling ids off the shared queue until the group's root context is
    /// cancelled. Every session handle minted after this call derives its
    /// context from `group`'s root, so a group shutdown cancels in-flight
    /// sessions too.
    pub fn spawn_workers(self: &Arc<Self>, group: &TaskGroup) {
        *self.root.lock() = group.root_context();
        for worker_id in 0..self.config.worker_count {
            let manager = self.clone();
            let root = group.root_context();
            group.spawn(async move {
                manager.worker_loop(worker_id, root).await;
            });
        }
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, root: OpContext) {
        loop {
            let id = {
                let mut rx = self.queue_rx.lock().await;
                tokio::select! {
                    _ = root.cancelled() => return,
                    next = rx.recv() => match next {
                        Some(id) => id,
                        None => return,
                    },
                }
            };
            debug!("download worker {worker_id} picked up {id}");
            let handle = self.sessions.get(&id).map(|h| h.clone());
            let ctx = match &handle {
                Some(h) => h.inner.lock().await.ctx.clone(),
                None => root.child(),
            };
            self.run_session(&id, ctx).await;
        }
    }

    /// Queue `id` for download, returning the (possibly pre-existing)
    /// session handle.
    pub fn queue_download(&self, id: &str) -> Arc<DownloadHandle> {
        if let Some(existing) = self.sessions.get(id) {
            return existing.clone();
        }
        let handle = Arc::new(DownloadHandle {
            id: id.to_string(),
            inner: AsyncMutex::new(DownloadSessionInner {
                state: DownloadState::Queued,
                last_error: None,
                ctx: self.root.lock().child(),
            }),
            notify: Notify::new(),
        });
        self.sessions.insert(id.to_string(), handle.clone());
        let _ = self.queue_tx.send(id.to_string());
        handle
    }

    pub fn get_download_status(&self, id: &str) -> Option<DownloadState> {
        self.sessions.get(id).map(|h| {
            h.inner
                .try_lock()
                .map(|g| g.state)
                .unwrap_or(DownloadState::Started)
        })
    }

    pub async fn wait_for_download(&self, id: &str) -> Result<DownloadState> {
        match self.sessions.get(id).map(|h| h.clone()) {
            Some(handle) => Ok(handle.wait().await),
            None => Err(Error::NotFound),
        }
    }

    pub fn cancel_download(&self, id: &str) {
        if let Some(handle) = self.sessions.get(id) {
            handle.cancel();
        }
    }

    /// Non-blocking snapshot of `id`'s last recorded error message, for the
    /// facade's `user.*.error` xattr.
    pub fn last_error_for(&self, id: &str) -> Option<String> {
        self.sessions
            .get(id)
            .and_then(|h| h.inner.try_lock().ok().and_then(|g| g.last_error.clone()))
    }

    /// Count of sessions not yet in a terminal state (§4.13's cheap
    /// aggregate path). Sessions whose state can't be locked immediately
    /// are counted as in-flight.
    pub fn pending_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .inner
                    .try_lock()
                    .map(|g| !g.state.is_terminal())
                    .unwrap_or(true)
            })
            .count()
    }

    async fn run_session(&self, id: &str, ctx: OpContext) {
        let handle = match self.sessions.get(id).map(|h| h.clone()) {
            Some(h) => h,
            None => return,
        };
        handle.set_state(DownloadState::Started, None).await;
        let _ = self.metadata.transition(id, LifecycleState::Hydrating);

        let mut attempt = 0u32;
        let mut backoff = self.config.backoff_initial;
        loop {
            if ctx.is_cancelled() {
                handle.set_state(DownloadState::Cancelled, None).await;
                return;
            }
            match self.remote.download(&ctx, id).await {
                Ok(bytes) => {
                    if let Err(e) = self.finish_success(id, &bytes).await {
                        warn!("download {id} post-processing failed: {e}");
                        handle
                            .set_state(DownloadState::Errored, Some(e.to_string()))
                            .await;
                    } else {
                        handle.set_state(DownloadState::Completed, None).await;
                    }
                    return;
                }
                Err(e) if e.is_retryable() && attempt < self.config.retry_ceiling => {
                    attempt += 1;
                    warn!("download {id} attempt {attempt} failed: {e}, retrying in {backoff:?}");
                    tokio::select! {
                        _ = ctx.cancelled() => {
                            handle.set_state(DownloadState::Cancelled, None).await;
                            return;
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = std::cmp::min(backoff * 2, self.config.backoff_cap);
                }
                Err(e) => {
                    let _ = self.metadata.transition(id, LifecycleState::Ghost);
                    handle
                        .set_state(DownloadState::Errored, Some(e.to_string()))
                        .await;
                    return;
                }
            }
        }
    }

    async fn finish_success(&self, id: &str, bytes: &[u8]) -> Result<()> {
        self.cache.insert(id, bytes)?;
        let entry = self.metadata.get(id)?.ok_or(Error::NotFound)?;
        if let Some(expected) = entry.hash {
            if !self.cache.verify(id, expected)? {
                self.cache.delete(id)?;
                self.metadata.transition(id, LifecycleState::Ghost)?;
                return Err(Error::CacheCorruption(format!("hash mismatch for {id}")));
            }
        } else {
            let computed = ContentHash::of_bytes(bytes);
            self.metadata.update(id, |e| e.hash = Some(computed))?;
        }
        self.metadata.transition(id, LifecycleState::Hydrated)?;
        // Keep the slot pinned across the GHOST->HYDRATING->HYDRATED
        // auto-hydrate cycle iff the item is still pin=always (§4.4).
        self.cache.set_pinned(id, entry.pin_mode == PinMode::Always);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{ItemKind, MetadataEntry};
    use crate::remote::MockRemoteClient;

    fn setup() -> (tempfile::TempDir, Arc<DownloadManager>, Arc<MetadataStore>, Arc<MockRemoteClient>) {
        let dir = tempfile::tempdir().unwrap();
        let metadata = Arc::new(MetadataStore::open(&dir.path().join("m.db")).unwrap());
        let cache = ContentCache::open(dir.path().join("content"), 0).unwrap();
        let remote = Arc::new(MockRemoteClient::new());
        let mut entry = MetadataEntry::new_root("f1", crate::metadata::now_millis());
        entry.kind = ItemKind::File;
        entry.state = LifecycleState::Ghost;
        metadata.save(&entry).unwrap();
        let manager = DownloadManager::new(remote.clone(), cache, metadata.clone(), DownloadConfig::default());
        (dir, manager, metadata, remote)
    }

    #[tokio::test]
    async fn queue_download_dedups_same_id() {
        let (_d, manager, _m, _r) = setup();
        let group = TaskGroup::new();
        manager.spawn_workers(&group);
        let h1 = manager.queue_download("f1");
        let h2 = manager.queue_download("f1");
        assert!(Arc::ptr_eq(&h1, &h2));
        group.shutdown().await;
    }

    #[tokio::test]
    async fn successful_download_hydrates_and_verifies_hash() {
        let (_d, manager, metadata, remote) = setup();
        remote.seed_content("f1", b"hello world".to_vec());
        let group = TaskGroup::new();
        manager.spawn_workers(&group);
        let handle = manager.queue_download("f1");
        let state = handle.wait().await;
        assert_eq!(state, DownloadState::Completed);
        let entry = metadata.get("f1").unwrap().unwrap();
        assert_eq!(entry.state, LifecycleState::Hydrated);
        assert!(entry.hash.is_some());
        group.shutdown().await;
    }

    #[tokio::test]
    async fn offline_download_errors_without_retry_storm() {
        let (_d, manager, metadata, remote) = setup();
        remote.set_offline(true);
        let group = TaskGroup::new();
        manager.spawn_workers(&group);
        let handle = manager.queue_download("f1");
        let state = handle.wait().await;
        assert_eq!(state, DownloadState::Errored);
        let entry = metadata.get("f1").unwrap().unwrap();
        assert_eq!(entry.state, LifecycleState::Ghost);
        group.shutdown().await;
    }
}
