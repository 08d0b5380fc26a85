//! Upload manager (§4.6, C6): simple and chunked resumable uploads, an
//! offline queue, priority scheduling, and graceful shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};

use crate::cache::ContentCache;
use crate::concurrency::{OpContext, TaskGroup};
use crate::config::UploadConfig;
use crate::error::{Error, Result};
use crate::inode::InodeGraph;
use crate::metadata::{now_millis, LifecycleState, MetadataStore, OfflineChangeKind, PinMode};
use crate::remote::{ChunkOutcome, RemoteClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UploadPriority {
    Low,
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadState {
    NotStarted,
    Started,
    Complete,
    Errored,
    Cancelled,
}

impl UploadState {
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadState::Complete | UploadState::Errored | UploadState::Cancelled)
    }
}

/// Persisted upload progress (§3.2), stored in the `uploads` bucket so a
/// process restart can resume a chunked session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: String,
    pub target_name: String,
    pub parent_id: String,
    pub total_size: u64,
    pub offset: u64,
    pub bytes_uploaded: u64,
    pub state: UploadState,
    pub resumable: bool,
    pub resume_endpoint: Option<String>,
    pub last_error: Option<String>,
    pub created_at: i64,
}

struct HandleInner {
    session: UploadSession,
    ctx: OpContext,
}

pub struct UploadHandle {
    inner: AsyncMutex<HandleInner>,
    notify: Notify,
}

impl UploadHandle {
    pub async fn state(&self) -> UploadState {
        self.inner.lock().await.session.state
    }

    pub async fn wait(&self) -> UploadState {
        loop {
            {
                let guard = self.inner.lock().await;
                if guard.session.state.is_terminal() {
                    return guard.session.state;
                }
            }
            self.notify.notified().await;
        }
    }

    async fn set_state(&self, state: UploadState, last_error: Option<String>) {
        let mut guard = self.inner.lock().await;
        guard.session.state = state;
        guard.session.last_error = last_error;
        drop(guard);
        self.notify.notify_waiters();
    }
}

/// The upload manager (C6).
pub struct UploadManager {
    sessions: DashMap<String, Arc<UploadHandle>>,
    high_tx: mpsc::UnboundedSender<String>,
    normal_tx: mpsc::UnboundedSender<String>,
    low_tx: mpsc::UnboundedSender<String>,
    high_rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<String>>>,
    normal_rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<String>>>,
    low_rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<String>>>,
    remote: Arc<dyn RemoteClient>,
    cache: ContentCache,
    metadata: Arc<MetadataStore>,
    inodes: Arc<InodeGraph>,
    config: UploadConfig,
    accepting: AtomicBool,
    root: parking_lot::Mutex<OpContext>,
}

impl UploadManager {
    pub fn new(
        remote: Arc<dyn RemoteClient>,
        cache: ContentCache,
        metadata: Arc<MetadataStore>,
        inodes: Arc<InodeGraph>,
        config: UploadConfig,
    ) -> Arc<Self> {
        let (high_tx, high_rx) = mpsc::unbounded_channel();
        let (normal_tx, normal_rx) = mpsc::unbounded_channel();
        let (low_tx, low_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            sessions: DashMap::new(),
            high_tx,
            normal_tx,
            low_tx,
            high_rx: Arc::new(AsyncMutex::new(high_rx)),
            normal_rx: Arc::new(AsyncMutex::new(normal_rx)),
            low_rx: Arc::new(AsyncMutex::new(low_rx)),
            remote,
            cache,
            metadata,
            inodes,
            config,
            accepting: AtomicBool::new(true),
            root: parking_lot::Mutex::new(OpContext::new()),
        })
    }

    pub fn spawn_workers(self: &Arc<Self>, group: &TaskGroup, worker_count: usize) {
        *self.root.lock() = group.root_context();
        for worker_id in 0..worker_count {
            let manager = self.clone();
            let root = group.root_context();
            group.spawn(async move {
                manager.worker_loop(worker_id, root).await;
            });
        }
    }

    /// Non-blocking snapshot of `id`'s upload state, for the status engine
    /// (§4.9). `None` means there is no session for `id` right now.
    pub fn get_state_for(&self, id: &str) -> Option<UploadState> {
        self.sessions
            .get(id)
            .and_then(|h| h.inner.try_lock().ok().map(|g| g.session.state))
    }

    /// Non-blocking snapshot of `id`'s last recorded error message, for the
    /// facade's `user.*.error` xattr.
    pub fn last_error_for(&self, id: &str) -> Option<String> {
        self.sessions
            .get(id)
            .and_then(|h| h.inner.try_lock().ok().and_then(|g| g.session.last_error.clone()))
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
                    .map(|g| !g.session.state.is_terminal())
                    .unwrap_or(true)
            })
            .count()
    }

    /// Queue `inode_id` for upload at `priority`. High priority jumps ahead
    /// in the scheduling queue but never preempts an in-flight transfer
    /// (§4.6). If the remote is unreachable the session is still recorded
    /// and the item transitions to `DIRTY_LOCAL`; `process_offline_changes`
    /// drains it once connectivity returns.
    pub fn queue_upload(&self, inode_id: &str, priority: UploadPriority, total_size: u64, parent_id: &str, target_name: &str) -> Result<Arc<UploadHandle>> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        if let Some(existing) = self.sessions.get(inode_id) {
            return Ok(existing.clone());
        }

        let session = UploadSession {
            id: inode_id.to_string(),
            target_name: target_name.to_string(),
            parent_id: parent_id.to_string(),
            total_size,
            offset: 0,
            bytes_uploaded: 0,
            state: UploadState::NotStarted,
            resumable: total_size >= self.config.large_threshold,
            resume_endpoint: None,
            last_error: None,
            created_at: now_millis(),
        };
        self.persist(&session)?;

        let handle = Arc::new(UploadHandle {
            inner: AsyncMutex::new(HandleInner {
                session,
                ctx: self.root.lock().child(),
            }),
            notify: Notify::new(),
        });
        self.sessions.insert(inode_id.to_string(), handle.clone());

        let _ = self.metadata.transition(inode_id, LifecycleState::DirtyLocal);

        let tx = match priority {
            UploadPriority::High => &self.high_tx,
            UploadPriority::Normal => &self.normal_tx,
            UploadPriority::Low => &self.low_tx,
        };
        let _ = tx.send(inode_id.to_string());
        Ok(handle)
    }

    fn persist(&self, session: &UploadSession) -> Result<()> {
        let bytes = bincode::serialize(session)
            .map_err(|e| Error::Internal(format!("upload session serialization error: {e}")))?;
        self.metadata.save_upload_bytes(&session.id, &bytes)
    }

    /// Resume any upload sessions persisted before a restart.
    pub fn recover_persisted(self: &Arc<Self>) -> Result<usize> {
        let mut recovered = 0;
        for id in self.metadata.all_upload_ids()? {
            if self.sessions.contains_key(&id) {
                continue;
            }
            if let Some(bytes) = self.metadata.get_upload_bytes(&id)? {
                let session: UploadSession = bincode::deserialize(&bytes)
                    .map_err(|e| Error::Internal(format!("upload session deserialization error: {e}")))?;
                if session.state.is_terminal() {
                    continue;
                }
                let handle = Arc::new(UploadHandle {
                    inner: AsyncMutex::new(HandleInner {
                        session: session.clone(),
                        ctx: self.root.lock().child(),
                    }),
                    notify: Notify::new(),
                });
                self.sessions.insert(id.clone(), handle);
                let _ = self.normal_tx.send(id);
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Drain sessions and changes recorded while offline (§4.6). Resumes
    /// pending upload sessions, then replays `Delete` records against
    /// `remote` and clears `Rename`/`Move` records outright (there is no
    /// remote rename/move endpoint to replay them against; the local
    /// rename already took effect). `Create`/`Modify` records are cleared
    /// separately once their corresponding upload session completes.
    pub async fn process_offline_changes(self: &Arc<Self>) -> Result<usize> {
        let recovered = self.recover_persisted()?;

        let ctx = self.root.lock().child();
        let mut drained = 0usize;
        for change in self.metadata.all_offline_changes()? {
            match change.kind {
                OfflineChangeKind::Delete => match self.remote.delete_item(&ctx, &change.id).await {
                    Ok(()) => {
                        let _ = self.metadata.clear_offline_changes_for(&change.id);
                        drained += 1;
                    }
                    Err(Error::NotFound) => {
                        // Already gone on the server; nothing left to replay.
                        let _ = self.metadata.clear_offline_changes_for(&change.id);
                        drained += 1;
                    }
                    Err(e) => {
                        warn!("replay of offline delete for {} failed: {e}", change.id);
                    }
                },
                OfflineChangeKind::Rename | OfflineChangeKind::Move => {
                    let _ = self.metadata.clear_offline_changes_for(&change.id);
                    drained += 1;
                }
                OfflineChangeKind::Create | OfflineChangeKind::Modify => {}
            }
        }
        Ok(recovered + drained)
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, root: OpContext) {
        loop {
            let id = tokio::select! {
                biased;
                _ = root.cancelled() => return,
                id = Self::recv_next(&self.high_rx) => id,
                id = Self::recv_next(&self.normal_rx) => id,
                id = Self::recv_next(&self.low_rx) => id,
            };
            let Some(id) = id else { return };
            debug!("upload worker {worker_id} picked up {id}");
            let handle = match self.sessions.get(&id).map(|h| h.clone()) {
                Some(h) => h,
                None => continue,
            };
            let ctx = handle.inner.lock().await.ctx.clone();
            if let Err(e) = futures::FutureExt::catch_unwind(std::panic::AssertUnwindSafe(
                self.run_session(&id, handle.clone(), ctx),
            ))
            .await
            {
                error!("upload worker {worker_id} panicked processing {id}: {e:?}");
                handle
                    .set_state(UploadState::Errored, Some("internal panic during upload".into()))
                    .await;
            }
        }
    }

    async fn recv_next(rx: &Arc<AsyncMutex<mpsc::UnboundedReceiver<String>>>) -> Option<String> {
        rx.lock().await.recv().await
    }

    async fn run_session(&self, id: &str, handle: Arc<UploadHandle>, ctx: OpContext) {
        handle.set_state(UploadState::Started, None).await;

        let bytes = match self.cache.read_all(id) {
            Ok(b) => b,
            Err(e) => {
                handle.set_state(UploadState::Errored, Some(e.to_string())).await;
                return;
            }
        };

        let result = if (bytes.len() as u64) < self.config.large_threshold {
            self.upload_simple(id, &bytes, &ctx).await
        } else {
            self.upload_chunked(id, &bytes, &handle, &ctx).await
        };

        match result {
            Ok(()) => {
                let mut guard = handle.inner.lock().await;
                guard.session.bytes_uploaded = bytes.len() as u64;
                guard.session.state = UploadState::Complete;
                guard.session.last_error = None;
                let session = guard.session.clone();
                drop(guard);
                let _ = self.persist(&session);
                let _ = self.metadata.remove_upload(id);
                let _ = self.metadata.transition(id, LifecycleState::Hydrated);
                if let Ok(Some(entry)) = self.metadata.get(id) {
                    self.cache.set_pinned(id, entry.pin_mode == PinMode::Always);
                }
                // The upload reaching the server is what finally resolves any
                // offline-recorded change against this id (§4.6, §8 scenario 1).
                let _ = self.metadata.clear_offline_changes_for(id);
                handle.notify.notify_waiters();
            }
            Err(Error::Cancelled) => {
                handle.set_state(UploadState::Cancelled, None).await;
            }
            Err(e) => {
                warn!("upload {id} failed: {e}");
                handle.set_state(UploadState::Errored, Some(e.to_string())).await;
            }
        }
    }

    async fn upload_simple(&self, id: &str, bytes: &[u8], ctx: &OpContext) -> Result<()> {
        ctx.check()?;
        let item = self.remote.put_content(ctx, id, bytes).await?;
        self.apply_server_item(id, &item)
    }

    async fn upload_chunked(&self, id: &str, bytes: &[u8], handle: &Arc<UploadHandle>, ctx: &OpContext) -> Result<()> {
        let (parent_id, target_name, mut offset, url) = {
            let guard = handle.inner.lock().await;
            (
                guard.session.parent_id.clone(),
                guard.session.target_name.clone(),
                guard.session.offset,
                guard.session.resume_endpoint.clone(),
            )
        };

        let url = match url {
            Some(u) => u,
            None => {
                let session_handle = self
                    .remote
                    .create_upload_session(ctx, &parent_id, &target_name)
                    .await?;
                let mut guard = handle.inner.lock().await;
                guard.session.resume_endpoint = Some(session_handle.url.clone());
                let persisted = guard.session.clone();
                drop(guard);
                self.persist(&persisted)?;
                session_handle.url
            }
        };

        let total = bytes.len() as u64;
        loop {
            ctx.check()?;
            if offset >= total {
                return Ok(());
            }
            let end = std::cmp::min(offset + self.config.chunk_size as u64, total);
            let chunk = &bytes[offset as usize..end as usize];
            match self.remote.put_chunk(ctx, &url, offset, total, chunk).await {
                Ok(ChunkOutcome::NextRangeStart(next)) => {
                    offset = next;
                    let mut guard = handle.inner.lock().await;
                    guard.session.offset = offset;
                    guard.session.bytes_uploaded = offset;
                    let persisted = guard.session.clone();
                    drop(guard);
                    self.persist(&persisted)?;
                }
                Ok(ChunkOutcome::Done(item)) => {
                    return self.apply_server_item(id, &item);
                }
                Ok(ChunkOutcome::RangeMismatch { accepted_start }) => {
                    // Re-probe before deciding resume-vs-restart (§9 open
                    // question), then trust whichever is further along.
                    let probed = self.remote.probe_upload_session(ctx, &url).await.unwrap_or(accepted_start);
                    offset = std::cmp::max(accepted_start, probed);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn apply_server_item(&self, id: &str, item: &crate::remote::DriveItem) -> Result<()> {
        self.metadata.update(id, |e| {
            e.etag = Some(item.etag.clone());
            e.size = item.size;
            e.hash = item.hash;
            e.pending_remote = false;
        })?;
        if item.id != id {
            self.inodes.promote_local_id(id, &item.id)?;
        }
        Ok(())
    }

    /// Stop accepting new sessions, give in-flight transfers up to
    /// `graceful_timeout` to finish and persist their progress, then cancel
    /// whatever remains (§4.6, §9 "graceful teardown").
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + self.config.graceful_timeout;
        loop {
            let all_terminal = self
                .sessions
                .iter()
                .all(|entry| matches!(entry.value().inner.try_lock(), Ok(g) if g.session.state.is_terminal()));
            if all_terminal || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
        self.root.lock().cancel();
    }
}
