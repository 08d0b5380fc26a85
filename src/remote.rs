//! Pluggable external collaborators consumed by the core (§6, §9 "Dynamic
//! dispatch"): the remote HTTP client, the realtime notifier, and the
//! status observer surface. Transport, auth, and the bus are out of scope
//! (spec §1) — only the trait boundaries live here, plus an in-memory mock
//! of each for the crate's own test suite, styled after the corpus's
//! `ICloudProvider` / `IStateRepository` port traits
//! (`other_examples/.../cloud_provider.rs`).

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::concurrency::OpContext;
use crate::error::{Error, Result};
use crate::hash::ContentHash;
use crate::status::FileStatus;

/// Port-level DTO describing one remote item, returned by `get_item`,
/// `get_children`, and as part of delta pages.
#[derive(Debug, Clone)]
pub struct DriveItem {
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub size: u64,
    pub hash: Option<ContentHash>,
    pub etag: String,
    pub last_modified_millis: i64,
    pub is_directory: bool,
    pub deleted: bool,
}

/// One page of delta results (§6 `delta(token) -> {items, next | done+token}`).
#[derive(Debug, Clone)]
pub struct DeltaPage {
    pub items: Vec<DriveItem>,
    /// Opaque continuation token for the next page; `None` means this page
    /// was terminal and `done_token` carries the token to persist.
    pub next: Option<String>,
    pub done_token: Option<String>,
}

/// Outcome of uploading one chunk of a resumable session.
#[derive(Debug, Clone)]
pub enum ChunkOutcome {
    /// More data is expected, starting at this offset.
    NextRangeStart(u64),
    /// The upload is complete; here is the final item.
    Done(DriveItem),
    /// HTTP 416 Range Not Satisfiable: the server's accepted range differs
    /// from what the client expected. Per the open question in spec §9,
    /// the upload manager re-probes via `probe_upload_session` before
    /// deciding whether to resume from `accepted_start` or restart.
    RangeMismatch { accepted_start: u64 },
}

/// A freshly created chunked upload session endpoint.
#[derive(Debug, Clone)]
pub struct UploadSessionHandle {
    pub url: String,
    pub expires_millis: i64,
}

/// Remote HTTP client interface consumed by the upload/download managers
/// and the delta loop (§6). Authentication and token refresh are the
/// implementation's responsibility.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn get_item(&self, ctx: &OpContext, id: &str) -> Result<DriveItem>;
    async fn get_children(&self, ctx: &OpContext, id: &str) -> Result<Vec<DriveItem>>;
    async fn download(&self, ctx: &OpContext, id: &str) -> Result<Vec<u8>>;
    async fn put_content(&self, ctx: &OpContext, id: &str, bytes: &[u8]) -> Result<DriveItem>;
    async fn create_upload_session(
        &self,
        ctx: &OpContext,
        parent_id: &str,
        name: &str,
    ) -> Result<UploadSessionHandle>;
    async fn put_chunk(
        &self,
        ctx: &OpContext,
        url: &str,
        offset: u64,
        total: u64,
        bytes: &[u8],
    ) -> Result<ChunkOutcome>;
    /// Re-probe the server's accepted range for a stalled chunked session
    /// (spec §9's open question on HTTP 416 handling).
    async fn probe_upload_session(&self, ctx: &OpContext, url: &str) -> Result<u64>;
    async fn delete_item(&self, ctx: &OpContext, id: &str) -> Result<()>;
    async fn delta(&self, ctx: &OpContext, token: Option<&str>) -> Result<DeltaPage>;
}

/// Health snapshot of a realtime notifier (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifierStatus {
    Healthy,
    Degraded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct NotifierHealth {
    pub status: NotifierStatus,
    pub missed: u32,
    pub consecutive_failures: u32,
    pub reconnect_count: u32,
    pub last_error: Option<String>,
}

/// Optional push channel signaling that remote changes are available
/// (§4.7, §6). Its health drives the delta loop's polling interval.
#[async_trait]
pub trait RealtimeNotifier: Send + Sync {
    async fn start(&self, ctx: &OpContext) -> Result<()>;
    async fn stop(&self, ctx: &OpContext) -> Result<()>;
    fn is_active(&self) -> bool;
    fn health(&self) -> NotifierHealth;
    /// A receiver that wakes whenever the notifier believes remote changes
    /// are available. Each call returns an independent subscription.
    fn notifications(&self) -> broadcast::Receiver<()>;
}

/// Observer interface for file-status transitions (§4.9, §6), consumed by
/// desktop-integration shells over an external transport.
pub trait StatusObserver: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<(String, FileStatus)>;
    fn emit(&self, path: &str, status: FileStatus);
}

/// Default in-process observer: a broadcast channel plus a snapshot map
/// for `query`.
pub struct BroadcastObserver {
    sender: broadcast::Sender<(String, FileStatus)>,
    last: Mutex<HashMap<String, FileStatus>>,
}

impl BroadcastObserver {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            sender,
            last: Mutex::new(HashMap::new()),
        }
    }

    pub fn query(&self, path: &str) -> Option<FileStatus> {
        self.last.lock().unwrap().get(path).copied()
    }
}

impl Default for BroadcastObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusObserver for BroadcastObserver {
    fn subscribe(&self) -> broadcast::Receiver<(String, FileStatus)> {
        self.sender.subscribe()
    }

    fn emit(&self, path: &str, status: FileStatus) {
        self.last
            .lock()
            .unwrap()
            .insert(path.to_string(), status);
        let _ = self.sender.send((path.to_string(), status));
    }
}

/// In-memory mock of [`RemoteClient`], used only by this crate's own test
/// suite (never by production code — the real HTTP client is out of
/// scope).
pub struct MockRemoteClient {
    items: Mutex<HashMap<String, DriveItem>>,
    content: Mutex<HashMap<String, Vec<u8>>>,
    delta_queue: Mutex<Vec<DriveItem>>,
    offline: std::sync::atomic::AtomicBool,
}

impl MockRemoteClient {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            content: Mutex::new(HashMap::new()),
            delta_queue: Mutex::new(Vec::new()),
            offline: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline
            .store(offline, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn seed_item(&self, item: DriveItem) {
        self.items.lock().unwrap().insert(item.id.clone(), item);
    }

    pub fn seed_content(&self, id: &str, bytes: Vec<u8>) {
        self.content.lock().unwrap().insert(id.to_string(), bytes);
    }

    pub fn push_delta(&self, item: DriveItem) {
        self.delta_queue.lock().unwrap().push(item);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(std::sync::atomic::Ordering::SeqCst) {
            Err(Error::Offline)
        } else {
            Ok(())
        }
    }
}

impl Default for MockRemoteClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteClient for MockRemoteClient {
    async fn get_item(&self, _ctx: &OpContext, id: &str) -> Result<DriveItem> {
        self.check_online()?;
        self.items.lock().unwrap().get(id).cloned().ok_or(Error::NotFound)
    }

    async fn get_children(&self, _ctx: &OpContext, id: &str) -> Result<Vec<DriveItem>> {
        self.check_online()?;
        Ok(self
            .items
            .lock()
            .unwrap()
            .values()
            .filter(|i| i.parent_id.as_deref() == Some(id))
            .cloned()
            .collect())
    }

    async fn download(&self, _ctx: &OpContext, id: &str) -> Result<Vec<u8>> {
        self.check_online()?;
        self.content
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or(Error::NotFound)
    }

    async fn put_content(&self, _ctx: &OpContext, id: &str, bytes: &[u8]) -> Result<DriveItem> {
        self.check_online()?;
        self.content
            .lock()
            .unwrap()
            .insert(id.to_string(), bytes.to_vec());
        let mut items = self.items.lock().unwrap();
        let item = items.entry(id.to_string()).or_insert_with(|| DriveItem {
            id: id.to_string(),
            name: id.to_string(),
            parent_id: None,
            size: 0,
            hash: None,
            etag: "e0".into(),
            last_modified_millis: 0,
            is_directory: false,
            deleted: false,
        });
        item.size = bytes.len() as u64;
        item.hash = Some(ContentHash::of_bytes(bytes));
        item.etag = format!("e{}", uuid::Uuid::new_v4());
        Ok(item.clone())
    }

    async fn create_upload_session(
        &self,
        _ctx: &OpContext,
        _parent_id: &str,
        name: &str,
    ) -> Result<UploadSessionHandle> {
        self.check_online()?;
        Ok(UploadSessionHandle {
            url: format!("mock://upload/{name}/{}", uuid::Uuid::new_v4()),
            expires_millis: i64::MAX,
        })
    }

    async fn put_chunk(
        &self,
        _ctx: &OpContext,
        _url: &str,
        offset: u64,
        total: u64,
        bytes: &[u8],
    ) -> Result<ChunkOutcome> {
        self.check_online()?;
        let end = offset + bytes.len() as u64;
        if end >= total {
            Ok(ChunkOutcome::Done(DriveItem {
                id: uuid::Uuid::new_v4().to_string(),
                name: String::new(),
                parent_id: None,
                size: total,
                hash: None,
                etag: "eF".into(),
                last_modified_millis: 0,
                is_directory: false,
                deleted: false,
            }))
        } else {
            Ok(ChunkOutcome::NextRangeStart(end))
        }
    }

    async fn probe_upload_session(&self, _ctx: &OpContext, _url: &str) -> Result<u64> {
        self.check_online()?;
        Ok(0)
    }

    async fn delete_item(&self, _ctx: &OpContext, id: &str) -> Result<()> {
        self.check_online()?;
        self.items.lock().unwrap().remove(id);
        self.content.lock().unwrap().remove(id);
        Ok(())
    }

    async fn delta(&self, _ctx: &OpContext, _token: Option<&str>) -> Result<DeltaPage> {
        self.check_online()?;
        let items = std::mem::take(&mut *self.delta_queue.lock().unwrap());
        Ok(DeltaPage {
            items,
            next: None,
            done_token: Some(uuid::Uuid::new_v4().to_string()),
        })
    }
}
