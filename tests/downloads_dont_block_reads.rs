//! A slow hydration must not stall unrelated facade operations: the
//! download manager's worker pool and the read/write path for an
//! already-hydrated entry don't share a lock that would serialize them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cloudfs_core::concurrency::OpContext;
use cloudfs_core::config::Config;
use cloudfs_core::error::Result;
use cloudfs_core::metadata::ItemKind;
use cloudfs_core::remote::{ChunkOutcome, DeltaPage, DriveItem, MockRemoteClient, RemoteClient, UploadSessionHandle};
use cloudfs_core::CloudFs;

/// Delegates everything to an inner [`MockRemoteClient`], except `download`,
/// which sleeps first to simulate a slow network fetch.
struct SlowDownloadRemote {
    inner: MockRemoteClient,
    download_delay: Duration,
}

#[async_trait]
impl RemoteClient for SlowDownloadRemote {
    async fn get_item(&self, ctx: &OpContext, id: &str) -> Result<DriveItem> {
        self.inner.get_item(ctx, id).await
    }

    async fn get_children(&self, ctx: &OpContext, id: &str) -> Result<Vec<DriveItem>> {
        self.inner.get_children(ctx, id).await
    }

    async fn download(&self, ctx: &OpContext, id: &str) -> Result<Vec<u8>> {
        tokio::time::sleep(self.download_delay).await;
        self.inner.download(ctx, id).await
    }

    async fn put_content(&self, ctx: &OpContext, id: &str, bytes: &[u8]) -> Result<DriveItem> {
        self.inner.put_content(ctx, id, bytes).await
    }

    async fn create_upload_session(&self, ctx: &OpContext, parent_id: &str, name: &str) -> Result<UploadSessionHandle> {
        self.inner.create_upload_session(ctx, parent_id, name).await
    }

    async fn put_chunk(&self, ctx: &OpContext, url: &str, offset: u64, total: u64, bytes: &[u8]) -> Result<ChunkOutcome> {
        self.inner.put_chunk(ctx, url, offset, total, bytes).await
    }

    async fn probe_upload_session(&self, ctx: &OpContext, url: &str) -> Result<u64> {
        self.inner.probe_upload_session(ctx, url).await
    }

    async fn delete_item(&self, ctx: &OpContext, id: &str) -> Result<()> {
        self.inner.delete_item(ctx, id).await
    }

    async fn delta(&self, ctx: &OpContext, token: Option<&str>) -> Result<DeltaPage> {
        self.inner.delta(ctx, token).await
    }
}

#[tokio::test]
async fn unrelated_write_completes_while_a_hydration_is_in_flight() {
    let dir = tempfile::tempdir().unwrap();
    let inner = MockRemoteClient::new();
    inner.seed_item(DriveItem {
        id: "remote-slow".into(),
        name: "slow.bin".into(),
        parent_id: Some("root".into()),
        size: 4,
        hash: None,
        etag: "e1".into(),
        last_modified_millis: 0,
        is_directory: false,
        deleted: false,
    });
    inner.seed_content("remote-slow", b"data".to_vec());
    let remote = Arc::new(SlowDownloadRemote {
        inner,
        download_delay: Duration::from_millis(400),
    });

    let mut config = Config::for_dir(dir.path().to_path_buf());
    config.delta.active_interval = Duration::from_millis(10);
    config.realtime.default_recovery_interval = Duration::from_millis(10);
    let fs = CloudFs::mount(config, remote.clone(), None).unwrap();

    // Let a real delta cycle (not a hand-rolled store write) link the
    // ghost entry into root's children, exactly as it would for a genuine
    // remote-only item.
    remote.inner.push_delta(DriveItem {
        id: "remote-slow".into(),
        name: "slow.bin".into(),
        parent_id: Some("root".into()),
        size: 4,
        hash: None,
        etag: "e1".into(),
        last_modified_millis: 0,
        is_directory: false,
        deleted: false,
    });
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while fs.facade().lookup("root", "slow.bin").is_err() {
        assert!(tokio::time::Instant::now() < deadline, "delta cycle never linked remote-slow");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let ctx = OpContext::new();
    let slow_fs = fs.clone();
    let slow_ctx = ctx.clone();
    let slow_task = tokio::spawn(async move {
        slow_fs.facade().read("remote-slow", 0, 4, &slow_ctx).await
    });

    // Give the hydration a moment to actually start before racing it.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let created = fs.facade().create("root", "fast.txt", ItemKind::File).unwrap();
    let fast_result = tokio::time::timeout(Duration::from_millis(250), async {
        fs.facade().write(&created.id, 0, b"quick", &ctx).await.unwrap();
        fs.facade().read(&created.id, 0, 5, &ctx).await.unwrap()
    })
    .await
    .expect("unrelated write/read should not wait on the in-flight hydration");
    assert_eq!(fast_result, b"quick");

    let slow_result = slow_task.await.unwrap().unwrap();
    assert_eq!(slow_result, b"data");

    fs.shutdown().await;
}
