//! Exercises the online/offline transition through the mounted filesystem:
//! a failed delta cycle flips `CloudFs::is_online` to false, and a
//! subsequent successful cycle flips it back, matching the cadence rules in
//! `delta.rs`.

use std::sync::Arc;
use std::time::Duration;

use cloudfs_core::concurrency::OpContext;
use cloudfs_core::config::Config;
use cloudfs_core::metadata::ItemKind;
use cloudfs_core::remote::MockRemoteClient;
use cloudfs_core::status::FileStatus;
use cloudfs_core::CloudFs;

fn fast_config(dir: &std::path::Path) -> Config {
    let mut config = Config::for_dir(dir.to_path_buf());
    config.delta.active_interval = Duration::from_millis(10);
    config.realtime.default_recovery_interval = Duration::from_millis(10);
    config
}

async fn wait_until(mut check: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn delta_loop_detects_offline_remote_and_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(MockRemoteClient::new());
    remote.set_offline(true);
    let fs = CloudFs::mount(fast_config(dir.path()), remote.clone(), None).unwrap();

    assert!(
        wait_until(|| !fs.is_online(), Duration::from_secs(2)).await,
        "delta loop should mark the filesystem offline once a cycle fails"
    );

    remote.set_offline(false);
    assert!(
        wait_until(|| fs.is_online(), Duration::from_secs(2)).await,
        "delta loop should recover once the remote becomes reachable again"
    );

    fs.shutdown().await;
}

#[tokio::test]
async fn write_while_offline_is_queued_rather_than_lost() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(MockRemoteClient::new());
    let fs = CloudFs::mount(fast_config(dir.path()), remote.clone(), None).unwrap();

    remote.set_offline(true);
    let ctx = OpContext::new();
    let created = fs.facade().create("root", "offline.txt", ItemKind::File).unwrap();
    fs.facade().write(&created.id, 0, b"queued while offline", &ctx).await.unwrap();

    // The write itself must not fail even though the upload worker can't
    // reach the remote; the session is recorded and later surfaces as an
    // error rather than silently vanishing.
    let status = fs.facade().poll(&created.id).unwrap();
    assert!(matches!(status, FileStatus::Syncing | FileStatus::Error));

    fs.shutdown().await;
}
