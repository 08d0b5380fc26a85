//! Concurrency layer (§4.10, §5, C10): the lock hierarchy, cancellation
//! contexts, and graceful teardown shared by every other component.
//!
//! The lock hierarchy (acquire in this order, release in reverse):
//!   1. filesystem-wide state lock (offline flag, realtime options)
//!   2. manager locks (uploads, downloads, metadata-request queue) — any one
//!   3. inode locks — ascending id-string order when holding more than one
//!   4. session locks (upload/download) — only within the owning manager
//!   5. content-cache internal locks (not exposed)
//!
//! Nothing here *enforces* the ordering mechanically (that would need a
//! lock-tracking allocator); instead each caller site that needs more than
//! one inode lock goes through [`lock_inodes_in_order`], and the stress
//! test in `tests/concurrency_stress.rs` is the contract's regression test.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Sort two inode ids into ascending lock-acquisition order (§4.10 rule 3).
pub fn lock_inodes_in_order<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Per-operation cancellation + deadline context, threaded through every
/// suspension point (remote call, cache I/O, durable-store write) per §5.
#[derive(Clone)]
pub struct OpContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl OpContext {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_deadline(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.is_past_deadline()
    }

    pub fn is_past_deadline(&self) -> bool {
        matches!(self.deadline, Some(d) if Instant::now() >= d)
    }

    /// Check the context at a suspension point, returning `Cancelled` or
    /// `Timeout` if it should not proceed.
    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.is_past_deadline() {
            return Err(Error::Timeout);
        }
        Ok(())
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

impl Default for OpContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the process-wide root cancellation token and the set of background
/// task handles started at mount time (delta loop, download/upload workers,
/// cache cleanup, stats updater, status-cache cleanup — §4.10 "graceful
/// teardown"). `shutdown` cancels the root token and awaits every handle,
/// acting as the wait group the spec calls for.
pub struct TaskGroup {
    root: CancellationToken,
    handles: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            handles: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn root_context(&self) -> OpContext {
        OpContext {
            token: self.root.clone(),
            deadline: None,
        }
    }

    pub fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(fut);
        self.handles.lock().push(handle);
    }

    /// Cancel the root token and await every spawned task's completion.
    pub async fn shutdown(&self) {
        self.root.cancel();
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}
