//! Virtual file overlay (§4.12, C12): local-only synthetic entries that
//! shadow or supplement the remote namespace.
//!
//! Includes the supplemented `.drive-info` quota entry (not named in the
//! distilled spec, grounded in the pack's `UserInfo { quota_used,
//! quota_total }` port DTO) as the overlay's second realistic use case
//! beyond a single hard-coded example.

use std::time::SystemTime;

use parking_lot::RwLock;

use crate::ids::canonical_name;
use crate::inode::{Inode, InodeFlags};
use crate::metadata::{ItemKind, OverlayPolicy};

/// One registered virtual entry: its inode presentation plus the bytes
/// served synchronously on read.
#[derive(Clone)]
pub struct VirtualEntry {
    pub inode: Inode,
    pub content: Vec<u8>,
    pub policy: OverlayPolicy,
}

/// How a name collision between a virtual and a remote entry resolves in
/// `readdir`/`lookup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionOutcome {
    VirtualOnly,
    RemoteOnly,
    Both,
}

/// The overlay registry (C12). Entries are kept in registration order so
/// `readdir` ordering (§15 open-question decision: virtual entries first,
/// in registration order) is deterministic.
pub struct OverlayRegistry {
    entries: RwLock<Vec<VirtualEntry>>,
}

impl OverlayRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Register (or replace) a virtual entry under `parent_id`.
    pub fn register(&self, parent_id: &str, id: &str, name: &str, content: Vec<u8>, policy: OverlayPolicy) {
        let inode = Inode {
            id: id.to_string(),
            name: name.to_string(),
            parent_id: Some(parent_id.to_string()),
            kind: ItemKind::File,
            size: content.len() as u64,
            mtime: SystemTime::now(),
            etag: None,
            hash: None,
            flags: InodeFlags {
                has_local_changes: false,
                is_virtual: true,
            },
            children: Default::default(),
            xattrs: Default::default(),
        };
        let entry = VirtualEntry {
            inode,
            content,
            policy,
        };
        let mut entries = self.entries.write();
        if let Some(existing) = entries.iter_mut().find(|e| e.inode.id == id) {
            *existing = entry;
        } else {
            entries.push(entry);
        }
    }

    pub fn unregister(&self, id: &str) {
        self.entries.write().retain(|e| e.inode.id != id);
    }

    pub fn get(&self, id: &str) -> Option<Inode> {
        self.entries
            .read()
            .iter()
            .find(|e| e.inode.id == id)
            .map(|e| e.inode.clone())
    }

    pub fn is_virtual(&self, id: &str) -> bool {
        self.entries.read().iter().any(|e| e.inode.id == id)
    }

    pub fn read_content(&self, id: &str) -> Option<Vec<u8>> {
        self.entries
            .read()
            .iter()
            .find(|e| e.inode.id == id)
            .map(|e| e.content.clone())
    }

    /// Virtual children of `parent_id`, in registration order (§4.12,
    /// "readdir must return virtual children interleaved with real ones").
    pub fn children_of(&self, parent_id: &str) -> Vec<Inode> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.inode.parent_id.as_deref() == Some(parent_id))
            .map(|e| e.inode.clone())
            .collect()
    }

    /// Whether a remote entry named `name` under `parent_id` should be
    /// hidden, coexist, or whether only it should show (no virtual entry
    /// of that name registered).
    pub fn resolve_collision(&self, parent_id: &str, name: &str, remote_exists: bool) -> CollisionOutcome {
        let canonical = canonical_name(name);
        let virtual_entry = self
            .entries
            .read()
            .iter()
            .find(|e| e.inode.parent_id.as_deref() == Some(parent_id) && canonical_name(&e.inode.name) == canonical)
            .map(|e| e.policy);

        match (virtual_entry, remote_exists) {
            (None, true) => CollisionOutcome::RemoteOnly,
            (None, false) => CollisionOutcome::RemoteOnly, // neither exists; caller treats as not-found
            (Some(_), false) => CollisionOutcome::VirtualOnly,
            (Some(OverlayPolicy::LocalWins), true) => CollisionOutcome::VirtualOnly,
            (Some(OverlayPolicy::RemoteWins), true) => CollisionOutcome::RemoteOnly,
        }
    }

    /// Register the supplemented `.drive-info` quota file under
    /// `parent_id` (the mount root), reporting `quota_used`/`quota_total`
    /// bytes as a small human-readable text blob.
    pub fn register_drive_info(&self, parent_id: &str, quota_used: u64, quota_total: u64) {
        let content = format!("quota_used={quota_used}\nquota_total={quota_total}\n").into_bytes();
        self.register(
            parent_id,
            "local-drive-info",
            ".drive-info",
            content,
            OverlayPolicy::LocalWins,
        );
    }
}

impl Default for OverlayRegistry {
    fn default() -> Self {
        Self::new()
    }
}
