//! Durable metadata entry (§3.2).

use serde::{Deserialize, Serialize};

use super::state::LifecycleState;
use crate::hash::ContentHash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemKind {
    File,
    Directory,
}

/// Overlay policy for virtual-vs-remote name collisions (§4.12, glossary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverlayPolicy {
    RemoteWins,
    LocalWins,
}

/// Pin mode (glossary): whether an item is kept hydrated across evictions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PinMode {
    Never,
    Always,
    Temporary,
}

impl Default for PinMode {
    fn default() -> Self {
        PinMode::Never
    }
}

/// A durable per-item entry (§3.2). The id is the primary key in the
/// `metadata_v2` bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub kind: ItemKind,
    pub state: LifecycleState,
    pub etag: Option<String>,
    pub size: u64,
    pub last_modified: i64,
    pub hash: Option<ContentHash>,
    pub overlay_policy: OverlayPolicy,
    pub pin_mode: PinMode,
    pub pending_remote: bool,
    pub children: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl MetadataEntry {
    pub fn new_root(id: impl Into<String>, now: i64) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            name: String::new(),
            kind: ItemKind::Directory,
            state: LifecycleState::Hydrated,
            etag: None,
            size: 0,
            last_modified: now,
            hash: None,
            overlay_policy: OverlayPolicy::RemoteWins,
            pin_mode: PinMode::Always,
            pending_remote: false,
            children: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, ItemKind::Directory)
    }
}
