//! Identifier & path model (§4.1, C1).
//!
//! Two disjoint id namespaces (remote ids assigned by the server, local ids
//! minted for offline-created items) plus the node-id <-> id bijection that
//! the kernel-facing facade needs (§3.1).

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::error::{Error, Result};

/// Prefix that marks an id as locally minted rather than server-assigned.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// A monotonically assigned 64-bit kernel-facing handle.
pub type NodeId = u64;

/// True if `id` was minted locally and has no corresponding remote id yet.
pub fn is_local(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}

/// Case-insensitive canonicalization of a path component for directory
/// lookups (§4.1: "canonical comparison lower-cases both sides").
pub fn canonical_name(name: &str) -> String {
    name.to_lowercase()
}

/// Mints fresh local ids and maintains the bidirectional {id <-> NodeId}
/// index invariant (§3.1). Backed by two `DashMap`s kept in sync under a
/// single insertion/removal path, rather than a dedicated bimap crate —
/// `dashmap` is already part of the dependency stack for the session
/// tables, so reusing it here avoids adding another concurrent-map crate
/// for the same job.
#[derive(Debug, Default)]
pub struct IdTable {
    next_local: AtomicU64,
    next_node: AtomicU64,
    id_to_node: DashMap<String, NodeId>,
    node_to_id: DashMap<NodeId, String>,
}

impl IdTable {
    pub fn new() -> Self {
        Self {
            next_local: AtomicU64::new(1),
            next_node: AtomicU64::new(1),
            id_to_node: DashMap::new(),
            node_to_id: DashMap::new(),
        }
    }

    /// Mint a fresh, unused local id.
    pub fn mint_local_id(&self) -> String {
        let n = self.next_local.fetch_add(1, Ordering::Relaxed);
        format!("{LOCAL_ID_PREFIX}{n}")
    }

    /// Assign a node id to `id` if it doesn't already have one, returning
    /// the (possibly pre-existing) node id.
    pub fn node_id_for(&self, id: &str) -> NodeId {
        if let Some(existing) = self.id_to_node.get(id) {
            return *existing;
        }
        let nid = self.next_node.fetch_add(1, Ordering::Relaxed);
        self.id_to_node.insert(id.to_string(), nid);
        self.node_to_id.insert(nid, id.to_string());
        nid
    }

    pub fn get_node_id(&self, id: &str) -> Option<NodeId> {
        self.id_to_node.get(id).map(|v| *v)
    }

    pub fn get_id(&self, node_id: NodeId) -> Option<String> {
        self.node_to_id.get(&node_id).map(|v| v.clone())
    }

    /// Rename `old` to `new` across the index, atomically with respect to
    /// any single reader (each map update happens under its own shard
    /// lock; callers needing a stronger atomicity guarantee across both
    /// maps serialize through the metadata store's transaction instead,
    /// per the lock hierarchy of §4.10).
    ///
    /// Fails if `new` already exists and refers to a different id than
    /// `old` (§4.1: "fails if new already exists and differs").
    pub fn move_id(&self, old: &str, new: &str) -> Result<()> {
        if old == new {
            return Ok(());
        }
        if let Some(existing) = self.id_to_node.get(new) {
            if *existing != self.get_node_id(old).unwrap_or(u64::MAX) {
                return Err(Error::AlreadyExists);
            }
        }
        if let Some((_, nid)) = self.id_to_node.remove(old) {
            self.node_to_id.insert(nid, new.to_string());
            self.id_to_node.insert(new.to_string(), nid);
        }
        Ok(())
    }

    pub fn remove(&self, id: &str) {
        if let Some((_, nid)) = self.id_to_node.remove(id) {
            self.node_to_id.remove(&nid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_id_prefix() {
        let table = IdTable::new();
        let id = table.mint_local_id();
        assert!(is_local(&id));
        assert!(!is_local("01ABC"));
    }

    #[test]
    fn move_id_round_trip_restores_index() {
        let table = IdTable::new();
        let a = table.mint_local_id();
        let nid = table.node_id_for(&a);
        table.move_id(&a, "remote-1").unwrap();
        assert_eq!(table.get_node_id("remote-1"), Some(nid));
        assert_eq!(table.get_id(nid).as_deref(), Some("remote-1"));

        table.move_id("remote-1", &a).unwrap();
        assert_eq!(table.get_node_id(&a), Some(nid));
        assert_eq!(table.get_id(nid).as_deref(), Some(a.as_str()));
    }

    #[test]
    fn move_id_rejects_conflicting_existing_target() {
        let table = IdTable::new();
        let a = table.mint_local_id();
        let b = table.mint_local_id();
        table.node_id_for(&a);
        table.node_id_for(&b);
        assert!(table.move_id(&a, &b).is_err());
    }

    #[test]
    fn canonical_name_lowercases() {
        assert_eq!(canonical_name("Résumé.TXT"), "résumé.txt");
    }
}
