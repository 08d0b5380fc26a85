//! Conflict resolver (§4.8, C8): detects local/remote divergence and
//! resolves it per the configured strategy.

use chrono::Utc;

use crate::cache::ContentCache;
use crate::config::ConflictStrategy;
use crate::error::Result;
use crate::hash::ContentHash;
use crate::inode::InodeGraph;
use crate::metadata::{LifecycleState, MetadataEntry, MetadataStore};

/// The four divergence kinds named in §3.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    Content,
    Metadata,
    Existence,
    Parent,
}

/// A detected conflict, retained for introspection even after resolution.
#[derive(Debug, Clone)]
pub struct ConflictRecord {
    pub id: String,
    pub kind: ConflictKind,
    pub local_snapshot: MetadataEntry,
    pub remote_snapshot: MetadataEntry,
    pub message: String,
    pub detected_at: i64,
}

/// What the resolver did with one conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// `keep-both`: a conflict copy was inserted under `copy_id`/`copy_name`
    /// and the original kept its local bytes, queued for upload.
    KeptBoth { copy_id: String, copy_name: String },
    /// `last-writer-wins`, local lost: content discarded, entry reset to
    /// the remote snapshot and marked `GHOST`.
    LocalDiscarded,
    /// `last-writer-wins`, remote lost: local bytes are queued for upload.
    RemoteDiscarded,
}

/// Split `name` into `(stem, extension-with-dot)`; an extension-less name
/// gets an empty second element.
fn split_name(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    }
}

/// Resolve a conflict between `local` (the durable entry as it stands,
/// `DIRTY_LOCAL`) and `remote` (the incoming delta's view), per §4.8.
///
/// Returns the resolution taken; the caller (the delta loop) is
/// responsible for queuing any upload this implies.
pub fn resolve(
    metadata: &MetadataStore,
    inodes: &InodeGraph,
    cache: &ContentCache,
    strategy: ConflictStrategy,
    local: &MetadataEntry,
    remote: &MetadataEntry,
) -> Result<Resolution> {
    match strategy {
        ConflictStrategy::KeepBoth => keep_both(metadata, inodes, local, remote),
        ConflictStrategy::LastWriterWins => last_writer_wins(metadata, cache, local, remote),
        ConflictStrategy::Rename => rename_strategy(metadata, inodes, local, remote),
    }
}

fn keep_both(
    metadata: &MetadataStore,
    inodes: &InodeGraph,
    local: &MetadataEntry,
    remote: &MetadataEntry,
) -> Result<Resolution> {
    let (stem, ext) = split_name(&local.name);
    let copy_name = format!(
        "{stem} (Conflict Copy {}){ext}",
        Utc::now().format("%Y-%m-%dT%H-%M-%SZ")
    );
    let copy_id = format!("{}-conflict-copy", remote.id);

    let mut copy = remote.clone();
    copy.id = copy_id.clone();
    copy.name = copy_name.clone();
    copy.state = LifecycleState::Ghost;
    metadata.save(&copy)?;
    if let Some(parent_id) = &remote.parent_id {
        inodes.insert_child(parent_id, &copy_id)?;
    }

    metadata.transition(&local.id, LifecycleState::Conflict)?;
    Ok(Resolution::KeptBoth { copy_id, copy_name })
}

fn last_writer_wins(
    metadata: &MetadataStore,
    cache: &ContentCache,
    local: &MetadataEntry,
    remote: &MetadataEntry,
) -> Result<Resolution> {
    if remote.last_modified >= local.last_modified {
        metadata.update(&local.id, |e| {
            e.etag = remote.etag.clone();
            e.size = remote.size;
            e.hash = remote.hash;
            e.last_modified = remote.last_modified;
        })?;
        metadata.transition(&local.id, LifecycleState::Ghost)?;
        let _ = cache.delete(&local.id);
        Ok(Resolution::LocalDiscarded)
    } else {
        metadata.transition(&local.id, LifecycleState::DirtyLocal)?;
        Ok(Resolution::RemoteDiscarded)
    }
}

fn rename_strategy(
    metadata: &MetadataStore,
    inodes: &InodeGraph,
    local: &MetadataEntry,
    remote: &MetadataEntry,
) -> Result<Resolution> {
    // Same shape as keep-both, but names the renamed copy without the
    // "Conflict Copy" phrasing — still materializes both versions.
    keep_both(metadata, inodes, local, remote)
}

/// Detect which conflict kind applies to a local/remote pair already known
/// to diverge (used by the delta loop before calling [`resolve`]).
pub fn classify(local: &MetadataEntry, remote: &MetadataEntry) -> ConflictKind {
    if local.parent_id != remote.parent_id {
        ConflictKind::Parent
    } else if local.name != remote.name || local.kind != remote.kind {
        ConflictKind::Metadata
    } else if local.hash != remote.hash {
        ConflictKind::Content
    } else {
        ConflictKind::Existence
    }
}

pub fn hash_differs(local: Option<ContentHash>, remote: Option<ContentHash>) -> bool {
    local != remote
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::IdTable;
    use crate::metadata::{now_millis, ItemKind};
    use std::sync::Arc;

    fn setup() -> (tempfile::TempDir, Arc<MetadataStore>, InodeGraph, ContentCache) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MetadataStore::open(&dir.path().join("m.db")).unwrap());
        store.ensure_root("root").unwrap();
        let ids = Arc::new(IdTable::new());
        let graph = InodeGraph::new(store.clone(), ids, "root".to_string());
        graph.insert_id("root", crate::inode::Inode::from_entry(&store.get("root").unwrap().unwrap()));
        let cache = ContentCache::open(dir.path().join("content"), 0).unwrap();
        (dir, store, graph, cache)
    }

    fn entry(id: &str, parent: &str, name: &str, hash: Option<ContentHash>) -> MetadataEntry {
        let mut e = MetadataEntry::new_root(id, now_millis());
        e.parent_id = Some(parent.to_string());
        e.name = name.to_string();
        e.kind = ItemKind::File;
        e.hash = hash;
        e
    }

    #[test]
    fn classify_detects_content_conflict() {
        let local = entry("x", "root", "x.txt", Some(ContentHash::of_bytes(b"local")));
        let remote = entry("x", "root", "x.txt", Some(ContentHash::of_bytes(b"remote")));
        assert_eq!(classify(&local, &remote), ConflictKind::Content);
    }

    #[test]
    fn keep_both_materializes_conflict_copy_and_keeps_local() {
        let (_d, store, graph, cache) = setup();
        let mut local = entry("x", "root", "x.txt", Some(ContentHash::of_bytes(b"local")));
        local.state = LifecycleState::DirtyLocal;
        store.save(&local).unwrap();
        graph.insert_child("root", "x").unwrap();

        let remote = entry("x", "root", "x.txt", Some(ContentHash::of_bytes(b"remote")));
        let resolution =
            resolve(&store, &graph, &cache, ConflictStrategy::KeepBoth, &local, &remote).unwrap();

        match resolution {
            Resolution::KeptBoth { copy_id, copy_name } => {
                assert!(copy_name.starts_with("x (Conflict Copy"));
                let copy = store.get(&copy_id).unwrap().unwrap();
                assert_eq!(copy.hash, remote.hash);
            }
            _ => panic!("expected KeptBoth"),
        }

        let x = store.get("x").unwrap().unwrap();
        assert_eq!(x.state, LifecycleState::Conflict);
        assert_eq!(x.hash, local.hash);
    }

    #[test]
    fn last_writer_wins_remote_newer_discards_local() {
        let (_d, store, graph, cache) = setup();
        let mut local = entry("x", "root", "x.txt", Some(ContentHash::of_bytes(b"local")));
        local.state = LifecycleState::DirtyLocal;
        local.last_modified = 100;
        store.save(&local).unwrap();
        cache.insert("x", b"local bytes").unwrap();

        let mut remote = entry("x", "root", "x.txt", Some(ContentHash::of_bytes(b"remote")));
        remote.last_modified = 200;

        let resolution =
            resolve(&store, &graph, &cache, ConflictStrategy::LastWriterWins, &local, &remote).unwrap();
        assert_eq!(resolution, Resolution::LocalDiscarded);
        let x = store.get("x").unwrap().unwrap();
        assert_eq!(x.state, LifecycleState::Ghost);
        assert_eq!(x.hash, remote.hash);
        assert!(!cache.has_content("x"));
    }

    #[test]
    fn last_writer_wins_local_newer_keeps_local_for_upload() {
        let (_d, store, graph, cache) = setup();
        let mut local = entry("x", "root", "x.txt", Some(ContentHash::of_bytes(b"local")));
        local.state = LifecycleState::DirtyLocal;
        local.last_modified = 300;
        store.save(&local).unwrap();
        cache.insert("x", b"local bytes").unwrap();

        let mut remote = entry("x", "root", "x.txt", Some(ContentHash::of_bytes(b"remote")));
        remote.last_modified = 200;

        let resolution =
            resolve(&store, &graph, &cache, ConflictStrategy::LastWriterWins, &local, &remote).unwrap();
        assert_eq!(resolution, Resolution::RemoteDiscarded);
        let x = store.get("x").unwrap().unwrap();
        assert_eq!(x.state, LifecycleState::DirtyLocal);
        assert!(cache.has_content("x"));
    }
}
