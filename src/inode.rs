//! In-memory inode graph (§4.2, C2).
//!
//! The graph is a non-owning index into the metadata store (§3.4): inodes
//! hold only a parent *id*, never an owning handle, so the parent/child
//! relationship can't form a reference cycle (§9 "Cyclic graphs").

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::hash::ContentHash;
use crate::ids::{canonical_name, IdTable, NodeId};
use crate::metadata::{ItemKind, MetadataEntry, MetadataStore};

/// Transient, in-memory flags not persisted to the metadata store.
#[derive(Debug, Clone, Copy, Default)]
pub struct InodeFlags {
    pub has_local_changes: bool,
    pub is_virtual: bool,
}

/// In-memory inode (§3.2).
#[derive(Debug, Clone)]
pub struct Inode {
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub kind: ItemKind,
    pub size: u64,
    pub mtime: SystemTime,
    pub etag: Option<String>,
    pub hash: Option<ContentHash>,
    pub flags: InodeFlags,
    pub children: SmallVec<[String; 8]>,
    pub xattrs: HashMap<String, Vec<u8>>,
}

impl Inode {
    pub fn from_entry(entry: &MetadataEntry) -> Self {
        Self {
            id: entry.id.clone(),
            name: entry.name.clone(),
            parent_id: entry.parent_id.clone(),
            kind: entry.kind,
            size: entry.size,
            mtime: millis_to_system_time(entry.last_modified),
            etag: entry.etag.clone(),
            hash: entry.hash,
            flags: InodeFlags::default(),
            children: entry.children.iter().cloned().collect(),
            xattrs: HashMap::new(),
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, ItemKind::Directory)
    }
}

fn millis_to_system_time(ms: i64) -> SystemTime {
    if ms >= 0 {
        SystemTime::UNIX_EPOCH + std::time::Duration::from_millis(ms as u64)
    } else {
        SystemTime::UNIX_EPOCH
    }
}

struct Node {
    inode: RwLock<Inode>,
}

/// The in-memory inode graph (C2). Holds a warm cache of inodes keyed by
/// id, the id<->node-id bijection, and falls back to the metadata store
/// (never to the remote) when an entry or a directory's children are cold.
pub struct InodeGraph {
    store: Arc<MetadataStore>,
    ids: Arc<IdTable>,
    nodes: RwLock<HashMap<String, Arc<Node>>>,
    root_id: String,
    online: Arc<AtomicBool>,
}

impl InodeGraph {
    pub fn new(store: Arc<MetadataStore>, ids: Arc<IdTable>, root_id: String) -> Self {
        Self {
            store,
            ids,
            nodes: RwLock::new(HashMap::new()),
            root_id,
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    /// The shared online/offline flag (§4.7's canonical bit, owned by the
    /// delta loop). Cloned out at mount time so both components observe
    /// the same state without the graph depending on `DeltaLoop` directly.
    pub fn online_flag(&self) -> Arc<AtomicBool> {
        self.online.clone()
    }

    /// Insert or replace the warm inode for `id`, assigning it a node id.
    pub fn insert_id(&self, id: &str, inode: Inode) -> NodeId {
        self.nodes.write().insert(
            id.to_string(),
            Arc::new(Node {
                inode: RwLock::new(inode),
            }),
        );
        self.ids.node_id_for(id)
    }

    /// Warm lookup by id; falls back to the durable store on a cold cache
    /// (never calls remote — that's the caller's job on a true miss).
    pub fn get_id(&self, id: &str) -> Result<Option<Inode>> {
        if let Some(node) = self.nodes.read().get(id) {
            return Ok(Some(node.inode.read().clone()));
        }
        match self.store.get(id)? {
            Some(entry) => {
                let inode = Inode::from_entry(&entry);
                self.insert_id(id, inode.clone());
                Ok(Some(inode))
            }
            None => Ok(None),
        }
    }

    pub fn get_node_id(&self, node_id: NodeId) -> Result<Option<Inode>> {
        match self.ids.get_id(node_id) {
            Some(id) => self.get_id(&id),
            None => Ok(None),
        }
    }

    /// Add `child_id` to `parent_id`'s children list, both in memory and
    /// durably. Requires the parent directory's write lock per §5.
    pub fn insert_child(&self, parent_id: &str, child_id: &str) -> Result<()> {
        if let Some(node) = self.nodes.read().get(parent_id) {
            let mut parent = node.inode.write();
            if !parent.children.iter().any(|c| c == child_id) {
                parent.children.push(child_id.to_string());
            }
        }
        self.store.update(parent_id, |e| {
            if !e.children.iter().any(|c| c == child_id) {
                e.children.push(child_id.to_string());
            }
        })?;
        Ok(())
    }

    /// Remove `id` from its parent's children list and from both id
    /// tables.
    pub fn delete_id(&self, id: &str) -> Result<()> {
        let parent_id = self
            .get_id(id)?
            .and_then(|inode| inode.parent_id.clone());

        if let Some(parent_id) = &parent_id {
            if let Some(node) = self.nodes.read().get(parent_id) {
                node.inode.write().children.retain(|c| c != id);
            }
            self.store.update(parent_id, |e| {
                e.children.retain(|c| c != id);
            })?;
        }
        self.nodes.write().remove(id);
        self.ids.remove(id);
        self.store.delete(id)?;
        Ok(())
    }

    /// Children of `parent_id` as a lower-case-name -> inode map.
    ///
    /// Serveable from the metadata store alone when the in-memory child
    /// list is cold, without any remote call (§4.2's local-first
    /// invariant).
    pub fn get_children_id(&self, parent_id: &str) -> Result<HashMap<String, Inode>> {
        let warm_children: Option<Vec<String>> = self
            .nodes
            .read()
            .get(parent_id)
            .map(|n| n.inode.read().children.iter().cloned().collect());

        let child_ids = match warm_children {
            Some(ids) => ids,
            None => match self.store.get(parent_id)? {
                Some(entry) => entry.children,
                // Neither the warm cache nor the durable store has this
                // parent: resolving it would require a remote lookup. If
                // we're offline that lookup can't happen, which is a
                // distinct failure from a confirmed-absent, warm parent.
                None if !self.online.load(Ordering::SeqCst) => {
                    return Err(Error::OfflineAndCold);
                }
                None => return Err(Error::NotFound),
            },
        };

        let mut out = HashMap::with_capacity(child_ids.len());
        for id in child_ids {
            if let Some(inode) = self.get_id(&id)? {
                out.insert(canonical_name(&inode.name), inode);
            }
        }
        Ok(out)
    }

    /// Look up a single named child of `parent_id`. A negative lookup
    /// against a warm parent never calls remote (§4.2, §8).
    pub fn get_child(&self, parent_id: &str, name: &str) -> Result<Option<Inode>> {
        let children = self.get_children_id(parent_id)?;
        Ok(children.get(&canonical_name(name)).cloned())
    }

    /// Promote a locally-minted id to the server-assigned id returned by a
    /// completed upload (§4.6: "if the server's returned id differs from
    /// the client's, a `move_id` is performed atomically"). Rewrites the
    /// durable entry under the new id, fixes up the parent's children list,
    /// and updates the id<->node-id bijection, all before touching the
    /// warm cache.
    pub fn promote_local_id(&self, old_id: &str, new_id: &str) -> Result<()> {
        if old_id == new_id {
            return Ok(());
        }
        let mut entry = self.store.get(old_id)?.ok_or(Error::NotFound)?;
        let parent_id = entry.parent_id.clone();
        entry.id = new_id.to_string();
        self.store.save(&entry)?;
        self.store.delete(old_id)?;

        if let Some(parent_id) = &parent_id {
            self.store.update(parent_id, |e| {
                for child in e.children.iter_mut() {
                    if child == old_id {
                        *child = new_id.to_string();
                    }
                }
            })?;
            if let Some(node) = self.nodes.read().get(parent_id) {
                let mut p = node.inode.write();
                for child in p.children.iter_mut() {
                    if child == old_id {
                        *child = new_id.to_string();
                    }
                }
            }
        }

        self.ids.move_id(old_id, new_id)?;

        let mut nodes = self.nodes.write();
        if let Some(node) = nodes.remove(old_id) {
            node.inode.write().id = new_id.to_string();
            nodes.insert(new_id.to_string(), node);
        }
        Ok(())
    }

    /// Set a warm xattr on `id`. Xattrs are an in-memory-only extension
    /// (never persisted to the metadata store), per the limited xattr
    /// support named in scope.
    pub fn set_xattr(&self, id: &str, name: &str, value: Vec<u8>) -> Result<()> {
        let nodes = self.nodes.read();
        let node = nodes.get(id).ok_or(Error::NotFound)?;
        node.inode.write().xattrs.insert(name.to_string(), value);
        Ok(())
    }

    pub fn remove_xattr(&self, id: &str, name: &str) -> Result<()> {
        let nodes = self.nodes.read();
        let node = nodes.get(id).ok_or(Error::NotFound)?;
        node.inode.write().xattrs.remove(name);
        Ok(())
    }

    pub fn move_path(
        &self,
        old_parent: &str,
        new_parent: &str,
        old_name: &str,
        new_name: &str,
    ) -> Result<()> {
        let child = self
            .get_child(old_parent, old_name)?
            .ok_or(Error::NotFound)?;
        let child_id = child.id.clone();

        if old_parent != new_parent {
            self.store.update(old_parent, |e| {
                e.children.retain(|c| c != &child_id);
            })?;
            self.store.update(new_parent, |e| {
                if !e.children.iter().any(|c| c == &child_id) {
                    e.children.push(child_id.clone());
                }
            })?;
            if let Some(node) = self.nodes.read().get(old_parent) {
                node.inode.write().children.retain(|c| c != &child_id);
            }
            if let Some(node) = self.nodes.read().get(new_parent) {
                let mut np = node.inode.write();
                if !np.children.iter().any(|c| c == &child_id) {
                    np.children.push(child_id.clone());
                }
            }
        }

        self.store.update(&child_id, |e| {
            e.parent_id = Some(new_parent.to_string());
            e.name = new_name.to_string();
        })?;
        if let Some(node) = self.nodes.read().get(&child_id) {
            let mut c = node.inode.write();
            c.parent_id = Some(new_parent.to_string());
            c.name = new_name.to_string();
        }
        Ok(())
    }

    /// Resolve a `/`-separated path from root. Empty/`"/"` resolves to
    /// root.
    pub fn get_path(&self, path: &str) -> Result<Option<Inode>> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return self.get_id(&self.root_id);
        }
        let mut current = self.root_id.clone();
        let mut result = None;
        for component in trimmed.split('/') {
            match self.get_child(&current, component)? {
                Some(inode) => {
                    current = inode.id.clone();
                    result = Some(inode);
                }
                None => return Ok(None),
            }
        }
        Ok(result)
    }
}
