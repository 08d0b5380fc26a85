//! Persistent metadata store (§4.3, C3).
//!
//! Backed by `redb`, an embedded key-value store with atomic transactions —
//! the same role `bbolt`-style embedded stores play in comparable
//! production clients (grounded in the corpus's `s5-rs`/`syncr` use of
//! `redb`). Logical buckets map onto `redb` tables: `metadata_v2`
//! (entries), `delta` (continuation token), `offline_changes`, `uploads`.

pub mod entry;
pub mod state;

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableTable, TableDefinition};

pub use entry::{ItemKind, MetadataEntry, OverlayPolicy, PinMode};
pub use state::LifecycleState;

use crate::error::{Error, Result};

const METADATA_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("metadata_v2");
const DELTA_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("delta");
const OFFLINE_CHANGES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("offline_changes");
const UPLOADS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("uploads");
const AUDIT_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("audit");

const DELTA_TOKEN_KEY: &str = "token";

/// A change recorded while offline (§3.2).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum OfflineChangeKind {
    Create,
    Modify,
    Delete,
    Rename,
    Move,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct OfflineChangeRecord {
    pub id: String,
    pub kind: OfflineChangeKind,
    pub timestamp: i64,
}

impl OfflineChangeRecord {
    /// Key used in the `offline_changes` bucket: `id + '-' + timestamp`, so
    /// multiple changes per id are preserved in order (§3.2).
    pub fn key(&self) -> String {
        format!("{}-{}", self.id, self.timestamp)
    }
}

/// One lifecycle transition, appended to the `audit` bucket on every
/// successful [`MetadataStore::transition`]. Ambient observability, not a
/// feature surface a caller queries in the normal operation path.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub timestamp: i64,
}

impl AuditRecord {
    fn key(&self) -> String {
        format!("{}-{}", self.id, self.timestamp)
    }
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// The persistent metadata store (C3).
pub struct MetadataStore {
    db: Database,
}

impl MetadataStore {
    /// Open (creating if absent) the store at `path`, with a bounded
    /// lock-acquisition timeout so a stuck prior process doesn't hang the
    /// mount forever.
    pub fn open(path: &Path) -> Result<Self> {
        let db = open_with_timeout(path, Duration::from_secs(5))?;
        let write = db.begin_write().map_err(db_err)?;
        {
            write.open_table(METADATA_TABLE).map_err(db_err)?;
            write.open_table(DELTA_TABLE).map_err(db_err)?;
            write.open_table(OFFLINE_CHANGES_TABLE).map_err(db_err)?;
            write.open_table(UPLOADS_TABLE).map_err(db_err)?;
            write.open_table(AUDIT_TABLE).map_err(db_err)?;
        }
        write.commit().map_err(db_err)?;
        Ok(Self { db })
    }

    /// Ensure a root entry exists, inserting a fresh one if this is a new
    /// store. Mounting must succeed even without remote connectivity as
    /// long as the root entry is present (§4.3).
    pub fn ensure_root(&self, root_id: &str) -> Result<MetadataEntry> {
        if let Some(existing) = self.get(root_id)? {
            return Ok(existing);
        }
        let root = MetadataEntry::new_root(root_id, now_millis());
        self.save(&root)?;
        Ok(root)
    }

    pub fn get(&self, id: &str) -> Result<Option<MetadataEntry>> {
        let read = self.db.begin_read().map_err(db_err)?;
        let table = read.open_table(METADATA_TABLE).map_err(db_err)?;
        match table.get(id).map_err(db_err)? {
            Some(bytes) => {
                let entry: MetadataEntry =
                    bincode::deserialize(bytes.value()).map_err(deser_err)?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    pub fn save(&self, entry: &MetadataEntry) -> Result<()> {
        let bytes = bincode::serialize(entry).map_err(ser_err)?;
        let write = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = write.open_table(METADATA_TABLE).map_err(db_err)?;
            table.insert(entry.id.as_str(), bytes.as_slice()).map_err(db_err)?;
        }
        write.commit().map_err(db_err)?;
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let write = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = write.open_table(METADATA_TABLE).map_err(db_err)?;
            table.remove(id).map_err(db_err)?;
        }
        write.commit().map_err(db_err)?;
        Ok(())
    }

    /// Read-modify-write `id` in a single transaction.
    pub fn update<F>(&self, id: &str, f: F) -> Result<MetadataEntry>
    where
        F: FnOnce(&mut MetadataEntry),
    {
        let write = self.db.begin_write().map_err(db_err)?;
        let updated = {
            let mut table = write.open_table(METADATA_TABLE).map_err(db_err)?;
            let mut entry = match table.get(id).map_err(db_err)? {
                Some(bytes) => bincode::deserialize(bytes.value()).map_err(deser_err)?,
                None => return Err(Error::NotFound),
            };
            f(&mut entry);
            entry.updated_at = now_millis();
            let bytes = bincode::serialize(&entry).map_err(ser_err)?;
            table.insert(id, bytes.as_slice()).map_err(db_err)?;
            entry
        };
        write.commit().map_err(db_err)?;
        Ok(updated)
    }

    /// Validate and apply a lifecycle transition (§3.3), rejecting illegal
    /// ones with `IllegalStateTransition`. Appends an [`AuditRecord`] to the
    /// `audit` bucket in the same transaction.
    pub fn transition(&self, id: &str, to: LifecycleState) -> Result<MetadataEntry> {
        let write = self.db.begin_write().map_err(db_err)?;
        let (updated, from) = {
            let mut table = write.open_table(METADATA_TABLE).map_err(db_err)?;
            let mut entry: MetadataEntry = match table.get(id).map_err(db_err)? {
                Some(bytes) => bincode::deserialize(bytes.value()).map_err(deser_err)?,
                None => return Err(Error::NotFound),
            };
            let from = entry.state;
            state::validate_transition(from, to)?;
            entry.state = to;
            entry.updated_at = now_millis();
            let bytes = bincode::serialize(&entry).map_err(ser_err)?;
            table.insert(id, bytes.as_slice()).map_err(db_err)?;
            (entry, from)
        };
        {
            let record = AuditRecord {
                id: id.to_string(),
                from,
                to,
                timestamp: now_millis(),
            };
            let bytes = bincode::serialize(&record).map_err(ser_err)?;
            let mut audit = write.open_table(AUDIT_TABLE).map_err(db_err)?;
            audit.insert(record.key().as_str(), bytes.as_slice()).map_err(db_err)?;
        }
        write.commit().map_err(db_err)?;
        Ok(updated)
    }

    /// The audit trail for `id`, oldest first: every lifecycle transition
    /// it has undergone since the store was created.
    pub fn get_audit_trail(&self, id: &str) -> Result<Vec<AuditRecord>> {
        let prefix = format!("{id}-");
        let read = self.db.begin_read().map_err(db_err)?;
        let table = read.open_table(AUDIT_TABLE).map_err(db_err)?;
        let mut out = Vec::new();
        for item in table.iter().map_err(db_err)? {
            let (k, v) = item.map_err(db_err)?;
            if k.value().starts_with(&prefix) {
                out.push(bincode::deserialize(v.value()).map_err(deser_err)?);
            }
        }
        out.sort_by_key(|r: &AuditRecord| r.timestamp);
        Ok(out)
    }

    pub fn get_delta_token(&self) -> Result<Option<String>> {
        let read = self.db.begin_read().map_err(db_err)?;
        let table = read.open_table(DELTA_TABLE).map_err(db_err)?;
        match table.get(DELTA_TOKEN_KEY).map_err(db_err)? {
            Some(bytes) => Ok(Some(String::from_utf8_lossy(bytes.value()).into_owned())),
            None => Ok(None),
        }
    }

    pub fn save_delta_token(&self, token: &str) -> Result<()> {
        let write = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = write.open_table(DELTA_TABLE).map_err(db_err)?;
            table.insert(DELTA_TOKEN_KEY, token.as_bytes()).map_err(db_err)?;
        }
        write.commit().map_err(db_err)?;
        Ok(())
    }

    pub fn record_offline_change(&self, record: &OfflineChangeRecord) -> Result<()> {
        let bytes = bincode::serialize(record).map_err(ser_err)?;
        let write = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = write.open_table(OFFLINE_CHANGES_TABLE).map_err(db_err)?;
            table.insert(record.key().as_str(), bytes.as_slice()).map_err(db_err)?;
        }
        write.commit().map_err(db_err)?;
        Ok(())
    }

    pub fn offline_changes_for(&self, id: &str) -> Result<Vec<OfflineChangeRecord>> {
        let prefix = format!("{id}-");
        let read = self.db.begin_read().map_err(db_err)?;
        let table = read.open_table(OFFLINE_CHANGES_TABLE).map_err(db_err)?;
        let mut out = Vec::new();
        for item in table.iter().map_err(db_err)? {
            let (k, v) = item.map_err(db_err)?;
            if k.value().starts_with(&prefix) {
                out.push(bincode::deserialize(v.value()).map_err(deser_err)?);
            }
        }
        out.sort_by_key(|r: &OfflineChangeRecord| r.timestamp);
        Ok(out)
    }

    pub fn has_offline_changes(&self, id: &str) -> Result<bool> {
        Ok(!self.offline_changes_for(id)?.is_empty())
    }

    pub fn all_offline_changes(&self) -> Result<Vec<OfflineChangeRecord>> {
        let read = self.db.begin_read().map_err(db_err)?;
        let table = read.open_table(OFFLINE_CHANGES_TABLE).map_err(db_err)?;
        let mut out = Vec::new();
        for item in table.iter().map_err(db_err)? {
            let (_, v) = item.map_err(db_err)?;
            out.push(bincode::deserialize(v.value()).map_err(deser_err)?);
        }
        out.sort_by_key(|r: &OfflineChangeRecord| r.timestamp);
        Ok(out)
    }

    pub fn clear_offline_changes_for(&self, id: &str) -> Result<()> {
        let prefix = format!("{id}-");
        let write = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = write.open_table(OFFLINE_CHANGES_TABLE).map_err(db_err)?;
            let keys: Vec<String> = table
                .iter()
                .map_err(db_err)?
                .filter_map(|item| item.ok())
                .map(|(k, _)| k.value().to_string())
                .filter(|k| k.starts_with(&prefix))
                .collect();
            for k in keys {
                table.remove(k.as_str()).map_err(db_err)?;
            }
        }
        write.commit().map_err(db_err)?;
        Ok(())
    }

    pub fn save_upload_bytes(&self, id: &str, bytes: &[u8]) -> Result<()> {
        let write = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = write.open_table(UPLOADS_TABLE).map_err(db_err)?;
            table.insert(id, bytes).map_err(db_err)?;
        }
        write.commit().map_err(db_err)?;
        Ok(())
    }

    pub fn get_upload_bytes(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let read = self.db.begin_read().map_err(db_err)?;
        let table = read.open_table(UPLOADS_TABLE).map_err(db_err)?;
        Ok(table.get(id).map_err(db_err)?.map(|v| v.value().to_vec()))
    }

    pub fn remove_upload(&self, id: &str) -> Result<()> {
        let write = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = write.open_table(UPLOADS_TABLE).map_err(db_err)?;
            table.remove(id).map_err(db_err)?;
        }
        write.commit().map_err(db_err)?;
        Ok(())
    }

    pub fn all_upload_ids(&self) -> Result<Vec<String>> {
        let read = self.db.begin_read().map_err(db_err)?;
        let table = read.open_table(UPLOADS_TABLE).map_err(db_err)?;
        let mut out = Vec::new();
        for item in table.iter().map_err(db_err)? {
            let (k, _) = item.map_err(db_err)?;
            out.push(k.value().to_string());
        }
        Ok(out)
    }

    /// Count entries in the `metadata_v2` bucket without deserializing them
    /// (§4.13's cheap path for deciding whether to sample).
    pub fn count_entries(&self) -> Result<u64> {
        let read = self.db.begin_read().map_err(db_err)?;
        let table = read.open_table(METADATA_TABLE).map_err(db_err)?;
        Ok(table.len().map_err(db_err)?)
    }

    /// Every entry in the `metadata_v2` bucket. For large stores, prefer
    /// [`MetadataStore::sampled_entries`] (§4.13's sampling threshold).
    pub fn all_entries(&self) -> Result<Vec<MetadataEntry>> {
        let read = self.db.begin_read().map_err(db_err)?;
        let table = read.open_table(METADATA_TABLE).map_err(db_err)?;
        let mut out = Vec::new();
        for item in table.iter().map_err(db_err)? {
            let (_, v) = item.map_err(db_err)?;
            out.push(bincode::deserialize(v.value()).map_err(deser_err)?);
        }
        Ok(out)
    }

    /// Every `stride`-th entry, in key order, for sampled statistics. A
    /// `stride` of 1 is equivalent to [`MetadataStore::all_entries`].
    pub fn sampled_entries(&self, stride: u64) -> Result<Vec<MetadataEntry>> {
        let stride = stride.max(1);
        let read = self.db.begin_read().map_err(db_err)?;
        let table = read.open_table(METADATA_TABLE).map_err(db_err)?;
        let mut out = Vec::new();
        for (i, item) in table.iter().map_err(db_err)?.enumerate() {
            if i as u64 % stride != 0 {
                continue;
            }
            let (_, v) = item.map_err(db_err)?;
            out.push(bincode::deserialize(v.value()).map_err(deser_err)?);
        }
        Ok(out)
    }

    /// Rebuild a directory's children from the durable store alone, without
    /// any remote call (§4.2's local-first invariant).
    pub fn children_of(&self, parent_id: &str) -> Result<Vec<MetadataEntry>> {
        let parent = self.get(parent_id)?.ok_or(Error::NotFound)?;
        let mut out = Vec::with_capacity(parent.children.len());
        for child_id in &parent.children {
            if let Some(child) = self.get(child_id)? {
                out.push(child);
            }
        }
        Ok(out)
    }
}

fn open_with_timeout(path: &Path, timeout: Duration) -> Result<Database> {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        match Database::create(path) {
            Ok(db) => return Ok(db),
            Err(redb::DatabaseError::DatabaseAlreadyOpen) if std::time::Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => return Err(Error::Internal(format!("failed to open metadata store: {e}"))),
        }
    }
}

fn db_err<E: std::fmt::Display>(e: E) -> Error {
    Error::Internal(format!("metadata store error: {e}"))
}

fn ser_err(e: bincode::Error) -> Error {
    Error::Internal(format!("serialization error: {e}"))
}

fn deser_err(e: bincode::Error) -> Error {
    Error::Internal(format!("deserialization error: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use entry::ItemKind;

    fn temp_store() -> (tempfile::TempDir, MetadataStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(&dir.path().join("meta.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn ensure_root_is_idempotent() {
        let (_dir, store) = temp_store();
        let r1 = store.ensure_root("root").unwrap();
        let r2 = store.ensure_root("root").unwrap();
        assert_eq!(r1.id, r2.id);
    }

    #[test]
    fn save_and_get_round_trip() {
        let (_dir, store) = temp_store();
        let mut e = MetadataEntry::new_root("root", now_millis());
        e.name = "root".into();
        e.kind = ItemKind::Directory;
        store.save(&e).unwrap();
        let got = store.get("root").unwrap().unwrap();
        assert_eq!(got.id, e.id);
        assert_eq!(got.kind, e.kind);
    }

    #[test]
    fn illegal_transition_rejected() {
        let (_dir, store) = temp_store();
        store.ensure_root("root").unwrap();
        let mut child = MetadataEntry::new_root("child", now_millis());
        child.state = LifecycleState::Ghost;
        store.save(&child).unwrap();
        assert!(store.transition("child", LifecycleState::Hydrated).is_err());
        assert!(store.transition("child", LifecycleState::Hydrating).is_ok());
    }

    #[test]
    fn offline_changes_ordered_by_timestamp() {
        let (_dir, store) = temp_store();
        store
            .record_offline_change(&OfflineChangeRecord {
                id: "a".into(),
                kind: OfflineChangeKind::Create,
                timestamp: 2,
            })
            .unwrap();
        store
            .record_offline_change(&OfflineChangeRecord {
                id: "a".into(),
                kind: OfflineChangeKind::Modify,
                timestamp: 1,
            })
            .unwrap();
        let changes = store.offline_changes_for("a").unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].timestamp, 1);
        assert_eq!(changes[1].timestamp, 2);
    }

    #[test]
    fn transition_appends_audit_record() {
        let (_dir, store) = temp_store();
        store.ensure_root("root").unwrap();
        let mut child = MetadataEntry::new_root("child", now_millis());
        child.state = LifecycleState::Ghost;
        store.save(&child).unwrap();

        store.transition("child", LifecycleState::Hydrating).unwrap();
        store.transition("child", LifecycleState::Hydrated).unwrap();

        let trail = store.get_audit_trail("child").unwrap();
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[0].from, LifecycleState::Ghost);
        assert_eq!(trail[0].to, LifecycleState::Hydrating);
        assert_eq!(trail[1].from, LifecycleState::Hydrating);
        assert_eq!(trail[1].to, LifecycleState::Hydrated);
    }

    #[test]
    fn children_of_rebuilds_from_durable_store() {
        let (_dir, store) = temp_store();
        let mut root = MetadataEntry::new_root("root", now_millis());
        root.children = vec!["child".into()];
        store.save(&root).unwrap();
        let mut child = MetadataEntry::new_root("child", now_millis());
        child.name = "child.txt".into();
        child.kind = ItemKind::File;
        child.parent_id = Some("root".into());
        store.save(&child).unwrap();

        let children = store.children_of("root").unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name, "child.txt");
    }
}
