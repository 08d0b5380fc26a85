//! Content cache (§4.4, C4): a size-bounded on-disk store keyed by id, with
//! LRU eviction and integrity verification.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::hash::ContentHash;

struct Slot {
    size: u64,
    last_access: Instant,
    pinned: bool,
    open_handles: u32,
}

/// RAII guard tracking an open handle on a content slot; dropping it
/// decrements the slot's open-handle count, re-enabling eviction.
pub struct OpenHandle {
    cache: Arc<ContentCacheInner>,
    id: String,
}

impl Drop for OpenHandle {
    fn drop(&mut self) {
        let mut slots = self.cache.slots.write();
        if let Some(slot) = slots.get_mut(&self.id) {
            slot.open_handles = slot.open_handles.saturating_sub(1);
        }
    }
}

struct ContentCacheInner {
    dir: PathBuf,
    max_size: u64,
    total_size: AtomicU64,
    slots: RwLock<HashMap<String, Slot>>,
}

/// The on-disk content cache (C4).
#[derive(Clone)]
pub struct ContentCache(Arc<ContentCacheInner>);

impl ContentCache {
    pub fn open(dir: PathBuf, max_size: u64) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        let mut slots = HashMap::new();
        let mut total = 0u64;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                let len = entry.metadata()?.len();
                let id = entry.file_name().to_string_lossy().into_owned();
                total += len;
                slots.insert(
                    id,
                    Slot {
                        size: len,
                        last_access: Instant::now(),
                        pinned: false,
                        open_handles: 0,
                    },
                );
            }
        }
        Ok(Self(Arc::new(ContentCacheInner {
            dir,
            max_size,
            total_size: AtomicU64::new(total),
            slots: RwLock::new(slots),
        })))
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.0.dir.join(id)
    }

    pub fn has_content(&self, id: &str) -> bool {
        self.0.slots.read().contains_key(id)
    }

    pub fn get_cache_size(&self) -> u64 {
        self.0.total_size.load(Ordering::SeqCst)
    }

    pub fn get_max_cache_size(&self) -> u64 {
        self.0.max_size
    }

    pub fn set_pinned(&self, id: &str, pinned: bool) {
        if let Some(slot) = self.0.slots.write().get_mut(id) {
            slot.pinned = pinned;
        }
    }

    /// Open a seekable read/write handle on `id`'s content, marking it as
    /// having an open handle (preventing its eviction) until the returned
    /// guard is dropped.
    pub fn open_handle(&self, id: &str) -> Result<(File, OpenHandle)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.path_for(id))?;
        {
            let mut slots = self.0.slots.write();
            let slot = slots.get_mut(id).ok_or(Error::NotFound)?;
            slot.open_handles += 1;
            slot.last_access = Instant::now();
        }
        Ok((
            file,
            OpenHandle {
                cache: self.0.clone(),
                id: id.to_string(),
            },
        ))
    }

    /// Insert `bytes` under `id`, evicting least-recently-used, unpinned,
    /// not-open HYDRATED slots as needed to respect `max_size` (§4.4).
    pub fn insert(&self, id: &str, bytes: &[u8]) -> Result<()> {
        let new_len = bytes.len() as u64;
        let existing_len = self.0.slots.read().get(id).map(|s| s.size).unwrap_or(0);

        if self.0.max_size > 0 {
            self.make_room(new_len.saturating_sub(existing_len), Some(id))?;
        }

        fs::write(self.path_for(id), bytes)?;

        let mut slots = self.0.slots.write();
        let delta = new_len as i64 - existing_len as i64;
        let entry = slots.entry(id.to_string()).or_insert_with(|| Slot {
            size: 0,
            last_access: Instant::now(),
            pinned: false,
            open_handles: 0,
        });
        entry.size = new_len;
        entry.last_access = Instant::now();
        drop(slots);
        if delta >= 0 {
            self.0.total_size.fetch_add(delta as u64, Ordering::SeqCst);
        } else {
            self.0
                .total_size
                .fetch_sub((-delta) as u64, Ordering::SeqCst);
        }
        Ok(())
    }

    fn make_room(&self, needed: u64, inserting_id: Option<&str>) -> Result<()> {
        if needed == 0 {
            return Ok(());
        }
        loop {
            let current = self.0.total_size.load(Ordering::SeqCst);
            if current + needed <= self.0.max_size {
                return Ok(());
            }
            let victim = {
                let slots = self.0.slots.read();
                slots
                    .iter()
                    .filter(|(id, slot)| {
                        Some(id.as_str()) != inserting_id && !slot.pinned && slot.open_handles == 0
                    })
                    .min_by_key(|(_, slot)| slot.last_access)
                    .map(|(id, _)| id.clone())
            };
            match victim {
                Some(id) => self.delete(&id)?,
                None => return Err(Error::CacheFull),
            }
        }
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let removed = self.0.slots.write().remove(id);
        if let Some(slot) = removed {
            self.0.total_size.fetch_sub(slot.size, Ordering::SeqCst);
            let path = self.path_for(id);
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    /// Delete slots untouched for longer than `max_age`, skipping pinned or
    /// currently-open ones. Backs the periodic cache-cleanup background task
    /// (§4.10); independent of the size-bounded LRU eviction in `insert`.
    pub fn evict_expired(&self, max_age: std::time::Duration) -> Result<usize> {
        let now = Instant::now();
        let stale: Vec<String> = self
            .0
            .slots
            .read()
            .iter()
            .filter(|(_, slot)| {
                !slot.pinned && slot.open_handles == 0 && now.duration_since(slot.last_access) >= max_age
            })
            .map(|(id, _)| id.clone())
            .collect();
        let count = stale.len();
        for id in stale {
            self.delete(&id)?;
        }
        Ok(count)
    }

    pub fn note_access(&self, id: &str) {
        if let Some(slot) = self.0.slots.write().get_mut(id) {
            slot.last_access = Instant::now();
        }
    }

    /// Stream the cached blob through the hash function and compare
    /// against `expected` (§4.4 integrity check). A mismatch is the
    /// caller's cue to force GHOST and report `CacheCorruption`.
    pub fn verify(&self, id: &str, expected: ContentHash) -> Result<bool> {
        let file = File::open(self.path_for(id))?;
        let actual = ContentHash::of_reader(file)?;
        Ok(actual == expected)
    }

    pub fn read_all(&self, id: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.path_for(id))?)
    }
}

fn _assert_path_visible(_: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max: u64) -> (tempfile::TempDir, ContentCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::open(dir.path().join("content"), max).unwrap();
        (dir, cache)
    }

    #[test]
    fn insert_and_read_back() {
        let (_d, cache) = cache(0);
        cache.insert("a", b"hello").unwrap();
        assert_eq!(cache.read_all("a").unwrap(), b"hello");
        assert_eq!(cache.get_cache_size(), 5);
    }

    #[test]
    fn exactly_max_size_accepts_zero_byte_insert() {
        let (_d, cache) = cache(5);
        cache.insert("a", b"hello").unwrap();
        cache.insert("b", b"").unwrap();
        assert_eq!(cache.get_cache_size(), 5);
    }

    #[test]
    fn exceeding_max_without_eviction_room_fails() {
        let (_d, cache) = cache(5);
        cache.insert("a", b"hello").unwrap();
        cache.set_pinned("a", true);
        assert!(matches!(cache.insert("b", b"x"), Err(Error::CacheFull)));
    }

    #[test]
    fn lru_eviction_makes_room() {
        let (_d, cache) = cache(5);
        cache.insert("a", b"aaaaa").unwrap();
        cache.note_access("a");
        cache.insert("b", b"bbbbb").unwrap();
        // "a" is older, unpinned, not open: it should have been evicted.
        assert!(!cache.has_content("a"));
        assert!(cache.has_content("b"));
        assert!(cache.get_cache_size() <= 5);
    }

    #[test]
    fn open_handle_prevents_eviction() {
        let (_d, cache) = cache(5);
        cache.insert("a", b"aaaaa").unwrap();
        let (_file, guard) = cache.open_handle("a").unwrap();
        assert!(matches!(cache.insert("b", b"bbbbb"), Err(Error::CacheFull)));
        drop(guard);
        cache.insert("b", b"bbbbb").unwrap();
        assert!(cache.has_content("b"));
    }

    #[test]
    fn evict_expired_skips_pinned_and_open_handles() {
        let (_d, cache) = cache(0);
        cache.insert("a", b"aaaaa").unwrap();
        cache.insert("b", b"bbbbb").unwrap();
        cache.insert("c", b"ccccc").unwrap();
        cache.set_pinned("a", true);
        let (_file, guard) = cache.open_handle("b").unwrap();

        let removed = cache.evict_expired(std::time::Duration::from_secs(0)).unwrap();
        assert_eq!(removed, 1);
        assert!(cache.has_content("a"));
        assert!(cache.has_content("b"));
        assert!(!cache.has_content("c"));
        drop(guard);
    }

    #[test]
    fn verify_detects_corruption() {
        let (_d, cache) = cache(0);
        cache.insert("a", b"hello").unwrap();
        let good = ContentHash::of_bytes(b"hello");
        let bad = ContentHash::of_bytes(b"other");
        assert!(cache.verify("a", good).unwrap());
        assert!(!cache.verify("a", bad).unwrap());
    }
}
