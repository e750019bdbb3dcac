//! Content object cache.
//!
//! Objects are keyed by the hash of their bytes, so a descriptor announced by
//! any peer finds the same entry. The cache holds two kinds of entries:
//! objects received from peers, which are evicted least-recently-used once
//! the byte capacity is exceeded, and the user's own published objects,
//! which are pinned and served to peers that request them.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use msnp_core::{ContentDescriptor, ObjectHash};
use tracing::{debug, trace};

use crate::error::{EngineError, EngineResult};
use crate::sync::{read, write};

/// Cache entry containing the bytes and their descriptor.
#[derive(Debug)]
pub struct CacheEntry {
    /// Descriptor the bytes were stored under.
    pub descriptor: ContentDescriptor,
    /// Object content.
    pub data: Bytes,
    /// Published by the user; never evicted.
    pub pinned: bool,
    /// When the entry was stored.
    pub stored_at: DateTime<Utc>,
    /// Recency tick, bumped on every read.
    last_used: AtomicU64,
}

#[derive(Debug, Default)]
struct CacheTable {
    entries: HashMap<ObjectHash, CacheEntry>,
    /// Bytes held by unpinned entries.
    evictable_bytes: usize,
    total_bytes: usize,
}

/// Hash-addressed object cache.
#[derive(Debug)]
pub struct ObjectCache {
    capacity: usize,
    clock: AtomicU64,
    table: RwLock<CacheTable>,
}

impl ObjectCache {
    /// Creates a cache that keeps at most `capacity` bytes of unpinned objects.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            clock: AtomicU64::new(0),
            table: RwLock::new(CacheTable::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Returns the bytes stored under `hash`.
    pub fn get(&self, hash: &ObjectHash) -> Option<Bytes> {
        let table = read(&self.table);
        let entry = table.entries.get(hash)?;
        entry.last_used.store(self.tick(), Ordering::Relaxed);
        trace!(%hash, size = entry.data.len(), "Cache hit");
        Some(entry.data.clone())
    }

    pub fn contains(&self, hash: &ObjectHash) -> bool {
        read(&self.table).entries.contains_key(hash)
    }

    /// Returns the descriptor stored with `hash`.
    pub fn descriptor(&self, hash: &ObjectHash) -> Option<ContentDescriptor> {
        read(&self.table)
            .entries
            .get(hash)
            .map(|entry| entry.descriptor.clone())
    }

    /// Returns true if the object was published by the user.
    pub fn is_published(&self, hash: &ObjectHash) -> bool {
        read(&self.table)
            .entries
            .get(hash)
            .is_some_and(|entry| entry.pinned)
    }

    /// Stores bytes received from a peer.
    ///
    /// Fails with [`EngineError::HashMismatch`] if the bytes are not what the
    /// descriptor names.
    pub fn put(&self, descriptor: ContentDescriptor, data: Bytes) -> EngineResult<()> {
        self.insert(descriptor, data, false)
    }

    /// Stores one of the user's own objects. Published objects are pinned.
    pub fn publish(&self, descriptor: ContentDescriptor, data: Bytes) -> EngineResult<()> {
        self.insert(descriptor, data, true)
    }

    fn insert(&self, descriptor: ContentDescriptor, data: Bytes, pinned: bool) -> EngineResult<()> {
        if !descriptor.matches(&data) {
            debug!(hash = %descriptor.hash, size = data.len(), "Rejecting object with wrong hash");
            return Err(EngineError::HashMismatch);
        }
        if !pinned && data.len() > self.capacity {
            debug!(hash = %descriptor.hash, size = data.len(), "Object larger than cache, not stored");
            return Ok(());
        }

        let hash = descriptor.hash;
        let mut table = write(&self.table);
        if let Some(old) = table.entries.remove(&hash) {
            table.total_bytes -= old.data.len();
            if !old.pinned {
                table.evictable_bytes -= old.data.len();
            }
        }

        let size = data.len();
        table.total_bytes += size;
        if !pinned {
            table.evictable_bytes += size;
        }
        table.entries.insert(
            hash,
            CacheEntry {
                descriptor,
                data,
                pinned,
                stored_at: Utc::now(),
                last_used: AtomicU64::new(self.tick()),
            },
        );
        debug!(%hash, size, pinned, "Stored cache entry");

        self.evict(&mut table);
        Ok(())
    }

    fn evict(&self, table: &mut CacheTable) {
        while table.evictable_bytes > self.capacity {
            let victim = table
                .entries
                .iter()
                .filter(|(_, entry)| !entry.pinned)
                .min_by_key(|(_, entry)| entry.last_used.load(Ordering::Relaxed))
                .map(|(hash, _)| *hash);
            let Some(hash) = victim else { break };
            if let Some(entry) = table.entries.remove(&hash) {
                table.total_bytes -= entry.data.len();
                table.evictable_bytes -= entry.data.len();
                trace!(%hash, size = entry.data.len(), "Evicting least recently used object");
            }
        }
    }

    /// Removes an entry, pinned or not.
    pub fn remove(&self, hash: &ObjectHash) -> Option<Bytes> {
        let mut table = write(&self.table);
        let entry = table.entries.remove(hash)?;
        table.total_bytes -= entry.data.len();
        if !entry.pinned {
            table.evictable_bytes -= entry.data.len();
        }
        debug!(%hash, "Removed cache entry");
        Some(entry.data)
    }

    /// Descriptors of every published object.
    pub fn published(&self) -> Vec<ContentDescriptor> {
        read(&self.table)
            .entries
            .values()
            .filter(|entry| entry.pinned)
            .map(|entry| entry.descriptor.clone())
            .collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        read(&self.table).entries.len()
    }

    /// Returns true if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes held by all entries, pinned included.
    pub fn total_bytes(&self) -> usize {
        read(&self.table).total_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use msnp_core::ObjectKind;

    fn object(data: &'static [u8]) -> (ContentDescriptor, Bytes) {
        (
            ContentDescriptor::for_content("bob@example.com", ObjectKind::Avatar, "pic", data),
            Bytes::from_static(data),
        )
    }

    #[test]
    fn cache_put_and_get() {
        let cache = ObjectCache::new(1024);
        let (descriptor, data) = object(b"avatar bytes");
        cache.put(descriptor.clone(), data.clone()).unwrap();

        assert!(cache.contains(&descriptor.hash));
        assert_eq!(cache.get(&descriptor.hash), Some(data));
        assert_eq!(cache.descriptor(&descriptor.hash), Some(descriptor));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_bytes(), 12);
    }

    #[test]
    fn cache_rejects_hash_mismatch() {
        let cache = ObjectCache::new(1024);
        let (descriptor, _) = object(b"expected");
        let result = cache.put(descriptor, Bytes::from_static(b"tampered"));
        assert!(matches!(result, Err(EngineError::HashMismatch)));
        assert!(cache.is_empty());
    }

    #[test]
    fn cache_evicts_least_recently_used() {
        let cache = ObjectCache::new(20);
        let (a, a_data) = object(b"aaaaaaaaaa");
        let (b, b_data) = object(b"bbbbbbbbbb");
        let (c, c_data) = object(b"cccccccccc");

        cache.put(a.clone(), a_data).unwrap();
        cache.put(b.clone(), b_data).unwrap();
        // Touch a so b becomes the oldest.
        cache.get(&a.hash);
        cache.put(c.clone(), c_data).unwrap();

        assert!(cache.contains(&a.hash));
        assert!(!cache.contains(&b.hash));
        assert!(cache.contains(&c.hash));
        assert_eq!(cache.total_bytes(), 20);
    }

    #[test]
    fn published_objects_are_pinned() {
        let cache = ObjectCache::new(10);
        let (mine, mine_data) = object(b"my own avatar");
        cache.publish(mine.clone(), mine_data).unwrap();
        let (other, other_data) = object(b"0123456789");
        cache.put(other.clone(), other_data).unwrap();
        let (newer, newer_data) = object(b"abcdefghij");
        cache.put(newer.clone(), newer_data).unwrap();

        assert!(cache.is_published(&mine.hash));
        assert!(cache.contains(&mine.hash));
        assert!(!cache.contains(&other.hash));
        assert!(cache.contains(&newer.hash));
        assert_eq!(cache.published(), vec![mine]);
    }

    #[test]
    fn oversized_object_is_not_stored() {
        let cache = ObjectCache::new(4);
        let (descriptor, data) = object(b"too large");
        cache.put(descriptor.clone(), data).unwrap();
        assert!(!cache.contains(&descriptor.hash));
    }

    #[test]
    fn cache_remove() {
        let cache = ObjectCache::new(1024);
        let (descriptor, data) = object(b"remove me");
        cache.publish(descriptor.clone(), data.clone()).unwrap();

        assert_eq!(cache.remove(&descriptor.hash), Some(data));
        assert!(cache.remove(&descriptor.hash).is_none());
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn replacing_an_entry_keeps_accounting() {
        let cache = ObjectCache::new(1024);
        let (descriptor, data) = object(b"same");
        cache.put(descriptor.clone(), data.clone()).unwrap();
        cache.publish(descriptor.clone(), data).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_bytes(), 4);
        assert!(cache.is_published(&descriptor.hash));
    }
}
