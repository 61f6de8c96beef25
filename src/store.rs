//! In-memory key-value table with per-key write locking.
//!
//! The table is a concurrent hash map; writers serialize per key through a
//! striped array of async mutexes. The primary's PUT path holds its key's
//! lock across the replication forward, so the lock type must be one that
//! may be held across an await point; reads take no lock at all.

use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{Mutex, MutexGuard};

use crate::protocol::{Key, KEY_SIZE};

// Number of key-lock stripes; must be a power of two. Collisions only cost
// extra serialization between unrelated keys, never incorrectness.
const LOCK_STRIPES: usize = 1024;

/// Error marker for a table that has reached its memory budget.
#[derive(Debug, PartialEq, Eq)]
pub struct OutOfSpace;

/// In-memory table holding one replica key set.
pub struct KvTable {
    /// The stored entries.
    entries: DashMap<Key, Bytes>,

    /// Striped per-key write locks.
    locks: Vec<Mutex<()>>,

    /// Approximate bytes currently stored (keys + values).
    mem_used: AtomicUsize,

    /// Memory budget in bytes; 0 means unbounded.
    mem_limit: usize,
}

impl KvTable {
    /// Creates an empty table with the given memory budget (0 = unbounded).
    pub fn new(mem_limit: usize) -> Self {
        KvTable {
            entries: DashMap::new(),
            locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            mem_used: AtomicUsize::new(0),
            mem_limit,
        }
    }

    // Stable stripe index for a key; independent of the placement hash so
    // that stripe distribution does not correlate with shard assignment.
    fn stripe(key: &Key) -> usize {
        let mut mix: usize = 0;
        for &byte in key {
            mix = mix.wrapping_mul(31).wrapping_add(byte as usize);
        }
        mix & (LOCK_STRIPES - 1)
    }

    /// Acquires the write lock covering this key. The returned guard may be
    /// held across the replication forward; writers on other stripes are
    /// unaffected.
    pub async fn lock_key(&self, key: &Key) -> MutexGuard<'_, ()> {
        self.locks[Self::stripe(key)].lock().await
    }

    /// Looks up the value stored for a key.
    pub fn get(&self, key: &Key) -> Option<Bytes> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Inserts or replaces the value for a key, returning the previous value
    /// if there was one. Callers mutating shared replicas hold the key lock,
    /// which also keeps the budget pre-check stable.
    pub fn put(
        &self,
        key: &Key,
        value: Bytes,
    ) -> Result<Option<Bytes>, OutOfSpace> {
        let new_size = KEY_SIZE + value.len();
        let old_size = self
            .entries
            .get(key)
            .map(|entry| KEY_SIZE + entry.value().len())
            .unwrap_or(0);
        if self.mem_limit > 0 {
            let used = self.mem_used.load(Ordering::Relaxed);
            if used + new_size > self.mem_limit + old_size {
                return Err(OutOfSpace);
            }
        }

        let old = self.entries.insert(*key, value);
        self.mem_used.fetch_add(new_size, Ordering::Relaxed);
        if let Some(ref old_value) = old {
            self.mem_used
                .fetch_sub(KEY_SIZE + old_value.len(), Ordering::Relaxed);
        }
        Ok(old)
    }

    /// Removes a key, returning the value it held if any.
    pub fn remove(&self, key: &Key) -> Option<Bytes> {
        let old = self.entries.remove(key).map(|(_, value)| value);
        if let Some(ref old_value) = old {
            self.mem_used
                .fetch_sub(KEY_SIZE + old_value.len(), Ordering::Relaxed);
        }
        old
    }

    /// Number of entries currently stored.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Approximate bytes currently stored.
    pub fn mem_used(&self) -> usize {
        self.mem_used.load(Ordering::Relaxed)
    }

    /// Snapshot of the current key set; the recovery streamer walks this
    /// list and re-reads each value under its key lock.
    pub fn snapshot_keys(&self) -> Vec<Key> {
        self.entries.iter().map(|entry| *entry.key()).collect()
    }
}

#[cfg(test)]
mod store_tests {
    use super::*;
    use crate::protocol::key_from_bytes;
    use std::sync::Arc;

    #[test]
    fn put_get_remove() {
        let table = KvTable::new(0);
        let key = key_from_bytes(b"apple");
        assert_eq!(table.get(&key), None);
        assert_eq!(table.put(&key, Bytes::from_static(b"red")), Ok(None));
        assert_eq!(table.get(&key), Some(Bytes::from_static(b"red")));
        assert_eq!(
            table.put(&key, Bytes::from_static(b"green")),
            Ok(Some(Bytes::from_static(b"red")))
        );
        assert_eq!(table.get(&key), Some(Bytes::from_static(b"green")));
        assert_eq!(table.remove(&key), Some(Bytes::from_static(b"green")));
        assert_eq!(table.get(&key), None);
        assert!(table.is_empty());
    }

    #[test]
    fn put_is_idempotent() {
        let table = KvTable::new(0);
        let key = key_from_bytes(b"kx");
        table.put(&key, Bytes::from_static(b"a")).unwrap();
        table.put(&key, Bytes::from_static(b"a")).unwrap();
        assert_eq!(table.get(&key), Some(Bytes::from_static(b"a")));
        assert_eq!(table.len(), 1);
        assert_eq!(table.mem_used(), KEY_SIZE + 1);
    }

    #[test]
    fn memory_budget_enforced() {
        let table = KvTable::new(2 * (KEY_SIZE + 8));
        let k1 = key_from_bytes(b"k1");
        let k2 = key_from_bytes(b"k2");
        let k3 = key_from_bytes(b"k3");
        assert!(table.put(&k1, Bytes::from_static(b"12345678")).is_ok());
        assert!(table.put(&k2, Bytes::from_static(b"12345678")).is_ok());
        assert_eq!(
            table.put(&k3, Bytes::from_static(b"12345678")),
            Err(OutOfSpace)
        );
        // a rejected insert leaves existing state untouched
        assert_eq!(table.get(&k3), None);
        assert_eq!(table.len(), 2);
        // overwriting within budget still works
        assert!(table.put(&k1, Bytes::from_static(b"1234")).is_ok());
    }

    #[test]
    fn snapshot_covers_all_keys() {
        let table = KvTable::new(0);
        for i in 0..50u8 {
            table
                .put(&key_from_bytes(&[i]), Bytes::from(vec![i]))
                .unwrap();
        }
        let mut keys = table.snapshot_keys();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_distinct_keys() {
        let table = Arc::new(KvTable::new(0));
        let mut handles = vec![];
        for i in 0..32u8 {
            let table = table.clone();
            handles.push(tokio::spawn(async move {
                let key = key_from_bytes(&[i, 0xee]);
                let _guard = table.lock_key(&key).await;
                table.put(&key, Bytes::from(vec![i])).unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(table.len(), 32);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_key_writers_serialize() {
        let table = Arc::new(KvTable::new(0));
        let key = key_from_bytes(b"contended");
        let mut handles = vec![];
        for i in 0..8u8 {
            let table = table.clone();
            handles.push(tokio::spawn(async move {
                let _guard = table.lock_key(&key).await;
                // read-modify-write is atomic under the key lock
                let seen = table.get(&key).map(|v| v.len()).unwrap_or(0);
                table.put(&key, Bytes::from(vec![i; seen + 1])).unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        // every writer observed the previous one's value
        assert_eq!(table.get(&key).unwrap().len(), 8);
    }
}
