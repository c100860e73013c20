//! Sharded LRU cache with charge-based capacity.
//!
//! Values are handed out as `Arc`s, so an entry evicted while a caller still
//! holds it stays alive until the last clone is dropped.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

const NUM_SHARD_BITS: usize = 4;
const NUM_SHARD: usize = 1 << NUM_SHARD_BITS;

const NIL: usize = usize::MAX;

/// Called with every entry leaving the cache, whether evicted, erased or
/// replaced.
pub type EvictionCallback<K, V> = Box<dyn Fn(&K, &Arc<V>) + Send + Sync>;

pub struct ShardLRUCache<K: Eq + Hash + Clone, V> {
    caches: Vec<Mutex<LRUCache<K, V>>>,
    on_evict: Option<EvictionCallback<K, V>>,
    last_id: AtomicU64,
}

#[inline]
fn shard(hash: u32) -> usize {
    (hash >> (32 - NUM_SHARD_BITS)) as usize
}

impl<K: Eq + Hash + Clone, V> ShardLRUCache<K, V> {
    pub fn new(capacity: usize) -> ShardLRUCache<K, V> {
        let per_shard = (capacity + (NUM_SHARD - 1)) / NUM_SHARD;
        ShardLRUCache {
            caches: (0..NUM_SHARD)
                .map(|_| Mutex::new(LRUCache::new(per_shard)))
                .collect(),
            on_evict: None,
            last_id: AtomicU64::new(0),
        }
    }

    pub fn with_eviction_callback(mut self, callback: EvictionCallback<K, V>) -> Self {
        self.on_evict = Some(callback);
        self
    }

    #[inline]
    fn lock(&self, hash: u32) -> MutexGuard<LRUCache<K, V>> {
        self.caches[shard(hash)].lock().unwrap()
    }

    /// Insert a mapping from `key` to `value` charged `charge` against the
    /// capacity, replacing any existing mapping.
    pub fn insert(&self, key: K, value: V, charge: usize, hash: u32) -> Arc<V> {
        let value = Arc::new(value);
        let evicted = self.lock(hash).insert(key, value.clone(), charge);
        self.notify(evicted);
        value
    }

    pub fn look_up(&self, key: &K, hash: u32) -> Option<Arc<V>> {
        self.lock(hash).look_up(key)
    }

    pub fn erase(&self, key: &K, hash: u32) {
        let erased = self.lock(hash).erase(key);
        self.notify(erased);
    }

    /// Remove all entries.
    pub fn prune(&self) {
        for cache in &self.caches {
            let removed = cache.lock().unwrap().prune();
            self.notify(removed);
        }
    }

    /// A new numeric id. Clients sharing one cache use it to partition
    /// the key space.
    pub fn new_id(&self) -> u64 {
        self.last_id.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn total_charge(&self) -> usize {
        self.caches.iter().map(|c| c.lock().unwrap().usage).sum()
    }

    fn notify(&self, removed: Vec<(K, Arc<V>)>) {
        if let Some(cb) = &self.on_evict {
            for (k, v) in &removed {
                cb(k, v);
            }
        }
    }
}

struct LRUEntry<K, V> {
    key: K,
    value: Arc<V>,
    charge: usize,
    prev: usize,
    next: usize,
}

/// One shard. Entries live in a slab and are threaded onto a doubly linked
/// list by index; `head` is the most recently used entry.
struct LRUCache<K, V> {
    capacity: usize,
    usage: usize,
    table: HashMap<K, usize>,
    slots: Vec<Option<LRUEntry<K, V>>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
}

impl<K: Eq + Hash + Clone, V> LRUCache<K, V> {
    fn new(capacity: usize) -> LRUCache<K, V> {
        LRUCache {
            capacity,
            usage: 0,
            table: HashMap::new(),
            slots: vec![],
            free: vec![],
            head: NIL,
            tail: NIL,
        }
    }

    fn entry(&self, idx: usize) -> &LRUEntry<K, V> {
        self.slots[idx].as_ref().unwrap_or_else(|| unreachable!())
    }

    fn entry_mut(&mut self, idx: usize) -> &mut LRUEntry<K, V> {
        self.slots[idx].as_mut().unwrap_or_else(|| unreachable!())
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = {
            let e = self.entry(idx);
            (e.prev, e.next)
        };
        if prev == NIL {
            self.head = next;
        } else {
            self.entry_mut(prev).next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.entry_mut(next).prev = prev;
        }
    }

    fn attach_to_head(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let e = self.entry_mut(idx);
            e.prev = NIL;
            e.next = old_head;
        }
        if old_head != NIL {
            self.entry_mut(old_head).prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn look_up(&mut self, key: &K) -> Option<Arc<V>> {
        let idx = *self.table.get(key)?;
        if self.head != idx {
            self.detach(idx);
            self.attach_to_head(idx);
        }
        Some(self.entry(idx).value.clone())
    }

    fn remove_slot(&mut self, idx: usize) -> (K, Arc<V>) {
        self.detach(idx);
        let entry = self.slots[idx].take().unwrap_or_else(|| unreachable!());
        self.free.push(idx);
        self.usage -= entry.charge;
        self.table.remove(&entry.key);
        (entry.key, entry.value)
    }

    fn insert(&mut self, key: K, value: Arc<V>, charge: usize) -> Vec<(K, Arc<V>)> {
        let mut removed = vec![];
        if let Some(&old) = self.table.get(&key) {
            removed.push(self.remove_slot(old));
        }

        let entry = LRUEntry {
            key: key.clone(),
            value,
            charge,
            prev: NIL,
            next: NIL,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(entry);
                idx
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };
        self.attach_to_head(idx);
        self.table.insert(key, idx);
        self.usage += charge;

        // evict the oldest entries, but never the one just inserted
        while self.usage > self.capacity && self.tail != idx {
            let oldest = self.tail;
            removed.push(self.remove_slot(oldest));
        }
        removed
    }

    fn erase(&mut self, key: &K) -> Vec<(K, Arc<V>)> {
        match self.table.get(key) {
            Some(&idx) => vec![self.remove_slot(idx)],
            None => vec![],
        }
    }

    fn prune(&mut self) -> Vec<(K, Arc<V>)> {
        let mut removed = vec![];
        while self.tail != NIL {
            let oldest = self.tail;
            removed.push(self.remove_slot(oldest));
        }
        removed
    }
}
