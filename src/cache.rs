use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use slab::Slab;

use crate::passthroughhasher::{BuildPassthroughHasher, PassthroughHashMap};

/// A bounded, thread-safe, least-recently-used cache with cost accounting.
///
/// The cache is split into independently locked shards, so that threads
/// working on different keys rarely contend. The capacity is shared by all
/// shards: when an insertion pushes the total cost over it, the least
/// recently used entries of the whole cache are evicted, whichever shard
/// holds them. Entries are immutable once inserted: inserting a key that is
/// already present keeps the existing value.
///
/// Keys are expected to write a single, uniformly distributed `u128` into
/// their hasher.
pub struct Cache<K, V> {
    shards: Box<[Mutex<Shard<K, V>>]>,
    capacity: AtomicUsize,
    size: AtomicUsize,
    /// Source of recency stamps. Larger is more recent.
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// A snapshot of a cache's counters.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct CacheStatistics {
    /// Lookups that found an entry.
    pub hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Entries removed to make room for others.
    pub evictions: u64,
    /// Number of entries currently stored.
    pub entries: usize,
    /// Summed cost of all stored entries.
    pub current_size: usize,
    /// Maximum summed cost.
    pub capacity: usize,
}

impl<K, V> Cache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Create a cache holding at most `capacity` cost units, split over
    /// `shards` locks.
    pub fn new(capacity: usize, shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Mutex::new(Shard::new())).collect(),
            capacity: AtomicUsize::new(capacity),
            size: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Look up an entry and mark it as recently used.
    pub fn get(&self, key: &K) -> Option<V> {
        let value = self.shard(key).lock().get(key, &self.clock);
        let counter = if value.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        value
    }

    /// Look up an entry without recording a hit or miss.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.shard(key).lock().get(key, &self.clock)
    }

    /// Whether an entry exists, without touching recency or statistics.
    pub fn contains(&self, key: &K) -> bool {
        self.shard(key).lock().map.contains_key(key)
    }

    /// Insert an entry unless one already exists for the key.
    ///
    /// Returns whether the value was stored. A value whose cost exceeds the
    /// capacity is never stored.
    pub fn insert(&self, key: K, value: V, cost: usize) -> bool {
        let capacity = self.capacity();
        if cost > capacity {
            return false;
        }
        {
            let mut shard = self.shard(&key).lock();
            if !shard.insert(key, value, cost, &self.clock) {
                return false;
            }
            self.size.fetch_add(cost, Ordering::Relaxed);
        }
        self.evict_to(capacity);
        true
    }

    /// Remove all entries. Statistics counters are kept.
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            let mut shard = shard.lock();
            self.size.fetch_sub(shard.cost, Ordering::Relaxed);
            shard.clear();
        }
    }

    /// Change the total capacity, evicting entries if necessary.
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::Relaxed);
        self.evict_to(capacity);
    }

    /// The total capacity.
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    /// The summed cost of all entries.
    pub fn current_size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// The number of entries.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().map.len()).sum()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A snapshot of the counters.
    pub fn statistics(&self) -> CacheStatistics {
        CacheStatistics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.len(),
            current_size: self.current_size(),
            capacity: self.capacity(),
        }
    }

    /// Reset the hit, miss and eviction counters.
    pub fn reset_statistics(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }

    fn shard(&self, key: &K) -> &Mutex<Shard<K, V>> {
        let h = BuildPassthroughHasher.hash_one(key);
        &self.shards[(h >> 40) as usize % self.shards.len()]
    }

    /// Evict the least recently used entries of all shards until the total
    /// cost fits into `capacity`.
    ///
    /// Only one shard is locked at a time. A shard whose oldest entry
    /// changed between finding and evicting it is simply looked at again.
    fn evict_to(&self, capacity: usize) {
        let mut evicted = 0;
        while self.current_size() > capacity {
            let oldest = self
                .shards
                .iter()
                .enumerate()
                .filter_map(|(i, shard)| Some((shard.lock().oldest()?, i)))
                .min();
            let Some((stamp, i)) = oldest else { break };
            if let Some(cost) = self.shards[i].lock().pop_oldest(stamp) {
                self.size.fetch_sub(cost, Ordering::Relaxed);
                evicted += 1;
            }
        }
        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
        }
    }
}

/// One independently locked part of a cache.
///
/// Entries live in a slab and are threaded onto an intrusive doubly linked
/// list ordered from most (`head`) to least (`tail`) recently used.
struct Shard<K, V> {
    map: PassthroughHashMap<K, usize>,
    entries: Slab<Entry<K, V>>,
    head: Option<usize>,
    tail: Option<usize>,
    cost: usize,
}

struct Entry<K, V> {
    key: K,
    value: V,
    cost: usize,
    stamp: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

impl<K, V> Shard<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn new() -> Self {
        Self {
            map: PassthroughHashMap::default(),
            entries: Slab::new(),
            head: None,
            tail: None,
            cost: 0,
        }
    }

    fn get(&mut self, key: &K, clock: &AtomicU64) -> Option<V> {
        let id = *self.map.get(key)?;
        self.touch(id, clock);
        Some(self.entries[id].value.clone())
    }

    /// Returns whether the entry was inserted.
    fn insert(&mut self, key: K, value: V, cost: usize, clock: &AtomicU64) -> bool {
        if let Some(&id) = self.map.get(&key) {
            self.touch(id, clock);
            return false;
        }

        let stamp = clock.fetch_add(1, Ordering::Relaxed);
        let entry = Entry { key: key.clone(), value, cost, stamp, prev: None, next: None };
        let id = self.entries.insert(entry);
        self.map.insert(key, id);
        self.link_front(id);
        self.cost += cost;
        true
    }

    /// The recency stamp of the least recently used entry.
    fn oldest(&self) -> Option<u64> {
        self.tail.map(|id| self.entries[id].stamp)
    }

    /// Remove the least recently used entry if it still carries `stamp`.
    /// Returns its cost.
    fn pop_oldest(&mut self, stamp: u64) -> Option<usize> {
        let id = self.tail?;
        if self.entries[id].stamp != stamp {
            return None;
        }
        self.unlink(id);
        let entry = self.entries.remove(id);
        self.map.remove(&entry.key);
        self.cost -= entry.cost;
        Some(entry.cost)
    }

    fn clear(&mut self) {
        self.map.clear();
        self.entries.clear();
        self.head = None;
        self.tail = None;
        self.cost = 0;
    }

    fn touch(&mut self, id: usize, clock: &AtomicU64) {
        self.entries[id].stamp = clock.fetch_add(1, Ordering::Relaxed);
        self.unlink(id);
        self.link_front(id);
    }

    fn unlink(&mut self, id: usize) {
        let (prev, next) = {
            let entry = &mut self.entries[id];
            (entry.prev.take(), entry.next.take())
        };
        match prev {
            Some(p) => self.entries[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.entries[n].prev = prev,
            None => self.tail = prev,
        }
    }

    fn link_front(&mut self, id: usize) {
        let old = self.head.replace(id);
        self.entries[id].next = old;
        match old {
            Some(old) => self.entries[old].prev = Some(id),
            None => self.tail = Some(id),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::hash::Hasher;

    use quickcheck_macros::quickcheck;

    use super::*;

    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    struct Key(u128);

    impl Hash for Key {
        fn hash<H: Hasher>(&self, state: &mut H) {
            state.write_u128(self.0);
        }
    }

    fn key(i: u64) -> Key {
        Key(crate::hash::hash(&i).as_u128())
    }

    #[test]
    fn test_lru_order() {
        let cache = Cache::new(3, 1);
        cache.insert(key(1), 1, 1);
        cache.insert(key(2), 2, 1);
        cache.insert(key(3), 3, 1);
        assert_eq!(cache.get(&key(1)), Some(1));
        cache.insert(key(4), 4, 1);
        assert_eq!(cache.get(&key(2)), None);
        assert_eq!(cache.get(&key(1)), Some(1));
        assert_eq!(cache.get(&key(3)), Some(3));
        assert_eq!(cache.get(&key(4)), Some(4));
        assert_eq!(cache.statistics().evictions, 1);
    }

    #[test]
    fn test_cost_accounting() {
        let cache = Cache::new(10, 1);
        cache.insert(key(1), "a", 4);
        cache.insert(key(2), "b", 4);
        cache.insert(key(3), "c", 4);
        assert_eq!(cache.current_size(), 8);
        assert!(!cache.contains(&key(1)));
        assert!(!cache.insert(key(4), "too big", 11));
    }

    #[test]
    fn test_first_insert_wins() {
        let cache = Cache::new(10, 4);
        assert!(cache.insert(key(1), 1, 1));
        assert!(!cache.insert(key(1), 2, 1));
        assert_eq!(cache.get(&key(1)), Some(1));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_clear_and_resize() {
        let cache = Cache::new(100, 2);
        for i in 0..20 {
            cache.insert(key(i), i, 5);
        }
        cache.set_capacity(20);
        assert!(cache.current_size() <= 20);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.current_size(), 0);
        assert_eq!(cache.capacity(), 20);
    }

    #[test]
    fn test_statistics() {
        let cache = Cache::new(10, 2);
        cache.insert(key(1), 1, 1);
        cache.get(&key(1));
        cache.get(&key(2));
        let stats = cache.statistics();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
        cache.reset_statistics();
        assert_eq!(cache.statistics().hits, 0);
    }

    #[test]
    fn test_capacity_is_shared_by_shards() {
        let cache = Cache::new(3, 4);
        for i in 0..200 {
            assert!(cache.insert(key(i), i, 1));
            assert!(cache.current_size() <= 3);
        }
        assert_eq!(cache.len(), 3);
        assert!(cache.contains(&key(199)));
        assert!(cache.insert(key(500), 500, 3));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.current_size(), 3);
    }

    #[test]
    fn test_lru_order_across_shards() {
        let cache = Cache::new(3, 16);
        cache.insert(key(1), 1, 1);
        cache.insert(key(2), 2, 1);
        cache.insert(key(3), 3, 1);
        assert_eq!(cache.get(&key(1)), Some(1));
        cache.insert(key(4), 4, 1);
        assert!(!cache.contains(&key(2)));
        assert!(cache.contains(&key(1)));
        assert!(cache.contains(&key(3)));
        assert!(cache.contains(&key(4)));
    }

    #[quickcheck]
    fn prop_never_exceeds_capacity(ops: Vec<(u8, u8)>, capacity: u8) -> bool {
        let capacity = usize::from(capacity);
        let cache = Cache::new(capacity, 4);
        ops.into_iter().all(|(k, cost)| {
            let cost = usize::from(cost % 16);
            let stored = cache.insert(key(k.into()), k, cost);
            let summed: usize = cache.shards.iter().map(|shard| shard.lock().cost).sum();
            cache.current_size() <= capacity
                && summed == cache.current_size()
                && (stored || cost > capacity || cache.contains(&key(k.into())))
        })
    }
}
