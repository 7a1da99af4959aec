//! Bounded LRU cache for resolved instances
//!
//! Process-wide and shared across wave workers. The key→instance map is a
//! `DashMap` so hits stay lock-free; recency bookkeeping sits behind one
//! coarse mutex, which is fine because it is touched only on hits and
//! inserts. Eviction removes the least-recently-used ~10% of capacity in one
//! batch rather than one entry at a time, so sustained pressure does not
//! thrash.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use ahash::RandomState;
use dashmap::DashMap;

use crate::key::ServiceKey;
use crate::metadata::ErasedInstance;

#[cfg(feature = "logging")]
use tracing::{debug, trace};

/// Default number of cached instances
pub const DEFAULT_CACHE_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy)]
struct EntryMeta {
    last_access: u64,
    access_count: u64,
}

/// Observability counters; never used for control flow.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub len: usize,
    pub capacity: usize,
}

impl CacheStats {
    /// Hit ratio in `[0, 1]`.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Bounded least-recently-used cache of resolved service instances.
pub struct ResolutionCache {
    capacity: usize,
    instances: DashMap<ServiceKey, ErasedInstance, RandomState>,
    recency: Mutex<HashMap<ServiceKey, EntryMeta, RandomState>>,
    tick: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ResolutionCache {
    /// Create a cache bounded to `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            instances: DashMap::with_capacity_and_hasher(capacity, RandomState::new()),
            recency: Mutex::new(HashMap::with_capacity_and_hasher(
                capacity,
                RandomState::new(),
            )),
            tick: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Fetch a cached instance, updating recency on hit.
    pub fn get(&self, key: ServiceKey) -> Option<ErasedInstance> {
        match self.instances.get(&key) {
            Some(entry) => {
                let instance = entry.value().clone();
                drop(entry);
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.touch(key);

                #[cfg(feature = "logging")]
                trace!(
                    target: "ignition",
                    service = key.name(),
                    "Resolution cache hit"
                );

                Some(instance)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store an instance, evicting an LRU batch when over capacity.
    pub fn set(&self, key: ServiceKey, instance: ErasedInstance) {
        self.instances.insert(key, instance);
        self.touch(key);

        if self.instances.len() > self.capacity {
            self.evict_batch();
        }
    }

    /// Remove one entry. Returns whether it existed.
    pub fn remove(&self, key: ServiceKey) -> bool {
        let removed = self.instances.remove(&key).is_some();
        if removed {
            self.recency.lock().unwrap().remove(&key);
        }
        removed
    }

    /// Drop everything; counters are kept.
    pub fn clear(&self) {
        self.instances.clear();
        self.recency.lock().unwrap().clear();
    }

    /// Current entry count.
    #[inline]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Whether the cache holds nothing.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Snapshot the observability counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            len: self.instances.len(),
            capacity: self.capacity,
        }
    }

    fn touch(&self, key: ServiceKey) {
        let now = self.tick.fetch_add(1, Ordering::Relaxed);
        let mut recency = self.recency.lock().unwrap();
        let meta = recency.entry(key).or_insert(EntryMeta {
            last_access: now,
            access_count: 0,
        });
        meta.last_access = now;
        meta.access_count += 1;
    }

    /// Remove the least-recently-accessed ~10% of capacity in one pass.
    fn evict_batch(&self) {
        let batch = (self.capacity / 10).max(1);
        let victims: Vec<ServiceKey> = {
            let recency = self.recency.lock().unwrap();
            let mut by_age: Vec<(ServiceKey, u64)> = recency
                .iter()
                .map(|(&key, meta)| (key, meta.last_access))
                .collect();
            by_age.sort_by_key(|&(_, tick)| tick);
            by_age.into_iter().take(batch).map(|(key, _)| key).collect()
        };

        let mut evicted = 0u64;
        for key in victims {
            if self.instances.remove(&key).is_some() {
                evicted += 1;
            }
            self.recency.lock().unwrap().remove(&key);
        }
        self.evictions.fetch_add(evicted, Ordering::Relaxed);

        #[cfg(feature = "logging")]
        debug!(
            target: "ignition",
            evicted = evicted,
            remaining = self.instances.len(),
            "Resolution cache evicted LRU batch"
        );
    }
}

impl Default for ResolutionCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl std::fmt::Debug for ResolutionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolutionCache")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn instance(value: u32) -> ErasedInstance {
        Arc::new(value)
    }

    // Distinct key per test slot without declaring dozens of structs.
    fn keys() -> Vec<ServiceKey> {
        macro_rules! slot_keys {
            ($($t:ident),+) => {{
                $(struct $t;)+
                vec![$(ServiceKey::of::<$t>()),+]
            }};
        }
        slot_keys!(
            S00, S01, S02, S03, S04, S05, S06, S07, S08, S09, S10, S11, S12, S13, S14, S15,
            S16, S17, S18, S19, S20, S21
        )
    }

    #[test]
    fn get_set_round_trip() {
        let cache = ResolutionCache::new(8);
        let key = keys()[0];

        assert!(cache.get(key).is_none());
        cache.set(key, instance(7));
        let got = cache.get(key).unwrap().downcast::<u32>().unwrap();
        assert_eq!(*got, 7);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_ratio() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn remove_and_clear() {
        let cache = ResolutionCache::new(8);
        let key = keys()[0];
        cache.set(key, instance(1));

        assert!(cache.remove(key));
        assert!(!cache.remove(key));

        cache.set(key, instance(2));
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn over_capacity_evicts_lru_batch() {
        let all = keys();
        let cache = ResolutionCache::new(20);

        for (i, &key) in all.iter().take(20).enumerate() {
            cache.set(key, instance(i as u32));
        }
        assert_eq!(cache.len(), 20);

        // Refresh everything except the two oldest entries.
        for &key in &all[2..20] {
            assert!(cache.get(key).is_some());
        }

        // One more insert: batch of capacity/10 = 2 LRU entries goes.
        cache.set(all[20], instance(99));

        assert_eq!(cache.len(), 19);
        assert!(cache.get(all[0]).is_none());
        assert!(cache.get(all[1]).is_none());
        // The just-inserted entry is immediately retrievable.
        assert!(cache.get(all[20]).is_some());
        assert_eq!(cache.stats().evictions, 2);
    }

    #[test]
    fn hit_updates_recency() {
        let all = keys();
        let cache = ResolutionCache::new(10);

        for &key in all.iter().take(10) {
            cache.set(key, instance(0));
        }
        // Touch the oldest so it survives the next eviction.
        assert!(cache.get(all[0]).is_some());

        cache.set(all[10], instance(1));
        assert!(cache.get(all[0]).is_some());
        assert!(cache.get(all[1]).is_none());
    }

    #[test]
    fn concurrent_access_is_safe() {
        let cache = Arc::new(ResolutionCache::new(16));
        let all = keys();

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let cache = Arc::clone(&cache);
                let all = all.clone();
                std::thread::spawn(move || {
                    for round in 0..100u32 {
                        let key = all[(worker + round as usize) % 8];
                        cache.set(key, instance(round));
                        let _ = cache.get(key);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(cache.len() <= 16);
    }
}
