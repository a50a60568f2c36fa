//! Bounded cache with TTL and max-size eviction.
//!
//! Used by the indexer client to keep recently fetched transactions, since every
//! replayed batch resolves the same inputs again.
//!
//! Each cached transaction is a few hundred bytes, so the default 10k entries stay
//! within a few MB.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

pub const DEFAULT_CACHE_SIZE: usize = 10_000;
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3_600);

/// Map with TTL and capacity limits.
///
/// - **Max capacity:** when full, the oldest entry is evicted on insert.
/// - **TTL:** expired entries are never returned and are purged on insert.
pub struct BoundedCache<K, V> {
    map: HashMap<K, (V, Instant)>,
    max_size: usize,
    ttl: Duration,
}

impl<K: Hash + Eq + Clone, V: Clone> BoundedCache<K, V> {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            map: HashMap::new(),
            max_size,
            ttl,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.map
            .get(key)
            .filter(|(_, t)| t.elapsed() < self.ttl)
            .map(|(v, _)| v.clone())
    }

    pub fn insert(&mut self, key: K, value: V) {
        if self.max_size == 0 {
            return;
        }
        let now = Instant::now();
        self.map.retain(|_, (_, t)| now.duration_since(*t) < self.ttl);
        while self.map.len() >= self.max_size && !self.map.contains_key(&key) {
            let oldest = self
                .map
                .iter()
                .min_by_key(|(_, (_, t))| *t)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    self.map.remove(&k);
                }
                None => break,
            }
        }
        self.map.insert(key, (value, now));
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl<K: Hash + Eq + Clone, V: Clone> Default for BoundedCache<K, V> {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_SIZE, DEFAULT_CACHE_TTL)
    }
}
