//! Bounded LRU of seen ids with hit/miss/eviction counters.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DedupStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

/// Shared across relay connections; all methods take `&self`.
pub struct DedupCache<K: Hash + Eq> {
    seen: Mutex<LruCache<K, ()>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<K: Hash + Eq> DedupCache<K> {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: Mutex::new(LruCache::new(cap)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// False the first time `id` is seen (and records it); true afterwards. A hit
    /// refreshes the id's recency.
    pub fn is_duplicate(&self, id: K) -> bool {
        let mut seen = self.seen.lock();
        if seen.get(&id).is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        if seen.push(id, ()).is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        false
    }

    /// Membership test without recording or promoting.
    pub fn contains(&self, id: &K) -> bool {
        self.seen.lock().contains(id)
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.seen.lock().clear();
    }

    pub fn stats(&self) -> DedupStats {
        let (size, capacity) = {
            let seen = self.seen.lock();
            (seen.len(), seen.cap().get())
        };
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        DedupStats {
            size,
            capacity,
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn first_sighting_is_not_duplicate() {
        let c = DedupCache::new(4);
        assert!(!c.is_duplicate("a".to_string()));
        assert!(c.is_duplicate("a".to_string()));
        let s = c.stats();
        assert_eq!((s.hits, s.misses, s.size), (1, 1, 1));
        assert!((s.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn overflow_evicts_least_recently_touched() {
        let c = DedupCache::new(3);
        for id in ["a", "b", "c"] {
            c.is_duplicate(id);
        }
        // Touch "a" so "b" becomes the oldest.
        assert!(c.is_duplicate("a"));
        assert!(!c.is_duplicate("d"));
        assert!(!c.contains(&"b"));
        assert!(c.contains(&"a"));
        assert!(c.contains(&"c"));
        assert_eq!(c.stats().evictions, 1);
        assert_eq!(c.len(), 3);
    }

    #[test]
    fn without_touch_oldest_goes() {
        let c = DedupCache::new(2);
        c.is_duplicate(1u32);
        c.is_duplicate(2u32);
        c.is_duplicate(3u32);
        assert!(!c.contains(&1));
        assert_eq!(c.stats().capacity, 2);
    }

    #[test]
    fn concurrent_callers_agree() {
        let c = Arc::new(DedupCache::new(1000));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let c = Arc::clone(&c);
                std::thread::spawn(move || (0..100u32).filter(|i| !c.is_duplicate(*i)).count())
            })
            .collect();
        let firsts: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(firsts, 100);
        assert_eq!(c.stats().hits, 300);
    }
}
