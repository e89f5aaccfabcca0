//! Bounded in-process caches with a time-to-live.
//!
//! Three instances live in the process (memory, RAG snippets, chat replies).
//! Reads and writes take a short `parking_lot` lock and never await.

use lru::LruCache;
use parking_lot::Mutex;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

pub struct TtlCache<K: Hash + Eq, V: Clone> {
    inner: Mutex<LruCache<K, (Instant, V)>>,
    ttl: Duration,
}

impl<K: Hash + Eq, V: Clone> TtlCache<K, V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Returns a clone of the live entry. Expired entries are evicted on read.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut cache = self.inner.lock();
        let expired = match cache.get(key) {
            Some((inserted, value)) if inserted.elapsed() < self.ttl => return Some(value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            cache.pop(key);
        }
        None
    }

    pub fn insert(&self, key: K, value: V) {
        self.inner.lock().put(key, (Instant::now(), value));
    }

    pub fn invalidate(&self, key: &K) {
        self.inner.lock().pop(key);
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used_over_capacity() {
        let cache = TtlCache::new(2, Duration::from_secs(60));
        cache.insert("a", 1);
        cache.insert("b", 2);
        assert_eq!(cache.get(&"a"), Some(1));
        cache.insert("c", 3);
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn expired_entries_disappear() {
        let cache = TtlCache::new(4, Duration::from_millis(0));
        cache.insert("k", "v".to_string());
        assert_eq!(cache.get(&"k"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = TtlCache::new(4, Duration::from_secs(60));
        cache.insert(1, "x");
        cache.invalidate(&1);
        assert_eq!(cache.get(&1), None);
    }
}
