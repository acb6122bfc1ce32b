//! A bounded, access-ordered cache where every entry also carries an
//! absolute expiry, plus a periodic sweep to evict entries nobody has
//! touched before they expire.
//!
//! Grounded on the `lru::LruCache` usage pattern confirmed idiomatic by
//! the retrieval pack's `jwks_bearer` module, combined with the
//! RwLock-around-a-map shape already used for `InMemoryKeyStore` in
//! `runtime-auth`.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use tokio_util::sync::CancellationToken;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

pub struct ExpiringLru<K, V> {
    inner: Mutex<LruCache<K, Entry<V>>>,
    default_ttl: Duration,
}

impl<K, V> ExpiringLru<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            default_ttl,
        }
    }

    /// Returns the cached value, touching its recency, unless it has
    /// expired (in which case it is evicted and `None` is returned).
    pub fn get(&self, key: &K) -> Option<V> {
        let mut cache = self.inner.lock().expect("lru mutex poisoned");
        let expired = match cache.get(key) {
            Some(entry) => Instant::now() >= entry.expires_at,
            None => return None,
        };
        if expired {
            cache.pop(key);
            None
        } else {
            cache.get(key).map(|entry| entry.value.clone())
        }
    }

    pub fn set(&self, key: K, value: V) {
        self.set_with_expiration(key, value, self.default_ttl);
    }

    pub fn set_with_expiration(&self, key: K, value: V, ttl: Duration) {
        let mut cache = self.inner.lock().expect("lru mutex poisoned");
        cache.put(
            key,
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn remove_all(&self) {
        self.inner.lock().expect("lru mutex poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("lru mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every entry whose expiry has already passed, regardless of
    /// whether it has been touched recently.
    pub fn evict_expired(&self) {
        let mut cache = self.inner.lock().expect("lru mutex poisoned");
        let now = Instant::now();
        let expired: Vec<K> = cache
            .iter()
            .filter(|(_, entry)| now >= entry.expires_at)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            cache.pop(&key);
        }
    }
}

impl<K, V> ExpiringLru<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Spawns a background task that calls `evict_expired` on `interval`
    /// until `cancel` fires.
    pub fn spawn_eviction_loop(
        self: std::sync::Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => self.evict_expired(),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_value_before_expiry() {
        let cache = ExpiringLru::new(10, Duration::from_secs(60));
        cache.set("a".to_string(), 1);
        assert_eq!(cache.get(&"a".to_string()), Some(1));
    }

    #[test]
    fn get_returns_none_after_expiry() {
        let cache: ExpiringLru<String, i32> = ExpiringLru::new(10, Duration::from_secs(60));
        cache.set_with_expiration("a".to_string(), 1, Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get(&"a".to_string()), None);
    }

    #[test]
    fn evicts_capacity_overflow_lru_first() {
        let cache: ExpiringLru<i32, i32> = ExpiringLru::new(2, Duration::from_secs(60));
        cache.set(1, 1);
        cache.set(2, 2);
        cache.get(&1); // touch 1, making 2 the least-recently-used
        cache.set(3, 3); // evicts 2
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&1), Some(1));
        assert_eq!(cache.get(&3), Some(3));
    }

    #[test]
    fn remove_all_clears_everything() {
        let cache: ExpiringLru<i32, i32> = ExpiringLru::new(10, Duration::from_secs(60));
        cache.set(1, 1);
        cache.set(2, 2);
        cache.remove_all();
        assert!(cache.is_empty());
    }

    #[test]
    fn evict_expired_removes_stale_entries_without_touching_fresh_ones() {
        let cache: ExpiringLru<i32, i32> = ExpiringLru::new(10, Duration::from_secs(60));
        cache.set_with_expiration(1, 1, Duration::from_millis(1));
        cache.set_with_expiration(2, 2, Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(5));
        cache.evict_expired();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&2), Some(2));
    }
}
