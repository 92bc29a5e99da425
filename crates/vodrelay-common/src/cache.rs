//! In-process LRU + TTL cache.
//!
//! [`CacheManager`] backs both the manifest cache and the request (probe)
//! cache. Entries expire lazily on read and eagerly through a periodic sweep,
//! and the least-recently-used entry is evicted once the store is full.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;

/// Sizing and expiry settings for a [`CacheManager`].
#[derive(Debug, Clone, Copy)]
pub struct CacheSettings {
    /// Maximum number of entries retained.
    pub max_size: usize,
    /// TTL applied when `set` is called without one.
    pub default_ttl: Duration,
    /// Interval between background sweeps.
    pub cleanup_interval: Duration,
    /// Entry count above which a pressure sweep runs immediately.
    pub pressure_threshold: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_size: 1000,
            default_ttl: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
            pressure_threshold: 1500,
        }
    }
}

/// Snapshot of cache counters, reported by `/health` and `/status`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub hit_rate: f64,
    pub size: usize,
    pub max_size: usize,
    pub default_ttl_secs: u64,
    /// Age of the oldest stored entry.
    pub oldest_entry_ms: u64,
    /// Longest time any stored entry has gone without a hit.
    pub longest_idle_ms: u64,
}

struct Entry<V> {
    value: V,
    created_at: Instant,
    last_access_at: Instant,
    expires_at: Instant,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Default)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

struct Inner<V> {
    entries: LruCache<String, Entry<V>>,
    counters: Counters,
}

impl<V> Inner<V> {
    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.entries.pop(key);
        }
        self.counters.expirations += expired.len() as u64;
        expired.len()
    }

    fn evict_down_to(&mut self, target: usize) -> usize {
        let mut evicted = 0;
        while self.entries.len() > target {
            if self.entries.pop_lru().is_none() {
                break;
            }
            evicted += 1;
        }
        self.counters.evictions += evicted as u64;
        evicted
    }
}

/// Thread-safe keyed store with TTL expiry and LRU eviction.
///
/// Values are cloned out on `get`, so large payloads should be wrapped in
/// `Arc` or be cheaply clonable (`bytes::Bytes`, `Arc<str>`).
pub struct CacheManager<V> {
    name: &'static str,
    settings: CacheSettings,
    inner: Mutex<Inner<V>>,
}

impl<V: Clone + Send + 'static> CacheManager<V> {
    /// Create an empty cache. `name` only appears in log output.
    pub fn new(name: &'static str, settings: CacheSettings) -> Self {
        Self {
            name,
            settings,
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                counters: Counters::default(),
            }),
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Insert `value` under `key`, replacing any previous entry.
    ///
    /// When `ttl` is `None` the configured default TTL applies. A zero TTL
    /// makes the entry expire on the next read.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        let key = key.into();
        let now = Instant::now();
        let ttl = ttl.unwrap_or(self.settings.default_ttl);
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if !inner.entries.contains(&key) {
            let mut evicted = 0u64;
            while inner.entries.len() >= self.settings.max_size.max(1) {
                if inner.entries.pop_lru().is_none() {
                    break;
                }
                evicted += 1;
            }
            inner.counters.evictions += evicted;
        }

        inner.entries.put(
            key,
            Entry {
                value,
                created_at: now,
                last_access_at: now,
                expires_at: now + ttl,
            },
        );

        if inner.entries.len() > self.settings.pressure_threshold {
            self.relieve_pressure(inner, now);
        }
    }

    /// Look up `key`, expiring it first if its TTL has elapsed.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let expired = match inner.entries.peek(key).map(|entry| entry.is_expired(now)) {
            None => {
                inner.counters.misses += 1;
                return None;
            }
            Some(expired) => expired,
        };

        if expired {
            inner.entries.pop(key);
            inner.counters.misses += 1;
            inner.counters.expirations += 1;
            return None;
        }

        let value = inner.entries.get_mut(key).map(|entry| {
            entry.last_access_at = now;
            entry.value.clone()
        });
        inner.counters.hits += 1;
        value
    }

    /// Whether a live entry exists. Does not touch recency or counters.
    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        self.inner
            .lock()
            .entries
            .peek(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Remove `key`. Returns whether an entry was present.
    pub fn delete(&self, key: &str) -> bool {
        self.inner.lock().entries.pop(key).is_some()
    }

    /// Remove every entry. Counters are kept.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let removed = inner.entries.len();
        inner.entries.clear();
        tracing::debug!(cache = self.name, removed, "Cache cleared");
    }

    /// Number of entries currently stored, expired or not.
    pub fn size(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let inner = self.inner.lock();
        let (oldest, idle) = inner.entries.iter().fold(
            (Duration::ZERO, Duration::ZERO),
            |(oldest, idle), (_, entry)| {
                (
                    oldest.max(now.saturating_duration_since(entry.created_at)),
                    idle.max(now.saturating_duration_since(entry.last_access_at)),
                )
            },
        );
        let c = &inner.counters;
        let lookups = c.hits + c.misses;
        CacheStats {
            hits: c.hits,
            misses: c.misses,
            evictions: c.evictions,
            expirations: c.expirations,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                c.hits as f64 / lookups as f64
            },
            size: inner.entries.len(),
            max_size: self.settings.max_size,
            default_ttl_secs: self.settings.default_ttl.as_secs(),
            oldest_entry_ms: oldest.as_millis() as u64,
            longest_idle_ms: idle.as_millis() as u64,
        }
    }

    /// Purge expired entries, then relieve memory pressure if needed.
    ///
    /// Returns the number of entries removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let mut removed = inner.purge_expired(now);
        if inner.entries.len() > self.settings.pressure_threshold {
            removed += self.relieve_pressure(inner, now);
        }
        if removed > 0 {
            tracing::debug!(cache = self.name, removed, "Cache sweep");
        }
        removed
    }

    fn relieve_pressure(&self, inner: &mut Inner<V>, now: Instant) -> usize {
        let purged = inner.purge_expired(now);
        let target = self.settings.max_size * 7 / 10;
        let evicted = inner.evict_down_to(target);
        if purged + evicted == 0 {
            return 0;
        }
        tracing::warn!(
            cache = self.name,
            purged,
            evicted,
            size = inner.entries.len(),
            "Cache over pressure threshold, evicted entries"
        );
        purged + evicted
    }

    /// Start a background task that sweeps the cache every cleanup interval.
    ///
    /// The task holds only a weak reference and exits once the cache is dropped.
    pub fn start_cleanup_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.settings.cleanup_interval.max(Duration::from_millis(10));
        let name = self.name;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    tracing::debug!(cache = name, "Cache dropped, stopping cleanup task");
                    break;
                };
                cache.sweep();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small(max_size: usize) -> CacheManager<String> {
        CacheManager::new(
            "test",
            CacheSettings {
                max_size,
                default_ttl: Duration::from_secs(60),
                cleanup_interval: Duration::from_millis(20),
                pressure_threshold: max_size * 2,
            },
        )
    }

    #[test]
    fn get_returns_value_before_ttl() {
        let cache = small(10);
        cache.set("a", "1".to_string(), Some(Duration::from_secs(5)));
        assert_eq!(cache.get("a").as_deref(), Some("1"));
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn stats_report_entry_age_and_idle_time() {
        let cache = small(10);
        assert_eq!(cache.stats().oldest_entry_ms, 0);

        cache.set("old", "1".to_string(), None);
        cache.set("hot", "2".to_string(), None);
        std::thread::sleep(Duration::from_millis(60));
        cache.get("old");
        cache.get("hot");
        std::thread::sleep(Duration::from_millis(20));

        let stats = cache.stats();
        assert!(stats.oldest_entry_ms >= 80, "{stats:?}");
        // Both entries were read 20ms ago, so idle time restarts from then.
        assert!(stats.longest_idle_ms >= 20 && stats.longest_idle_ms < stats.oldest_entry_ms, "{stats:?}");
    }

    #[test]
    fn get_after_ttl_expires_and_counts() {
        let cache = small(10);
        cache.set("a", "1".to_string(), Some(Duration::from_millis(30)));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(cache.get("a"), None);
        let stats = cache.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 0);
    }

    #[test]
    fn zero_ttl_expires_on_next_get() {
        let cache = small(10);
        cache.set("a", "1".to_string(), Some(Duration::ZERO));
        assert!(!cache.has("a"));
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn inserting_past_max_evicts_exactly_the_lru_key() {
        let cache = small(3);
        cache.set("a", "1".into(), None);
        cache.set("b", "2".into(), None);
        cache.set("c", "3".into(), None);
        // Touch "a" so "b" becomes least recently used.
        assert!(cache.get("a").is_some());
        cache.set("d", "4".into(), None);

        assert_eq!(cache.size(), 3);
        assert_eq!(cache.stats().evictions, 1);
        assert!(!cache.has("b"));
        assert!(cache.has("a"));
        assert!(cache.has("c"));
        assert!(cache.has("d"));
    }

    #[test]
    fn overwrite_does_not_evict() {
        let cache = small(2);
        cache.set("a", "1".into(), None);
        cache.set("b", "2".into(), None);
        cache.set("a", "3".into(), None);
        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(cache.get("a").as_deref(), Some("3"));
    }

    #[test]
    fn has_does_not_touch_counters() {
        let cache = small(2);
        cache.set("a", "1".into(), None);
        assert!(cache.has("a"));
        assert!(!cache.has("zzz"));
        let stats = cache.stats();
        assert_eq!(stats.hits + stats.misses, 0);
    }

    #[test]
    fn delete_and_clear() {
        let cache = small(5);
        cache.set("a", "1".into(), None);
        cache.set("b", "2".into(), None);
        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        cache.clear();
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn hit_rate() {
        let cache = small(5);
        cache.set("a", "1".into(), None);
        cache.get("a");
        cache.get("missing");
        let stats = cache.stats();
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(stats.max_size, 5);
        assert_eq!(stats.default_ttl_secs, 60);
    }

    #[test]
    fn sweep_purges_unread_expired_entries() {
        let cache = small(10);
        cache.set("a", "1".into(), Some(Duration::from_millis(10)));
        cache.set("b", "2".into(), Some(Duration::from_secs(60)));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.size(), 1);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn pressure_evicts_to_seventy_percent() {
        let cache: CacheManager<String> = CacheManager::new(
            "pressure",
            CacheSettings {
                max_size: 10,
                default_ttl: Duration::from_secs(60),
                cleanup_interval: Duration::from_secs(60),
                pressure_threshold: 5,
            },
        );
        for i in 0..9 {
            cache.set(format!("k{i}"), i.to_string(), None);
        }
        assert_eq!(cache.size(), 7);
        assert!(!cache.has("k0"));
        assert!(!cache.has("k1"));
        assert!(cache.has("k8"));
    }

    #[tokio::test]
    async fn cleanup_task_purges_in_background() {
        let cache = Arc::new(small(10));
        cache.set("a", "1".into(), Some(Duration::from_millis(5)));
        let handle = cache.start_cleanup_task();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cache.size(), 0);
        drop(cache);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("cleanup task should stop after drop")
            .expect("cleanup task panicked");
    }
}
