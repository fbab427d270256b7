//! Query result cache.
//!
//! `QueryCache` is an LRU map with per-entry TTL, keyed by a SHA-256 digest
//! of `"{db_name}:{query}:{params}"`. A background task sweeps expired
//! entries so keys that are never requested again still leave memory.
//! `CacheManager` owns one cache per connection name and a global switch.
//!
//! Cache operations never await, so state sits behind `std::sync::Mutex`
//! and no lock is held across a suspension point.

use crate::config::{
    DEFAULT_CACHE_CLEANUP_INTERVAL_SECS, DEFAULT_CACHE_MAX_SIZE, DEFAULT_CACHE_TTL_SECS,
};
use crate::models::QueryParam;
use lru::LruCache;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const MIN_CLEANUP_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
struct CacheEntry {
    value: JsonValue,
    created_at: Instant,
    /// Seconds; 0 never expires.
    ttl: u64,
    hits: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.ttl > 0 && now.saturating_duration_since(self.created_at) > Duration::from_secs(self.ttl)
    }
}

#[derive(Debug)]
struct CacheState {
    entries: LruCache<String, CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl CacheState {
    fn remove_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.entries.pop(key);
        }
        self.expirations += expired.len() as u64;
        expired.len()
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    /// Percentage of lookups that hit, rounded to two decimals.
    pub hit_rate: f64,
    pub evictions: u64,
    pub expirations: u64,
    pub default_ttl: u64,
}

/// LRU + TTL cache for query results.
#[derive(Debug)]
pub struct QueryCache {
    state: Arc<Mutex<CacheState>>,
    max_size: usize,
    default_ttl: u64,
    cleanup_interval: Duration,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_MAX_SIZE, DEFAULT_CACHE_TTL_SECS)
    }
}

impl QueryCache {
    /// Create a cache holding at most `max_size` entries (minimum 1).
    pub fn new(max_size: usize, default_ttl: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState {
                // Capacity is enforced by hand so evictions can be counted.
                entries: LruCache::unbounded(),
                hits: 0,
                misses: 0,
                evictions: 0,
                expirations: 0,
            })),
            max_size: max_size.max(1),
            default_ttl,
            cleanup_interval: Duration::from_secs(DEFAULT_CACHE_CLEANUP_INTERVAL_SECS),
            cleanup_task: Mutex::new(None),
        }
    }

    /// Period of the background sweep; clamped to at least one millisecond.
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval.max(MIN_CLEANUP_INTERVAL);
        self
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn default_ttl(&self) -> u64 {
        self.default_ttl
    }

    /// Stable key for a query: hex SHA-256 of `"{db_name}:{query}:{params}"`.
    pub fn make_key(query: &str, params: &[QueryParam], db_name: &str) -> String {
        let params: Vec<JsonValue> = params.iter().map(QueryParam::to_json).collect();
        let material = format!("{}:{}:{}", db_name, query, JsonValue::Array(params));
        hex::encode(Sha256::digest(material.as_bytes()))
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up a cached value. A hit becomes most-recently used.
    pub fn get(&self, query: &str, params: &[QueryParam], db_name: &str) -> Option<JsonValue> {
        let key = Self::make_key(query, params, db_name);
        let now = Instant::now();
        let mut guard = self.lock();
        let state = &mut *guard;

        match state.entries.get_mut(&key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.hits += 1;
                state.hits += 1;
                debug!(key = %key, entry_hits = entry.hits, "Cache hit");
                return Some(entry.value.clone());
            }
            Some(_) => {
                state.entries.pop(&key);
                state.expirations += 1;
            }
            None => {}
        }
        state.misses += 1;
        None
    }

    /// Store a value, evicting least-recently-used entries to make room.
    ///
    /// `ttl` overrides the default; `Some(0)` never expires.
    pub fn set(
        &self,
        query: &str,
        value: JsonValue,
        params: &[QueryParam],
        db_name: &str,
        ttl: Option<u64>,
    ) {
        let key = Self::make_key(query, params, db_name);
        let entry = CacheEntry {
            value,
            created_at: Instant::now(),
            ttl: ttl.unwrap_or(self.default_ttl),
            hits: 0,
        };

        let mut guard = self.lock();
        let state = &mut *guard;
        state.entries.pop(&key);
        while state.entries.len() >= self.max_size {
            if state.entries.pop_lru().is_none() {
                break;
            }
            state.evictions += 1;
        }
        state.entries.put(key, entry);
    }

    /// Remove one entry. Returns whether it was present.
    pub fn delete(&self, query: &str, params: &[QueryParam], db_name: &str) -> bool {
        let key = Self::make_key(query, params, db_name);
        self.lock().entries.pop(&key).is_some()
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    /// Drop cached results that may involve `table`.
    ///
    /// Keys are digests, so there is no way to tell which queries touched
    /// the table; the whole cache is cleared. Returns the number of entries
    /// dropped.
    pub fn invalidate_table(&self, table: &str, db_name: &str) -> usize {
        let mut state = self.lock();
        let dropped = state.entries.len();
        state.entries.clear();
        if dropped > 0 {
            debug!(table = %table, connection = %db_name, dropped, "Invalidated cache");
        }
        dropped
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        self.lock().remove_expired(Instant::now())
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        let lookups = state.hits + state.misses;
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            (state.hits as f64 / lookups as f64 * 10_000.0).round() / 100.0
        };
        CacheStats {
            size: state.entries.len(),
            max_size: self.max_size,
            hits: state.hits,
            misses: state.misses,
            hit_rate,
            evictions: state.evictions,
            expirations: state.expirations,
            default_ttl: self.default_ttl,
        }
    }

    pub fn reset_stats(&self) {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.hits = 0;
        state.misses = 0;
        state.evictions = 0;
        state.expirations = 0;
    }

    pub fn is_running(&self) -> bool {
        self.cleanup_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Start the background sweep. Must be called inside a Tokio runtime;
    /// calling it while already running does nothing.
    pub fn start(&self) {
        let mut task = self
            .cleanup_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        // Weak reference so a dropped cache ends the task.
        let state = Arc::downgrade(&self.state);
        let interval = self.cleanup_interval;
        *task = Some(tokio::spawn(cleanup_loop(state, interval)));
        debug!(interval_secs = interval.as_secs_f64(), "Started cache cleanup task");
    }

    /// Stop the background sweep and wait for it to finish.
    pub async fn stop(&self) {
        let handle = self
            .cleanup_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };

        handle.abort();
        match handle.await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => {}
            Err(e) => warn!(error = %e, "Cache cleanup task ended abnormally"),
        }
    }
}

impl Drop for QueryCache {
    fn drop(&mut self) {
        if let Some(handle) = self
            .cleanup_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

async fn cleanup_loop(state: Weak<Mutex<CacheState>>, period: Duration) {
    // tokio panics on a zero period.
    let mut interval = tokio::time::interval(period.max(MIN_CLEANUP_INTERVAL));
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        interval.tick().await;

        let Some(state) = state.upgrade() else {
            return;
        };
        let removed = state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove_expired(Instant::now());
        if removed > 0 {
            debug!(removed, "Removed expired cache entries");
        }
    }
}

/// One cache per connection name, created on first use.
#[derive(Debug)]
pub struct CacheManager {
    caches: RwLock<HashMap<String, Arc<QueryCache>>>,
    enabled: AtomicBool,
    running: AtomicBool,
    max_size: usize,
    default_ttl: u64,
    cleanup_interval: Duration,
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new(
            DEFAULT_CACHE_MAX_SIZE,
            DEFAULT_CACHE_TTL_SECS,
            Duration::from_secs(DEFAULT_CACHE_CLEANUP_INTERVAL_SECS),
        )
    }
}

impl CacheManager {
    pub fn new(max_size: usize, default_ttl: u64, cleanup_interval: Duration) -> Self {
        Self {
            caches: RwLock::new(HashMap::new()),
            enabled: AtomicBool::new(true),
            running: AtomicBool::new(false),
            max_size,
            default_ttl,
            cleanup_interval,
        }
    }

    /// Cache for `name`, created (and started, if the manager runs) on first use.
    pub fn get_cache(&self, name: &str) -> Arc<QueryCache> {
        if let Some(cache) = self
            .caches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Arc::clone(cache);
        }

        let mut caches = self.caches.write().unwrap_or_else(PoisonError::into_inner);
        let cache = caches.entry(name.to_string()).or_insert_with(|| {
            let cache = QueryCache::new(self.max_size, self.default_ttl)
                .with_cleanup_interval(self.cleanup_interval);
            if self.running.load(Ordering::SeqCst) {
                cache.start();
            }
            Arc::new(cache)
        });
        Arc::clone(cache)
    }

    fn existing(&self, name: &str) -> Option<Arc<QueryCache>> {
        self.caches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn all(&self) -> Vec<Arc<QueryCache>> {
        self.caches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Always a miss while the manager is disabled.
    pub fn get(&self, name: &str, query: &str, params: &[QueryParam]) -> Option<JsonValue> {
        if !self.is_enabled() {
            return None;
        }
        self.get_cache(name).get(query, params, name)
    }

    /// No-op while the manager is disabled.
    pub fn set(
        &self,
        name: &str,
        query: &str,
        value: JsonValue,
        params: &[QueryParam],
        ttl: Option<u64>,
    ) {
        if !self.is_enabled() {
            return;
        }
        self.get_cache(name).set(query, value, params, name, ttl);
    }

    /// Invalidate results for `table` on connection `name`.
    ///
    /// Runs even while the manager is disabled so entries kept across a
    /// disable/enable cycle never outlive a write.
    pub fn invalidate(&self, name: &str, table: &str) -> usize {
        self.existing(name)
            .map(|cache| cache.invalidate_table(table, name))
            .unwrap_or(0)
    }

    pub fn clear(&self, name: &str) {
        if let Some(cache) = self.existing(name) {
            cache.clear();
        }
    }

    pub fn clear_all(&self) {
        for cache in self.all() {
            cache.clear();
        }
        info!("Cleared all query caches");
    }

    /// Stop and forget the cache for `name`.
    pub async fn remove(&self, name: &str) {
        let removed = self
            .caches
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        if let Some(cache) = removed {
            cache.stop().await;
        }
    }

    pub fn start_all(&self) {
        self.running.store(true, Ordering::SeqCst);
        for cache in self.all() {
            cache.start();
        }
    }

    pub async fn stop_all(&self) {
        self.running.store(false, Ordering::SeqCst);
        for cache in self.all() {
            cache.stop().await;
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
        info!("Query cache enabled");
    }

    /// Disable lookups and stores. Existing entries are kept until cleared.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        info!("Query cache disabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn stats(&self, name: &str) -> Option<CacheStats> {
        self.existing(name).map(|cache| cache.stats())
    }

    /// Statistics for every cache, keyed by connection name.
    pub fn all_stats(&self) -> BTreeMap<String, CacheStats> {
        self.caches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, cache)| (name.clone(), cache.stats()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn put(cache: &QueryCache, query: &str, value: i64) {
        cache.set(query, json!(value), &[], "db", None);
    }

    #[test]
    fn test_key_depends_on_all_parts() {
        let base = QueryCache::make_key("SELECT 1", &[], "a");
        assert_eq!(base, QueryCache::make_key("SELECT 1", &[], "a"));
        assert_ne!(base, QueryCache::make_key("SELECT 1", &[], "b"));
        assert_ne!(base, QueryCache::make_key("SELECT 2", &[], "a"));
        assert_ne!(
            base,
            QueryCache::make_key("SELECT 1", &[QueryParam::Int(1)], "a")
        );
        assert_eq!(base.len(), 64);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = QueryCache::new(3, 0);
        put(&cache, "a", 1);
        put(&cache, "b", 2);
        put(&cache, "c", 3);

        // Touch "a" so "b" becomes the oldest.
        assert_eq!(cache.get("a", &[], "db"), Some(json!(1)));
        put(&cache, "d", 4);

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get("b", &[], "db"), None);
        assert_eq!(cache.get("a", &[], "db"), Some(json!(1)));
        assert_eq!(cache.get("c", &[], "db"), Some(json!(3)));
        assert_eq!(cache.get("d", &[], "db"), Some(json!(4)));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_reinsert_replaces_and_refreshes() {
        let cache = QueryCache::new(2, 0);
        put(&cache, "a", 1);
        put(&cache, "b", 2);
        put(&cache, "a", 10);
        put(&cache, "c", 3);

        assert_eq!(cache.get("a", &[], "db"), Some(json!(10)));
        assert_eq!(cache.get("b", &[], "db"), None);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let cache = QueryCache::new(10, 1);
        put(&cache, "short", 1);
        cache.set("forever", json!(2), &[], "db", Some(0));

        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(cache.get("short", &[], "db"), None);
        assert_eq!(cache.get("forever", &[], "db"), Some(json!(2)));
        assert_eq!(cache.stats().expirations, 1);
    }

    #[tokio::test]
    async fn test_cleanup_expired_counts() {
        let cache = QueryCache::new(10, 1);
        put(&cache, "a", 1);
        put(&cache, "b", 2);
        cache.set("c", json!(3), &[], "db", Some(0));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(cache.cleanup_expired(), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().expirations, 2);
    }

    #[test]
    fn test_stats_and_reset() {
        let cache = QueryCache::new(10, 300);
        put(&cache, "a", 1);
        cache.get("a", &[], "db");
        cache.get("a", &[], "db");
        cache.get("missing", &[], "db");

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (2, 1));
        assert_eq!(stats.hit_rate, 66.67);
        assert_eq!(stats.size, 1);
        assert_eq!(stats.default_ttl, 300);

        cache.reset_stats();
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.hit_rate), (0, 0, 0.0));
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn test_delete_and_invalidate() {
        let cache = QueryCache::new(10, 0);
        put(&cache, "a", 1);
        put(&cache, "b", 2);

        assert!(cache.delete("a", &[], "db"));
        assert!(!cache.delete("a", &[], "db"));
        assert_eq!(cache.invalidate_table("users", "db"), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_background_cleanup_and_stop() {
        let cache = QueryCache::new(10, 1).with_cleanup_interval(Duration::from_millis(100));
        put(&cache, "a", 1);
        cache.start();
        assert!(cache.is_running());

        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert!(cache.is_empty());

        cache.stop().await;
        assert!(!cache.is_running());
        // Stopping twice is harmless.
        cache.stop().await;
    }

    #[tokio::test]
    async fn test_manager_lazy_caches_and_switch() {
        let manager = CacheManager::default();
        assert!(manager.stats("main").is_none());

        manager.set("main", "SELECT 1", json!([1]), &[], None);
        assert_eq!(manager.get("main", "SELECT 1", &[]), Some(json!([1])));
        assert_eq!(manager.get("other", "SELECT 1", &[]), None);
        assert_eq!(manager.all_stats().len(), 2);

        manager.disable();
        assert!(!manager.is_enabled());
        assert_eq!(manager.get("main", "SELECT 1", &[]), None);
        manager.set("main", "SELECT 2", json!([2]), &[], None);
        manager.enable();
        assert_eq!(manager.get("main", "SELECT 2", &[]), None);

        assert_eq!(manager.invalidate("main", "t"), 1);
        assert_eq!(manager.stats("main").unwrap().size, 0);
    }

    #[test]
    fn test_invalidate_while_disabled() {
        let manager = CacheManager::default();
        manager.set("main", "SELECT * FROM t", json!([]), &[], None);

        manager.disable();
        assert_eq!(manager.invalidate("main", "t"), 1);
        manager.enable();

        assert_eq!(manager.get("main", "SELECT * FROM t", &[]), None);
    }

    #[tokio::test]
    async fn test_zero_cleanup_interval_still_sweeps() {
        let cache = QueryCache::new(10, 1).with_cleanup_interval(Duration::ZERO);
        put(&cache, "a", 1);
        cache.start();

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(cache.is_running());
        assert!(cache.is_empty());
        cache.stop().await;
    }

    #[tokio::test]
    async fn test_manager_starts_new_caches_when_running() {
        let manager = CacheManager::default();
        let early = manager.get_cache("early");
        manager.start_all();
        assert!(early.is_running());

        let late = manager.get_cache("late");
        assert!(late.is_running());

        manager.stop_all().await;
        assert!(!early.is_running());
        assert!(!late.is_running());

        manager.remove("late").await;
        assert_eq!(manager.all_stats().len(), 1);
    }
}
