//! Ephemeral key-value cache with LRU and TTL eviction
//!
//! Entries are created on demand by an optional `on_create` callback and every
//! entry that physically leaves the cache (capacity pressure, expiry,
//! overwrite, `remove`, `clear`) is handed by value to the optional
//! `on_evict` callback exactly once.
//!
//! Callbacks run after the internal lock has been released, so they may call
//! into other caches (or other keys of this one) freely.

use crate::clock::{system_clock, Clock};
use crate::config::duration_opt;
use crate::error::{BoxError, Result, ToolkitError};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Callback producing the value for a missing key
pub type CreateFn<K, V> =
    dyn Fn(&K) -> std::result::Result<Option<V>, BoxError> + Send + Sync + 'static;

/// Callback receiving an entry as it leaves the cache
pub type EvictFn<K, V> = dyn Fn(&K, V) + Send + Sync + 'static;

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries, 0 for unbounded
    #[serde(alias = "size")]
    pub capacity: usize,
    /// Time-to-live for cache entries, `None` (or zero) never expires
    #[serde(with = "duration_opt")]
    pub ttl: Option<Duration>,
}

impl CacheConfig {
    /// Create a new cache configuration (unbounded, no expiry)
    pub fn new() -> Self {
        Self::default()
    }

    /// Set capacity
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set TTL
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    fn effective_ttl(&self) -> Option<Duration> {
        self.ttl.filter(|ttl| !ttl.is_zero())
    }
}

/// Why an entry left the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EvictReason {
    Capacity,
    Expired,
    Replaced,
    Removed,
    Cleared,
}

/// Cache entry with its expiry deadline
struct CacheEntry<V> {
    value: V,
    deadline: Option<Instant>,
}

impl<V> CacheEntry<V> {
    fn new(value: V, now: Instant, ttl: Option<Duration>) -> Self {
        Self {
            value,
            deadline: ttl.map(|ttl| now + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }
}

/// Lock-protected cache state; insertion order doubles as LRU order
struct CacheState<K, V> {
    entries: IndexMap<K, CacheEntry<V>>,
    hits: u64,
    misses: u64,
}

impl<K: Hash + Eq, V> CacheState<K, V> {
    /// Move the entry at `index` to the most-recently-used end
    fn promote(&mut self, index: usize) {
        let last = self.entries.len() - 1;
        if index != last {
            self.entries.move_index(index, last);
        }
    }
}

/// LRU cache with TTL support and lifecycle callbacks
///
/// Cloning a `Cache` yields another handle to the same entries.
pub struct Cache<K: Hash + Eq + Clone, V: Clone> {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    state: Arc<parking_lot::Mutex<CacheState<K, V>>>,
    on_create: Option<Arc<CreateFn<K, V>>>,
    on_evict: Option<Arc<EvictFn<K, V>>>,
}

impl<K: Hash + Eq + Clone, V: Clone> Cache<K, V> {
    /// Create a new cache
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            clock: system_clock(),
            state: Arc::new(parking_lot::Mutex::new(CacheState {
                entries: IndexMap::new(),
                hits: 0,
                misses: 0,
            })),
            on_create: None,
            on_evict: None,
        }
    }

    /// Create an unbounded, non-expiring cache
    pub fn with_default_config() -> Self {
        Self::new(CacheConfig::default())
    }

    /// Set the callback invoked on a miss
    ///
    /// Returning `Ok(None)` stores nothing; the next lookup asks again.
    pub fn on_create<F>(mut self, f: F) -> Self
    where
        F: Fn(&K) -> std::result::Result<Option<V>, BoxError> + Send + Sync + 'static,
    {
        self.on_create = Some(Arc::new(f));
        self
    }

    /// Set the callback invoked when an entry leaves the cache
    pub fn on_evict<F>(mut self, f: F) -> Self
    where
        F: Fn(&K, V) + Send + Sync + 'static,
    {
        self.on_evict = Some(Arc::new(f));
        self
    }

    /// Use a different time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Configuration this cache was built with
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Get a value, creating it through `on_create` on a miss
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        if let Some(value) = self.find(key) {
            return Ok(Some(value));
        }

        let Some(create) = self.on_create.as_ref() else {
            return Ok(None);
        };

        let value = match create(key) {
            Ok(Some(value)) => value,
            Ok(None) => return Ok(None),
            Err(e) => {
                tracing::warn!("Cache entry creation failed: {}", e);
                return Err(ToolkitError::CreationFailed(e));
            }
        };

        self.store(key.clone(), value.clone());
        Ok(Some(value))
    }

    /// Look up a live entry without creating one
    ///
    /// Refreshes the entry's LRU position. An expired entry is evicted.
    pub fn find(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let mut expired = None;

        let found = {
            let mut state = self.state.lock();
            match state.entries.get_index_of(key) {
                Some(index) if state.entries[index].is_expired(now) => {
                    expired = state.entries.shift_remove_index(index);
                    state.misses += 1;
                    None
                }
                Some(index) => {
                    let value = state.entries[index].value.clone();
                    state.promote(index);
                    state.hits += 1;
                    Some(value)
                }
                None => {
                    state.misses += 1;
                    None
                }
            }
        };

        if let Some((key, entry)) = expired {
            self.evict(key, entry.value, EvictReason::Expired);
        }

        found
    }

    /// Whether a live entry exists for the key
    pub fn has(&self, key: &K) -> bool {
        self.find(key).is_some()
    }

    /// Insert or overwrite a value
    ///
    /// A displaced value goes through `on_evict` before being dropped.
    pub fn set(&self, key: K, value: V) {
        self.store(key, value);
    }

    /// Remove an entry
    ///
    /// Returns `true` if a live entry was removed. An expired entry is still
    /// evicted but reported as absent.
    pub fn remove(&self, key: &K) -> bool {
        let now = self.clock.now();
        let removed = self.state.lock().entries.shift_remove_entry(key);

        match removed {
            Some((key, entry)) => {
                let live = !entry.is_expired(now);
                let reason = if live {
                    EvictReason::Removed
                } else {
                    EvictReason::Expired
                };
                self.evict(key, entry.value, reason);
                live
            }
            None => false,
        }
    }

    /// Remove every entry, passing each to `on_evict`
    pub fn clear(&self) {
        let entries = std::mem::take(&mut self.state.lock().entries);

        for (key, entry) in entries {
            self.evict(key, entry.value, EvictReason::Cleared);
        }
    }

    /// Number of stored entries, including not yet swept expired ones
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();

        CacheStats {
            size: state.entries.len(),
            capacity: self.config.capacity,
            hits: state.hits,
            misses: state.misses,
        }
    }

    /// Evict every expired entry, returning how many were removed
    pub fn prune_expired(&self) -> usize {
        if self.config.effective_ttl().is_none() {
            return 0;
        }

        let now = self.clock.now();
        let expired: Vec<(K, CacheEntry<V>)> = {
            let mut state = self.state.lock();
            let keys: Vec<K> = state
                .entries
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect();

            keys.into_iter()
                .filter_map(|key| state.entries.shift_remove_entry(&key))
                .collect()
        };

        let count = expired.len();
        for (key, entry) in expired {
            self.evict(key, entry.value, EvictReason::Expired);
        }

        count
    }

    /// Get or compute a value without going through `on_create`
    pub fn get_or_insert_with<F>(&self, key: K, f: F) -> V
    where
        F: FnOnce() -> V,
    {
        if let Some(value) = self.find(&key) {
            return value;
        }

        let value = f();
        self.store(key, value.clone());
        value
    }

    /// Start background cleanup task
    pub fn start_cleanup(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()>
    where
        K: Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval);
            loop {
                interval.tick().await;
                self.prune_expired();
            }
        })
    }

    fn store(&self, key: K, value: V) {
        let now = self.clock.now();
        let entry = CacheEntry::new(value, now, self.config.effective_ttl());
        let capacity = self.config.capacity;

        let (displaced, overflow) = {
            let mut state = self.state.lock();
            let (index, old) = state.entries.insert_full(key.clone(), entry);
            state.promote(index);

            let mut overflow = Vec::new();
            if capacity > 0 {
                while state.entries.len() > capacity {
                    match state.entries.shift_remove_index(0) {
                        Some(evicted) => overflow.push(evicted),
                        None => break,
                    }
                }
            }

            (old, overflow)
        };

        if let Some(old) = displaced {
            self.evict(key, old.value, EvictReason::Replaced);
        }
        for (key, entry) in overflow {
            self.evict(key, entry.value, EvictReason::Capacity);
        }
    }

    fn evict(&self, key: K, value: V, reason: EvictReason) {
        tracing::debug!(reason = ?reason, "Cache entry evicted");

        if let Some(on_evict) = self.on_evict.as_ref() {
            on_evict(&key, value);
        }
    }
}

impl<K: Hash + Eq + Clone, V: Clone> Clone for Cache<K, V> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            clock: Arc::clone(&self.clock),
            state: Arc::clone(&self.state),
            on_create: self.on_create.clone(),
            on_evict: self.on_evict.clone(),
        }
    }
}

impl<K: Hash + Eq + Clone, V: Clone> fmt::Debug for Cache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("config", &self.config)
            .field("len", &self.len())
            .finish()
    }
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    /// Current number of entries
    pub size: usize,
    /// Maximum capacity, 0 when unbounded
    pub capacity: usize,
    /// Lookups answered from a live entry
    pub hits: u64,
    /// Lookups that found nothing live
    pub misses: u64,
}

impl CacheStats {
    /// Fill level relative to capacity (0 for unbounded caches)
    pub fn usage_percentage(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            (self.size as f64 / self.capacity as f64) * 100.0
        }
    }

    /// Share of lookups that hit
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
