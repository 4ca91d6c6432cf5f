//! Generic TTL cache with FIFO eviction and pattern invalidation
//!
//! This is the shared key/value cache behind the identity resolver and the
//! app-level response cache. Entries carry a per-entry TTL and are treated
//! as absent once expired, whether or not the sweeper has purged them yet.
//!
//! Eviction is FIFO by insertion order, NOT recency-based: when the cache is
//! at capacity and a new key arrives, the oldest-inserted key is removed,
//! regardless of how recently it was read. The credential cache uses true
//! LRU; the two policies are intentionally distinct.

use std::collections::HashMap;
use std::time::Duration;

use std::sync::Arc;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::observability::record_cache_event;

/// Cache configuration, supplied at construction and immutable afterward.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Name used in logs, events, and metric labels
    pub name: &'static str,
    /// Maximum number of entries before FIFO eviction
    pub max_entries: usize,
    /// TTL applied when `set` is called without an explicit one
    pub default_ttl: Duration,
    /// Interval for the background sweep task
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "generic",
            max_entries: 10_000,
            default_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Running counters for cache observability.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    /// Entries removed by FIFO eviction
    pub evictions: u64,
    /// Entries removed because their TTL elapsed (on read or by sweep)
    pub expired: u64,
    /// Current number of entries, including not-yet-swept expired ones
    pub entries: u64,
    /// Hit rate as percentage (0.0 - 100.0)
    pub hit_rate: f64,
}

impl CacheStats {
    pub fn calculate_hit_rate(hits: u64, misses: u64) -> f64 {
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            (hits as f64 / total as f64) * 100.0
        }
    }
}

/// Event emitted for every observable cache operation.
///
/// Consumed by external monitoring via [`GenericCache::subscribe`]; each
/// event also increments a `metrics` counter labeled with the cache name.
#[derive(Debug, Clone)]
pub enum CacheEvent {
    Hit { key: String },
    Miss { key: String },
    Expired { key: String },
    Set { key: String },
    Delete { key: String },
    Evict { key: String },
    Invalidate { pattern: String, removed: usize },
}

impl CacheEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            CacheEvent::Hit { .. } => "hit",
            CacheEvent::Miss { .. } => "miss",
            CacheEvent::Expired { .. } => "expired",
            CacheEvent::Set { .. } => "set",
            CacheEvent::Delete { .. } => "delete",
            CacheEvent::Evict { .. } => "evict",
            CacheEvent::Invalidate { .. } => "invalidate",
        }
    }
}

/// Internal cache entry with TTL and insertion-order tracking
#[derive(Clone, Debug)]
struct CacheEntry<T> {
    value: T,
    stored_at: Instant,
    ttl: Duration,
    /// Monotonic insertion sequence; lowest is evicted first.
    /// Preserved across overwrites so an update does not change
    /// the key's place in eviction order.
    seq: u64,
}

impl<T> CacheEntry<T> {
    fn is_expired(&self) -> bool {
        self.stored_at.elapsed() > self.ttl
    }
}

#[derive(Debug)]
struct Inner<T> {
    map: HashMap<String, CacheEntry<T>>,
    next_seq: u64,
}

/// Generic TTL cache with FIFO eviction.
///
/// Cloning is cheap and shares the underlying storage.
pub struct GenericCache<T> {
    config: CacheConfig,
    entries: Arc<RwLock<Inner<T>>>,
    stats: Arc<RwLock<CacheStats>>,
    events: broadcast::Sender<CacheEvent>,
}

impl<T> Clone for GenericCache<T> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            entries: Arc::clone(&self.entries),
            stats: Arc::clone(&self.stats),
            events: self.events.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> GenericCache<T> {
    pub fn new(config: CacheConfig) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            config,
            entries: Arc::new(RwLock::new(Inner {
                map: HashMap::new(),
                next_seq: 0,
            })),
            stats: Arc::new(RwLock::new(CacheStats::default())),
            events,
        }
    }

    /// Subscribe to the cache event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: CacheEvent) {
        record_cache_event(self.config.name, event.kind());
        // No receivers is fine; events are best-effort for monitoring.
        let _ = self.events.send(event);
    }

    /// Get a cached value. An entry past its TTL is removed as a side effect
    /// and reported as absent, even if the sweeper has not run yet.
    pub async fn get(&self, key: &str) -> Option<T> {
        let mut inner = self.entries.write().await;
        let mut stats = self.stats.write().await;

        match inner.map.get(key) {
            Some(entry) if !entry.is_expired() => {
                stats.hits += 1;
                let value = entry.value.clone();
                drop(inner);
                drop(stats);
                self.emit(CacheEvent::Hit {
                    key: key.to_string(),
                });
                Some(value)
            }
            Some(_) => {
                // Expiry-on-read
                inner.map.remove(key);
                stats.expired += 1;
                stats.misses += 1;
                drop(inner);
                drop(stats);
                self.emit(CacheEvent::Expired {
                    key: key.to_string(),
                });
                None
            }
            None => {
                stats.misses += 1;
                drop(inner);
                drop(stats);
                self.emit(CacheEvent::Miss {
                    key: key.to_string(),
                });
                None
            }
        }
    }

    /// Store a value with the given TTL (or the configured default).
    ///
    /// If the cache is at capacity and the key is new, the oldest-inserted
    /// key is evicted first. Capacity is a hard ceiling, not best-effort.
    pub async fn set(&self, key: &str, value: T, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let mut evicted = None;

        {
            let mut inner = self.entries.write().await;
            let mut stats = self.stats.write().await;

            let existing_seq = inner.map.get(key).map(|e| e.seq);
            if existing_seq.is_none() && inner.map.len() >= self.config.max_entries {
                let oldest = inner
                    .map
                    .iter()
                    .min_by_key(|(_, entry)| entry.seq)
                    .map(|(k, _)| k.clone());
                if let Some(oldest_key) = oldest {
                    inner.map.remove(&oldest_key);
                    stats.evictions += 1;
                    evicted = Some(oldest_key);
                }
            }

            let seq = match existing_seq {
                Some(seq) => seq,
                None => {
                    let seq = inner.next_seq;
                    inner.next_seq += 1;
                    seq
                }
            };

            inner.map.insert(
                key.to_string(),
                CacheEntry {
                    value,
                    stored_at: Instant::now(),
                    ttl,
                    seq,
                },
            );
            stats.sets += 1;
        }

        if let Some(oldest_key) = evicted {
            self.emit(CacheEvent::Evict { key: oldest_key });
        }
        self.emit(CacheEvent::Set {
            key: key.to_string(),
        });
    }

    /// Remove a specific entry. Returns whether it was present.
    pub async fn delete(&self, key: &str) -> bool {
        let removed = {
            let mut inner = self.entries.write().await;
            let mut stats = self.stats.write().await;
            let removed = inner.map.remove(key).is_some();
            if removed {
                stats.deletes += 1;
            }
            removed
        };
        if removed {
            self.emit(CacheEvent::Delete {
                key: key.to_string(),
            });
        }
        removed
    }

    /// Remove every key matching a glob-style pattern; returns how many
    /// were removed.
    ///
    /// Supported shapes: `*` (everything), `prefix*`, `*suffix`,
    /// `*contains*`, or an exact key.
    pub async fn invalidate_pattern(&self, pattern: &str) -> usize {
        let removed = {
            let mut inner = self.entries.write().await;
            let mut stats = self.stats.write().await;
            let before = inner.map.len();

            if pattern == "*" {
                inner.map.clear();
            } else if pattern.starts_with('*') && pattern.ends_with('*') && pattern.len() > 1 {
                let middle = &pattern[1..pattern.len() - 1];
                inner.map.retain(|key, _| !key.contains(middle));
            } else if let Some(suffix) = pattern.strip_prefix('*') {
                inner.map.retain(|key, _| !key.ends_with(suffix));
            } else if let Some(prefix) = pattern.strip_suffix('*') {
                inner.map.retain(|key, _| !key.starts_with(prefix));
            } else {
                inner.map.remove(pattern);
            }

            let removed = before - inner.map.len();
            stats.deletes += removed as u64;
            removed
        };

        self.emit(CacheEvent::Invalidate {
            pattern: pattern.to_string(),
            removed,
        });
        removed
    }

    /// Remove every entry the predicate matches; returns how many were
    /// removed. Used when the caller knows the value shape (for example,
    /// dropping all sessions bound to one identity).
    pub async fn invalidate_where(&self, pred: impl Fn(&str, &T) -> bool) -> usize {
        let removed = {
            let mut inner = self.entries.write().await;
            let mut stats = self.stats.write().await;
            let before = inner.map.len();
            inner.map.retain(|key, entry| !pred(key, &entry.value));
            let removed = before - inner.map.len();
            stats.deletes += removed as u64;
            removed
        };

        self.emit(CacheEvent::Invalidate {
            pattern: "<predicate>".to_string(),
            removed,
        });
        removed
    }

    /// Return the cached value for `key`, or run `fetch`, cache its result,
    /// and return it. A fetch failure propagates to the caller and is never
    /// cached, so the next call retries.
    pub async fn cached<F, Fut, E>(&self, key: &str, ttl: Option<Duration>, fetch: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }

        let value = fetch().await?;
        self.set(key, value.clone(), ttl).await;
        Ok(value)
    }

    /// Current number of entries (expired-but-unswept included).
    pub async fn size(&self) -> usize {
        self.entries.read().await.map.len()
    }

    /// Snapshot of the running counters.
    pub async fn stats(&self) -> CacheStats {
        let mut result = self.stats.read().await.clone();
        result.entries = self.entries.read().await.map.len() as u64;
        result.hit_rate = CacheStats::calculate_hit_rate(result.hits, result.misses);
        result
    }

    /// Purge expired entries. Normally driven by the sweeper; bounds memory
    /// even for keys that are never read again.
    pub async fn sweep_expired(&self) {
        let expired_keys = {
            let mut inner = self.entries.write().await;
            let mut stats = self.stats.write().await;

            let expired_keys: Vec<String> = inner
                .map
                .iter()
                .filter(|(_, entry)| entry.is_expired())
                .map(|(key, _)| key.clone())
                .collect();

            for key in &expired_keys {
                inner.map.remove(key);
                stats.expired += 1;
            }
            stats.entries = inner.map.len() as u64;
            expired_keys
        };

        for key in expired_keys {
            self.emit(CacheEvent::Expired { key });
        }
    }

    /// Spawn the background sweep task. It runs until `true` is observed on
    /// the shutdown channel (or the sender is dropped), so tests and process
    /// shutdown can stop it deterministically.
    pub fn spawn_sweeper(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cache.config.sweep_interval);
            // The first tick fires immediately; skip it so a fresh cache
            // isn't swept before anything is stored.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        cache.sweep_expired().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(cache = cache.config.name, "cache sweeper stopped");
        })
    }
}
