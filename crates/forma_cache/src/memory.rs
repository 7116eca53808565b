//! Bounded in-memory cache with LRU eviction and lazy TTL expiry.
//!
//! Recency is tracked with a monotonically increasing access tick rather than
//! wall-clock time, so two accesses within the same clock tick still have a
//! strict order. TTLs are measured against [`Instant`] from insertion.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use forma_common::StateCell;

use crate::key::CacheKey;
use crate::pattern::KeyPattern;
use crate::stats::CacheStats;

/// Per-entry options for `put`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PutOptions {
    /// Time after insertion at which the entry stops being served.
    /// `None` falls back to the cache's default TTL.
    pub ttl: Option<Duration>,
}

impl PutOptions {
    /// Options with an explicit TTL.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { ttl: Some(ttl) }
    }
}

/// A cached value with its bookkeeping. Never handed out; values are cloned.
#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    last_accessed: u64,
    ttl: Option<Duration>,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.ttl
            .is_some_and(|ttl| now.saturating_duration_since(self.inserted_at) >= ttl)
    }
}

#[derive(Debug)]
struct MemoryState<V> {
    entries: HashMap<CacheKey, CacheEntry<V>>,
    /// Access tick -> key, oldest first.
    recency: BTreeMap<u64, CacheKey>,
    clock: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<V> MemoryState<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            clock: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn remove(&mut self, key: &CacheKey) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.recency.remove(&entry.last_accessed);
                true
            }
            None => false,
        }
    }

    fn evict_least_recent(&mut self) -> Option<CacheKey> {
        let (_, victim) = self.recency.pop_first()?;
        self.entries.remove(&victim);
        self.evictions += 1;
        Some(victim)
    }
}

/// Bounded key-value store; the hot layer of [`LayeredCache`](crate::LayeredCache).
///
/// Inserting a new key at capacity evicts exactly one entry, the one whose
/// last access is oldest. A successful `get` counts as an access. Expired
/// entries are dropped when a lookup finds them, there is no sweeper thread.
#[derive(Debug)]
pub struct MemoryCache<V> {
    max_size: usize,
    default_ttl: Option<Duration>,
    state: StateCell<MemoryState<V>>,
}

impl<V> MemoryCache<V> {
    /// Creates a cache holding at most `max_size` entries (minimum 1).
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            default_ttl: None,
            state: StateCell::new(MemoryState::new()),
        }
    }

    /// Sets the TTL applied to entries stored without one.
    pub fn with_default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// The size bound.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// Returns the key evicted to make room, if any.
    pub fn put(&self, key: CacheKey, value: V, opts: PutOptions) -> Option<CacheKey> {
        let ttl = opts.ttl.or(self.default_ttl);
        let max_size = self.max_size;
        let evicted = self.state.update(|s| {
            let mut evicted = None;
            if let Some(old) = s.entries.get(&key) {
                let old_tick = old.last_accessed;
                s.recency.remove(&old_tick);
            } else if s.entries.len() >= max_size {
                evicted = s.evict_least_recent();
            }
            let tick = s.next_tick();
            s.recency.insert(tick, key.clone());
            s.entries.insert(
                key,
                CacheEntry {
                    value,
                    inserted_at: Instant::now(),
                    last_accessed: tick,
                    ttl,
                },
            );
            evicted
        });
        if let Some(victim) = &evicted {
            tracing::debug!(key = %victim, "evicted least recently used entry");
        }
        evicted
    }

    /// Removes one entry. Returns `false` if the key was absent.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.state.update(|s| s.remove(key))
    }

    /// Removes every entry whose key satisfies `pred`; returns the removed keys, sorted.
    pub fn invalidate_where(&self, pred: impl Fn(&CacheKey) -> bool) -> Vec<CacheKey> {
        let mut removed = self.state.update(|s| {
            let doomed: Vec<CacheKey> = s.entries.keys().filter(|&k| pred(k)).cloned().collect();
            for key in &doomed {
                s.remove(key);
            }
            doomed
        });
        removed.sort();
        removed
    }

    /// Removes every entry matching `pattern`; returns the removed keys, sorted.
    pub fn invalidate_matching(&self, pattern: &KeyPattern) -> Vec<CacheKey> {
        self.invalidate_where(|key| pattern.matches(key))
    }

    /// Drops all expired entries now instead of on their next lookup.
    ///
    /// Returns how many were dropped. Expired entries removed here are not
    /// counted as misses or evictions.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        self.state.update(|s| {
            let expired: Vec<CacheKey> = s
                .entries
                .iter()
                .filter(|(_, e)| e.is_expired(now))
                .map(|(k, _)| k.clone())
                .collect();
            for key in &expired {
                s.remove(key);
            }
            expired.len()
        })
    }

    /// Returns `true` if a live entry exists. Does not count as an access.
    pub fn contains(&self, key: &CacheKey) -> bool {
        let now = Instant::now();
        self.state
            .read(|s| s.entries.get(key).is_some_and(|e| !e.is_expired(now)))
    }

    /// Live keys, sorted.
    pub fn keys(&self) -> Vec<CacheKey> {
        let now = Instant::now();
        let mut keys: Vec<CacheKey> = self.state.read(|s| {
            s.entries
                .iter()
                .filter(|(_, e)| !e.is_expired(now))
                .map(|(k, _)| k.clone())
                .collect()
        });
        keys.sort();
        keys
    }

    /// Number of stored entries, including expired ones not yet looked up.
    pub fn len(&self) -> usize {
        self.state.read(|s| s.entries.len())
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every entry and resets all counters. Returns how many entries were removed.
    pub fn clear(&self) -> usize {
        self.state.update(|s| {
            let removed = s.entries.len();
            *s = MemoryState::new();
            removed
        })
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        self.state.read(|s| CacheStats {
            size: s.entries.len(),
            hits: s.hits,
            misses: s.misses,
            evictions: s.evictions,
        })
    }
}

impl<V: Clone> MemoryCache<V> {
    /// Looks up `key`, re-ranking it as most recently used on a hit.
    ///
    /// An entry past its TTL is removed and reported as a miss.
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let now = Instant::now();
        let (value, expired) = self.state.update(|s| {
            let expired = match s.entries.get(key) {
                None => {
                    s.misses += 1;
                    return (None, false);
                }
                Some(entry) => entry.is_expired(now),
            };
            if expired {
                s.remove(key);
                s.misses += 1;
                return (None, true);
            }
            let tick = s.next_tick();
            let Some(entry) = s.entries.get_mut(key) else {
                return (None, false);
            };
            let previous = std::mem::replace(&mut entry.last_accessed, tick);
            let value = entry.value.clone();
            s.recency.remove(&previous);
            s.recency.insert(tick, key.clone());
            s.hits += 1;
            (Some(value), false)
        });
        if expired {
            tracing::debug!(key = %key, "dropped expired entry");
        }
        value
    }
}
