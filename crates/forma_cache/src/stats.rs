//! Cache statistics snapshots.

use serde::{Deserialize, Serialize};

/// Counters scoped to one cache instance.
///
/// `hits`, `misses` and `evictions` only grow until the cache is cleared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of live entries.
    pub size: usize,
    /// Lookups that returned a value.
    pub hits: u64,
    /// Lookups that found nothing or an expired entry.
    pub misses: u64,
    /// Entries dropped to make room under the size bound.
    pub evictions: u64,
}

impl CacheStats {
    /// Fraction of lookups that hit, `0.0` before the first lookup.
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

/// Statistics of a [`LayeredCache`](crate::LayeredCache).
///
/// Only the memory layer is counted; the disk layer is a write-through
/// backing store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayeredStats {
    /// Counters of the memory layer.
    pub memory: CacheStats,
    /// Whether a disk layer is attached.
    pub disk_enabled: bool,
}
