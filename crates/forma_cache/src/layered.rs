//! Memory cache backed by an optional write-through disk layer.

use std::collections::BTreeSet;
use std::path::Path;

use forma_config::{resolve_cache, CacheSettings};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::disk::DiskCache;
use crate::error::CacheError;
use crate::key::CacheKey;
use crate::memory::{MemoryCache, PutOptions};
use crate::pattern::KeyPattern;
use crate::stats::LayeredStats;

/// Two-level cache: a bounded [`MemoryCache`] in front of a [`DiskCache`].
///
/// Reads fall through to disk and promote hits into memory. Writes go to
/// memory first, then to disk. Without a disk layer this is a plain memory
/// cache.
#[derive(Debug)]
pub struct LayeredCache<V> {
    memory: MemoryCache<V>,
    disk: Option<DiskCache>,
}

impl<V> LayeredCache<V> {
    /// Combines a memory layer with an optional disk layer.
    pub fn new(memory: MemoryCache<V>, disk: Option<DiskCache>) -> Self {
        Self { memory, disk }
    }

    /// A cache with no disk layer.
    pub fn memory_only(memory: MemoryCache<V>) -> Self {
        Self::new(memory, None)
    }

    /// Builds the cache described by `[cache]` settings for a project.
    ///
    /// Opens (creating if needed) the disk directory when the disk layer is enabled.
    pub fn from_config(settings: &CacheSettings, project_root: &Path) -> Result<Self, CacheError> {
        let resolved = resolve_cache(settings, project_root);
        let memory = MemoryCache::new(resolved.max_size).with_default_ttl(resolved.default_ttl);
        let disk = resolved.disk_dir.map(DiskCache::open).transpose()?;
        Ok(Self::new(memory, disk))
    }

    /// The hot layer.
    pub fn memory(&self) -> &MemoryCache<V> {
        &self.memory
    }

    /// The disk layer, if enabled.
    pub fn disk(&self) -> Option<&DiskCache> {
        self.disk.as_ref()
    }

    /// Removes `key` from both layers. Returns `true` if either held it.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let in_memory = self.memory.invalidate(key);
        let on_disk = self.disk.as_ref().is_some_and(|d| d.invalidate(key));
        in_memory || on_disk
    }

    /// Removes every key satisfying `pred` from both layers.
    ///
    /// Returns the distinct removed keys, sorted.
    pub fn invalidate_where(&self, pred: impl Fn(&CacheKey) -> bool) -> Vec<CacheKey> {
        let mut removed: BTreeSet<CacheKey> = self.memory.invalidate_where(&pred).into_iter().collect();
        if let Some(disk) = &self.disk {
            removed.extend(disk.invalidate_where(&pred));
        }
        removed.into_iter().collect()
    }

    /// Removes every key matching `pattern` from both layers.
    pub fn invalidate_matching(&self, pattern: &KeyPattern) -> Vec<CacheKey> {
        self.invalidate_where(|key| pattern.matches(key))
    }

    /// Distinct keys held by either layer, sorted.
    pub fn keys(&self) -> Vec<CacheKey> {
        let mut keys: BTreeSet<CacheKey> = self.memory.keys().into_iter().collect();
        if let Some(disk) = &self.disk {
            keys.extend(disk.keys());
        }
        keys.into_iter().collect()
    }

    /// Clears both layers and resets their counters.
    ///
    /// Returns the number of distinct keys removed.
    pub fn clear(&self) -> usize {
        let keys = self.keys().len();
        self.memory.clear();
        if let Some(disk) = &self.disk {
            disk.clear();
        }
        keys
    }

    /// Clears only the memory layer; returns the number of entries dropped.
    pub fn clear_memory(&self) -> usize {
        self.memory.clear()
    }

    /// Memory-layer counters plus whether a disk layer is attached.
    pub fn stats(&self) -> LayeredStats {
        LayeredStats {
            memory: self.memory.stats(),
            disk_enabled: self.disk.is_some(),
        }
    }
}

impl<V: Clone + Serialize + DeserializeOwned> LayeredCache<V> {
    /// Looks `key` up in memory, then on disk.
    ///
    /// A disk hit is copied into memory, which may evict the memory layer's
    /// least recently used entry. The copy expires when the disk record does.
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        if let Some(value) = self.memory.get(key) {
            return Some(value);
        }
        let (value, remaining): (V, _) = self.disk.as_ref()?.get_with_ttl(key)?;
        tracing::debug!(key = %key, ?remaining, "promoted disk entry");
        self.memory
            .put(key.clone(), value.clone(), PutOptions { ttl: remaining });
        Some(value)
    }

    /// Writes through both layers.
    ///
    /// The memory write always happens; a failed disk write is returned.
    pub fn put(&self, key: CacheKey, value: V, opts: PutOptions) -> Result<(), CacheError> {
        match &self.disk {
            Some(disk) => {
                self.memory.put(key.clone(), value.clone(), opts);
                disk.put(&key, &value, opts)
            }
            None => {
                self.memory.put(key, value, opts);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forma_config::DiskSettings;
    use std::path::PathBuf;
    use std::time::Duration;

    fn layered(dir: &Path, max_size: usize) -> LayeredCache<String> {
        LayeredCache::new(
            MemoryCache::new(max_size),
            Some(DiskCache::open(dir).unwrap()),
        )
    }

    #[test]
    fn promotes_disk_hit_after_memory_clear() {
        let dir = tempfile::tempdir().unwrap();
        let cache = layered(dir.path(), 10);
        let key = CacheKey::page("home");
        cache.put(key.clone(), "<html/>".to_string(), PutOptions::default()).unwrap();

        assert_eq!(cache.clear_memory(), 1);
        assert!(!cache.memory().contains(&key));

        assert_eq!(cache.get(&key).as_deref(), Some("<html/>"));
        assert!(cache.memory().contains(&key));
        assert_eq!(cache.stats().memory.misses, 1);
    }

    #[test]
    fn roundtrip_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let key = CacheKey::token("color.primary");
        layered(dir.path(), 4)
            .put(key.clone(), "#ff0000".to_string(), PutOptions::default())
            .unwrap();

        let fresh = layered(dir.path(), 4);
        assert_eq!(fresh.get(&key).as_deref(), Some("#ff0000"));
    }

    #[test]
    fn double_miss_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = layered(dir.path(), 4);
        assert_eq!(cache.get(&CacheKey::page("nothing")), None);
    }

    #[test]
    fn memory_only_mode() {
        let cache: LayeredCache<u32> = LayeredCache::memory_only(MemoryCache::new(1));
        cache.put(CacheKey::page("a"), 1, PutOptions::default()).unwrap();
        cache.put(CacheKey::page("b"), 2, PutOptions::default()).unwrap();
        assert_eq!(cache.get(&CacheKey::page("a")), None);
        assert_eq!(cache.get(&CacheKey::page("b")), Some(2));
        let stats = cache.stats();
        assert!(!stats.disk_enabled);
        assert_eq!(stats.memory.evictions, 1);
    }

    #[test]
    fn memory_eviction_still_served_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cache = layered(dir.path(), 1);
        cache.put(CacheKey::page("a"), "A".to_string(), PutOptions::default()).unwrap();
        cache.put(CacheKey::page("b"), "B".to_string(), PutOptions::default()).unwrap();
        assert_eq!(cache.get(&CacheKey::page("a")).as_deref(), Some("A"));
    }

    #[test]
    fn promoted_entry_keeps_disk_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let cache = layered(dir.path(), 1);
        let key = CacheKey::page("a");
        cache
            .put(key.clone(), "A".to_string(), PutOptions::with_ttl(Duration::from_millis(50)))
            .unwrap();
        cache.put(CacheKey::page("b"), "B".to_string(), PutOptions::default()).unwrap();
        assert!(!cache.memory().contains(&key));

        assert_eq!(cache.get(&key).as_deref(), Some("A"));
        assert!(cache.memory().contains(&key));
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(cache.get(&key), None);
        assert!(!cache.memory().contains(&key));
    }

    #[test]
    fn invalidate_hits_both_layers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = layered(dir.path(), 4);
        let key = CacheKey::page("home");
        cache.put(key.clone(), "x".to_string(), PutOptions::default()).unwrap();
        assert!(cache.invalidate(&key));
        assert_eq!(cache.get(&key), None);
        assert!(!cache.invalidate(&key));
    }

    #[test]
    fn invalidate_matching_reports_distinct_keys() {
        let dir = tempfile::tempdir().unwrap();
        let cache = layered(dir.path(), 4);
        for id in ["home", "about"] {
            cache.put(CacheKey::page(id), id.to_string(), PutOptions::default()).unwrap();
        }
        cache.put(CacheKey::token("space.sm"), "4px".to_string(), PutOptions::default()).unwrap();

        let removed = cache.invalidate_matching(&KeyPattern::of_kind(forma_common::NodeKind::Page));
        assert_eq!(removed, vec![CacheKey::page("about"), CacheKey::page("home")]);
        assert_eq!(cache.keys(), vec![CacheKey::token("space.sm")]);
    }

    #[test]
    fn clear_twice() {
        let dir = tempfile::tempdir().unwrap();
        let cache = layered(dir.path(), 4);
        cache.put(CacheKey::page("a"), "1".to_string(), PutOptions::default()).unwrap();
        cache.put(CacheKey::page("b"), "2".to_string(), PutOptions::default()).unwrap();

        assert_eq!(cache.clear(), 2);
        assert_eq!(cache.stats().memory.size, 0);
        assert_eq!(cache.clear(), 0);
        assert_eq!(cache.stats().memory.size, 0);
        assert!(cache.disk().unwrap().is_empty());
    }

    #[test]
    fn from_config_resolves_disk_dir() {
        let dir = tempfile::tempdir().unwrap();
        let settings = CacheSettings {
            max_size: 8,
            default_ttl_ms: None,
            disk: DiskSettings {
                enabled: true,
                dir: PathBuf::from("cache"),
            },
        };
        let cache: LayeredCache<String> = LayeredCache::from_config(&settings, dir.path()).unwrap();
        assert_eq!(cache.memory().max_size(), 8);
        assert_eq!(cache.disk().unwrap().root(), dir.path().join("cache"));
        assert!(dir.path().join("cache").is_dir());
    }

    #[test]
    fn from_config_without_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = CacheSettings::default();
        settings.disk.enabled = false;
        let cache: LayeredCache<String> = LayeredCache::from_config(&settings, dir.path()).unwrap();
        assert!(cache.disk().is_none());
        assert!(!cache.stats().disk_enabled);
    }
}
