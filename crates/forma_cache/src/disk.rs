//! Durable one-file-per-entry cache.
//!
//! Each entry lives at `<root>/<stem>.entry`, where the stem is a
//! filesystem-safe encoding of the key. The directory listing is the only
//! index, so a fresh instance opened on an existing directory sees every
//! entry written by earlier processes.
//!
//! Entry files start with a 4-byte little-endian header length, followed by a
//! bincode [`RecordHeader`] (magic bytes, format version, payload checksum)
//! and the bincode payload. Writes land in a hidden temp file that is renamed
//! into place.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use forma_common::Fingerprint;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::key::{CacheKey, DecodedStem};
use crate::memory::PutOptions;
use crate::pattern::KeyPattern;
use crate::stats::CacheStats;

/// Magic bytes identifying a forma cache entry.
const RECORD_MAGIC: [u8; 4] = *b"FRMA";

/// Current entry format version. Increment on breaking changes to
/// the header or payload layout.
const RECORD_FORMAT_VERSION: u32 = 1;

/// File extension of entry files.
const ENTRY_EXT: &str = "entry";

/// Header prepended to every entry file for validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordHeader {
    /// Magic bytes: must be `b"FRMA"`.
    pub magic: [u8; 4],

    /// Entry format version.
    pub format_version: u32,

    /// Fingerprint of the payload bytes.
    pub checksum: Fingerprint,
}

/// Payload layout on the write side. Field order must match [`Record`].
#[derive(Serialize)]
struct RecordRef<'a, V> {
    key: &'a CacheKey,
    stored_at_ms: u64,
    ttl_ms: Option<u64>,
    value: &'a V,
}

#[derive(Deserialize)]
struct Record<V> {
    key: CacheKey,
    stored_at_ms: u64,
    ttl_ms: Option<u64>,
    value: V,
}

/// Leading field of every payload, decodable without knowing the value type.
#[derive(Deserialize)]
struct RecordKey {
    key: CacheKey,
}

impl<V> Record<V> {
    fn is_expired(&self, now_ms: u64) -> bool {
        self.ttl_ms
            .is_some_and(|ttl| now_ms.saturating_sub(self.stored_at_ms) >= ttl)
    }

    fn remaining_ttl(&self, now_ms: u64) -> Option<Duration> {
        let age = now_ms.saturating_sub(self.stored_at_ms);
        self.ttl_ms
            .map(|ttl| Duration::from_millis(ttl.saturating_sub(age)))
    }
}

/// Unbounded cache persisted as files under a root directory.
///
/// Values are (de)serialized per call, so one directory can be read with any
/// value type that matches what was written. Unreadable entries are misses.
#[derive(Debug)]
pub struct DiskCache {
    root: PathBuf,
    hits: AtomicU64,
    misses: AtomicU64,
    write_seq: AtomicU64,
}

impl DiskCache {
    /// Opens (creating if needed) a cache rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| CacheError::Io {
            path: root.clone(),
            source: e,
        })?;
        Ok(Self {
            root,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            write_seq: AtomicU64::new(0),
        })
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the file path of the entry for `key`.
    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(format!("{}.{ENTRY_EXT}", key.file_stem()))
    }

    /// Writes `value` under `key`, replacing any previous entry.
    ///
    /// Only an explicit `opts.ttl` is persisted; disk entries have no default TTL.
    pub fn put<V: Serialize>(
        &self,
        key: &CacheKey,
        value: &V,
        opts: PutOptions,
    ) -> Result<(), CacheError> {
        let record = RecordRef {
            key,
            stored_at_ms: now_ms(),
            ttl_ms: opts
                .ttl
                .map(|ttl| u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)),
            value,
        };
        let payload = bincode::serde::encode_to_vec(&record, bincode::config::standard())
            .map_err(|e| CacheError::Serialization {
                reason: e.to_string(),
            })?;
        let bytes = encode_envelope(&payload)?;

        let path = self.entry_path(key);
        let tmp = self.temp_path(key);
        fs::write(&tmp, &bytes).map_err(|e| CacheError::Io {
            path: tmp.clone(),
            source: e,
        })?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(CacheError::Io { path, source: e });
        }
        Ok(())
    }

    /// Reads the value stored under `key`.
    ///
    /// Missing, corrupt, expired and foreign-key entries are all misses;
    /// anything other than a plain absence is logged.
    pub fn get<V: DeserializeOwned>(&self, key: &CacheKey) -> Option<V> {
        self.get_with_ttl(key).map(|(value, _)| value)
    }

    /// Like [`get`](Self::get), also returning how long the entry has left
    /// to live. `None` means the entry was stored without a TTL.
    pub fn get_with_ttl<V: DeserializeOwned>(&self, key: &CacheKey) -> Option<(V, Option<Duration>)> {
        let path = self.entry_path(key);
        let now = now_ms();
        let found = match read_record::<V>(&path) {
            Ok(Some(record)) if record.key != *key => {
                let err = CacheError::KeyMismatch {
                    path: path.clone(),
                    expected: key.to_string(),
                    actual: record.key.to_string(),
                };
                tracing::warn!(error = %err, "ignoring cache entry");
                None
            }
            Ok(Some(record)) if record.is_expired(now) => {
                tracing::debug!(key = %key, "dropped expired disk entry");
                remove_entry_file(&path);
                None
            }
            Ok(Some(record)) => {
                let remaining = record.remaining_ttl(now);
                Some((record.value, remaining))
            }
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(error = %err, "ignoring unreadable cache entry");
                None
            }
        };
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Returns `true` if an entry file exists for `key`. Does not validate it.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entry_path(key).is_file()
    }

    /// Deletes the entry for `key`. Returns `false` if there was none.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        remove_entry_file(&self.entry_path(key))
    }

    /// Deletes every entry whose key satisfies `pred`; returns the deleted keys, sorted.
    pub fn invalidate_where(&self, pred: impl Fn(&CacheKey) -> bool) -> Vec<CacheKey> {
        let mut removed: Vec<CacheKey> = self
            .listed_entries()
            .into_iter()
            .filter(|(key, _)| pred(key))
            .filter(|(_, path)| remove_entry_file(path))
            .map(|(key, _)| key)
            .collect();
        removed.sort();
        removed
    }

    /// Deletes every entry matching `pattern`; returns the deleted keys, sorted.
    pub fn invalidate_matching(&self, pattern: &KeyPattern) -> Vec<CacheKey> {
        self.invalidate_where(|key| pattern.matches(key))
    }

    /// Keys of all entries on disk, sorted. Undecodable file names are skipped.
    pub fn keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self
            .listed_entries()
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        keys.sort();
        keys
    }

    /// Number of entry files.
    pub fn len(&self) -> usize {
        self.entry_files().len()
    }

    /// Returns `true` if there are no entry files.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deletes every file directly under the root and resets the counters.
    ///
    /// Returns the number of files deleted. Files that cannot be deleted are
    /// logged and skipped.
    pub fn clear(&self) -> usize {
        let mut removed = 0;
        for path in self.files() {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "could not delete cache file");
                }
            }
        }
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        removed
    }

    /// Current counters. `evictions` is always zero; the disk layer is unbounded.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: 0,
        }
    }

    fn temp_path(&self, key: &CacheKey) -> PathBuf {
        let seq = self.write_seq.fetch_add(1, Ordering::Relaxed);
        self.root.join(format!(
            ".{}.{}.{seq}.tmp",
            key.file_stem(),
            std::process::id()
        ))
    }

    /// Every regular file directly under the root.
    fn files(&self) -> Vec<PathBuf> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != ErrorKind::NotFound {
                    tracing::warn!(root = %self.root.display(), error = %e, "could not list cache directory");
                }
                return Vec::new();
            }
        };
        entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect()
    }

    /// Entry files, excluding temp files and foreign files.
    fn entry_files(&self) -> Vec<PathBuf> {
        self.files()
            .into_iter()
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some(ENTRY_EXT))
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| !n.starts_with('.'))
            })
            .collect()
    }

    /// Entry files paired with their keys.
    fn listed_entries(&self) -> Vec<(CacheKey, PathBuf)> {
        self.entry_files()
            .into_iter()
            .filter_map(|path| {
                let stem = path.file_stem()?.to_str()?;
                let key = match CacheKey::decode_file_stem(stem) {
                    Ok(DecodedStem::Key(key)) => key,
                    Ok(DecodedStem::Hashed) => match read_key(&path) {
                        Ok(key) => key,
                        Err(err) => {
                            tracing::warn!(error = %err, "skipping unreadable cache entry");
                            return None;
                        }
                    },
                    Err(err) => {
                        tracing::debug!(error = %err, "skipping foreign file in cache directory");
                        return None;
                    }
                };
                Some((key, path))
            })
            .collect()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

fn remove_entry_file(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "could not delete cache entry");
            false
        }
    }
}

/// Wraps a payload with its length-prefixed, checksummed header.
fn encode_envelope(payload: &[u8]) -> Result<Vec<u8>, CacheError> {
    let header = RecordHeader {
        magic: RECORD_MAGIC,
        format_version: RECORD_FORMAT_VERSION,
        checksum: Fingerprint::of_bytes(payload),
    };
    let header_bytes = bincode::serde::encode_to_vec(&header, bincode::config::standard())
        .map_err(|e| CacheError::Serialization {
            reason: e.to_string(),
        })?;

    let header_len = header_bytes.len() as u32;
    let mut output = Vec::with_capacity(4 + header_bytes.len() + payload.len());
    output.extend_from_slice(&header_len.to_le_bytes());
    output.extend_from_slice(&header_bytes);
    output.extend_from_slice(payload);
    Ok(output)
}

/// Validates the header of an entry file and returns its payload.
fn decode_envelope<'a>(path: &Path, raw: &'a [u8]) -> Result<&'a [u8], CacheError> {
    let invalid = |reason: &str| CacheError::InvalidRecord {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    let len_bytes: [u8; 4] = raw
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| invalid("truncated header length"))?;
    let header_len = u32::from_le_bytes(len_bytes) as usize;
    let header_bytes = raw
        .get(4..4 + header_len)
        .ok_or_else(|| invalid("truncated header"))?;

    let (header, _): (RecordHeader, usize) =
        bincode::serde::decode_from_slice(header_bytes, bincode::config::standard())
            .map_err(|e| invalid(&format!("undecodable header: {e}")))?;

    if header.magic != RECORD_MAGIC {
        return Err(invalid("missing magic bytes"));
    }
    if header.format_version != RECORD_FORMAT_VERSION {
        return Err(CacheError::VersionMismatch {
            path: path.to_path_buf(),
            expected: RECORD_FORMAT_VERSION,
            actual: header.format_version,
        });
    }

    let payload = &raw[4 + header_len..];
    let actual = Fingerprint::of_bytes(payload);
    if actual != header.checksum {
        return Err(CacheError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected: header.checksum.to_hex(),
            actual: actual.to_hex(),
        });
    }
    Ok(payload)
}

fn read_payload(path: &Path) -> Result<Option<Vec<u8>>, CacheError> {
    match fs::read(path) {
        Ok(raw) => Ok(Some(decode_envelope(path, &raw)?.to_vec())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CacheError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

fn read_record<V: DeserializeOwned>(path: &Path) -> Result<Option<Record<V>>, CacheError> {
    let Some(payload) = read_payload(path)? else {
        return Ok(None);
    };
    let (record, _) = bincode::serde::decode_from_slice(&payload, bincode::config::standard())
        .map_err(|e| CacheError::InvalidRecord {
            path: path.to_path_buf(),
            reason: format!("undecodable payload: {e}"),
        })?;
    Ok(Some(record))
}

fn read_key(path: &Path) -> Result<CacheKey, CacheError> {
    let payload = read_payload(path)?.ok_or_else(|| CacheError::InvalidRecord {
        path: path.to_path_buf(),
        reason: "entry vanished while listing".to_string(),
    })?;
    let (record, _): (RecordKey, usize) =
        bincode::serde::decode_from_slice(&payload, bincode::config::standard()).map_err(
            |e| CacheError::InvalidRecord {
                path: path.to_path_buf(),
                reason: format!("undecodable key: {e}"),
            },
        )?;
    Ok(record.key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_cache() -> (tempfile::TempDir, DiskCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(dir.path()).unwrap();
        (dir, cache)
    }

    /// Writes an entry with a hand-built header around a valid payload.
    fn write_with_header(cache: &DiskCache, key: &CacheKey, header: RecordHeader, payload: &[u8]) {
        let header_bytes =
            bincode::serde::encode_to_vec(&header, bincode::config::standard()).unwrap();
        let mut output = Vec::new();
        output.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
        output.extend_from_slice(&header_bytes);
        output.extend_from_slice(payload);
        fs::write(cache.entry_path(key), output).unwrap();
    }

    fn valid_payload(key: &CacheKey, value: &str) -> Vec<u8> {
        let record = RecordRef {
            key,
            stored_at_ms: now_ms(),
            ttl_ms: None,
            value: &value.to_string(),
        };
        bincode::serde::encode_to_vec(&record, bincode::config::standard()).unwrap()
    }

    #[test]
    fn put_get_roundtrip() {
        let (_dir, cache) = make_cache();
        let key = CacheKey::page("home").with_variant("html");
        cache
            .put(&key, &"<div>home</div>".to_string(), PutOptions::default())
            .unwrap();
        assert_eq!(
            cache.get::<String>(&key).as_deref(),
            Some("<div>home</div>")
        );
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn missing_entry_is_miss() {
        let (_dir, cache) = make_cache();
        assert_eq!(cache.get::<String>(&CacheKey::page("nope")), None);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn entries_survive_a_fresh_instance() {
        let dir = tempfile::tempdir().unwrap();
        let key = CacheKey::page("about");
        {
            let a = DiskCache::open(dir.path()).unwrap();
            a.put(&key, &vec![1u8, 2, 3], PutOptions::default()).unwrap();
        }
        let b = DiskCache::open(dir.path()).unwrap();
        assert_eq!(b.get::<Vec<u8>>(&key), Some(vec![1, 2, 3]));
        assert_eq!(b.keys(), vec![key]);
    }

    #[test]
    fn garbage_file_is_miss() {
        let (_dir, cache) = make_cache();
        let key = CacheKey::page("corrupt");
        fs::write(cache.entry_path(&key), b"garbage data").unwrap();
        assert_eq!(cache.get::<String>(&key), None);
    }

    #[test]
    fn truncated_header_is_miss() {
        let (_dir, cache) = make_cache();
        let key = CacheKey::page("short");
        fs::write(cache.entry_path(&key), b"AB").unwrap();
        assert_eq!(cache.get::<String>(&key), None);
    }

    #[test]
    fn wrong_magic_is_miss() {
        let (_dir, cache) = make_cache();
        let key = CacheKey::page("magic");
        let payload = valid_payload(&key, "v");
        let header = RecordHeader {
            magic: *b"BAAD",
            format_version: RECORD_FORMAT_VERSION,
            checksum: Fingerprint::of_bytes(&payload),
        };
        write_with_header(&cache, &key, header, &payload);
        assert_eq!(cache.get::<String>(&key), None);
    }

    #[test]
    fn wrong_version_is_miss() {
        let (_dir, cache) = make_cache();
        let key = CacheKey::page("old");
        let payload = valid_payload(&key, "v");
        let header = RecordHeader {
            magic: RECORD_MAGIC,
            format_version: 999,
            checksum: Fingerprint::of_bytes(&payload),
        };
        write_with_header(&cache, &key, header, &payload);
        assert_eq!(cache.get::<String>(&key), None);

        let raw = fs::read(cache.entry_path(&key)).unwrap();
        let err = decode_envelope(&cache.entry_path(&key), &raw).unwrap_err();
        assert!(matches!(err, CacheError::VersionMismatch { actual: 999, .. }));
    }

    #[test]
    fn checksum_mismatch_is_miss() {
        let (_dir, cache) = make_cache();
        let key = CacheKey::page("tampered");
        let payload = valid_payload(&key, "v");
        let header = RecordHeader {
            magic: RECORD_MAGIC,
            format_version: RECORD_FORMAT_VERSION,
            checksum: Fingerprint::of_bytes(b"something else"),
        };
        write_with_header(&cache, &key, header, &payload);
        assert_eq!(cache.get::<String>(&key), None);
    }

    #[test]
    fn value_type_mismatch_is_miss() {
        let (_dir, cache) = make_cache();
        let key = CacheKey::page("typed");
        cache.put(&key, &7u64, PutOptions::default()).unwrap();
        assert_eq!(cache.get::<Vec<String>>(&key), None);
    }

    #[test]
    fn record_for_other_key_is_miss() {
        let (_dir, cache) = make_cache();
        let a = CacheKey::page("a");
        let b = CacheKey::page("b");
        cache.put(&a, &"A".to_string(), PutOptions::default()).unwrap();
        fs::copy(cache.entry_path(&a), cache.entry_path(&b)).unwrap();
        assert_eq!(cache.get::<String>(&b), None);
        assert_eq!(cache.get::<String>(&a).as_deref(), Some("A"));
    }

    #[test]
    fn explicit_ttl_expires_on_disk() {
        let (_dir, cache) = make_cache();
        let key = CacheKey::token("color.primary");
        cache
            .put(&key, &"#f00".to_string(), PutOptions::with_ttl(Duration::from_millis(30)))
            .unwrap();
        assert!(cache.get::<String>(&key).is_some());
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(cache.get::<String>(&key), None);
        assert!(!cache.contains(&key));
    }

    #[test]
    fn get_with_ttl_reports_remaining_lifetime() {
        let (_dir, cache) = make_cache();
        let timed = CacheKey::page("timed");
        let forever = CacheKey::page("forever");
        cache
            .put(&timed, &1u32, PutOptions::with_ttl(Duration::from_secs(60)))
            .unwrap();
        cache.put(&forever, &2u32, PutOptions::default()).unwrap();

        let (value, remaining) = cache.get_with_ttl::<u32>(&timed).unwrap();
        assert_eq!(value, 1);
        let remaining = remaining.unwrap();
        assert!(remaining <= Duration::from_secs(60));
        assert!(remaining > Duration::from_secs(50));
        assert_eq!(cache.get_with_ttl::<u32>(&forever), Some((2, None)));
    }

    #[test]
    fn oversized_ttl_saturates() {
        let (_dir, cache) = make_cache();
        let key = CacheKey::page("home");
        cache
            .put(&key, &"x".to_string(), PutOptions::with_ttl(Duration::MAX))
            .unwrap();
        assert_eq!(cache.get::<String>(&key).as_deref(), Some("x"));
    }

    #[test]
    fn put_leaves_no_temp_files() {
        let (dir, cache) = make_cache();
        for i in 0..5 {
            cache
                .put(&CacheKey::page(format!("p{i}")), &i, PutOptions::default())
                .unwrap();
        }
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 5);
        assert!(names.iter().all(|n| n.ends_with(".entry")));
    }

    #[test]
    fn keys_recover_hashed_stems() {
        let (_dir, cache) = make_cache();
        let long = CacheKey::file(format!("src/{}/page.clj", "deep/".repeat(60)));
        let short = CacheKey::page("home");
        cache.put(&long, &1u32, PutOptions::default()).unwrap();
        cache.put(&short, &2u32, PutOptions::default()).unwrap();

        let mut expected = vec![long.clone(), short];
        expected.sort();
        assert_eq!(cache.keys(), expected);
        assert_eq!(cache.get::<u32>(&long), Some(1));
    }

    #[test]
    fn invalidate_and_invalidate_matching() {
        let (_dir, cache) = make_cache();
        let home = CacheKey::page("home");
        let about = CacheKey::page("about");
        let token = CacheKey::token("space.sm");
        for key in [&home, &about, &token] {
            cache.put(key, &0u8, PutOptions::default()).unwrap();
        }

        assert!(cache.invalidate(&home));
        assert!(!cache.invalidate(&home));

        let removed = cache.invalidate_matching(&KeyPattern::parse("token:"));
        assert_eq!(removed, vec![token]);
        assert_eq!(cache.keys(), vec![about]);
    }

    #[test]
    fn clear_removes_every_file_and_resets_counters() {
        let (dir, cache) = make_cache();
        cache.put(&CacheKey::page("a"), &1u8, PutOptions::default()).unwrap();
        cache.put(&CacheKey::page("b"), &2u8, PutOptions::default()).unwrap();
        fs::write(dir.path().join("stray.txt"), b"x").unwrap();
        cache.get::<u8>(&CacheKey::page("a"));

        assert_eq!(cache.clear(), 3);
        assert_eq!(cache.stats(), CacheStats::default());
        assert_eq!(cache.clear(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn foreign_files_are_not_keys() {
        let (dir, cache) = make_cache();
        fs::write(dir.path().join("widget+x.entry"), b"x").unwrap();
        fs::write(dir.path().join("README"), b"x").unwrap();
        assert!(cache.keys().is_empty());
    }
}
