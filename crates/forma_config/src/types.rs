//! Configuration types deserialized from `forma.toml`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// The top-level configuration parsed from `forma.toml`.
///
/// Every section is optional; a missing section takes its defaults.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct FormaConfig {
    /// Layered cache settings (memory bound, TTL, disk layer).
    #[serde(default)]
    pub cache: CacheSettings,
    /// Incremental build settings (parallelism, in-flight policy).
    #[serde(default)]
    pub build: BuildSettings,
    /// Change watcher settings (poll interval, channel bound).
    #[serde(default)]
    pub watch: WatchSettings,
}

/// Settings for the hot memory layer and the cold disk layer.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CacheSettings {
    /// Maximum number of entries held in memory before LRU eviction.
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// TTL applied to memory entries stored without an explicit one.
    #[serde(default)]
    pub default_ttl_ms: Option<u64>,
    /// The disk layer.
    #[serde(default)]
    pub disk: DiskSettings,
}

/// Settings for the write-through disk layer.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DiskSettings {
    /// Whether compiled artifacts are also persisted to disk.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Cache directory, relative paths resolve against the project root.
    #[serde(default = "default_disk_dir")]
    pub dir: PathBuf,
}

/// Settings for incremental compilation passes.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BuildSettings {
    /// Compile independent pages of one wave concurrently.
    #[serde(default)]
    pub parallel: bool,
    /// What a request does when the page it wants is being compiled elsewhere.
    #[serde(default)]
    pub in_flight: InFlightMode,
    /// Upper bound on how long a waiting request blocks.
    #[serde(default = "default_in_flight_timeout_ms")]
    pub in_flight_timeout_ms: u64,
    /// Age after which an in-progress node counts as abandoned.
    #[serde(default = "default_stale_in_progress_ms")]
    pub stale_in_progress_ms: u64,
}

/// Behavior when a requested page is already being compiled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InFlightMode {
    /// Block until the other compilation finishes, then serve its result.
    #[default]
    Wait,
    /// Serve the previously cached artifact immediately when there is one.
    ServeStale,
}

/// Settings for the polling change watcher.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WatchSettings {
    /// Delay between two fingerprint sweeps over the tracked files.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Capacity of the bounded change channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl CacheSettings {
    /// The default TTL as a [`Duration`], if one is configured.
    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl_ms.map(Duration::from_millis)
    }
}

impl BuildSettings {
    /// The in-flight wait bound as a [`Duration`].
    pub fn in_flight_timeout(&self) -> Duration {
        Duration::from_millis(self.in_flight_timeout_ms)
    }

    /// The abandoned-node threshold as a [`Duration`].
    pub fn stale_in_progress(&self) -> Duration {
        Duration::from_millis(self.stale_in_progress_ms)
    }
}

impl WatchSettings {
    /// The poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            default_ttl_ms: None,
            disk: DiskSettings::default(),
        }
    }
}

impl Default for DiskSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_disk_dir(),
        }
    }
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            parallel: false,
            in_flight: InFlightMode::Wait,
            in_flight_timeout_ms: default_in_flight_timeout_ms(),
            stale_in_progress_ms: default_stale_in_progress_ms(),
        }
    }
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_max_size() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

fn default_disk_dir() -> PathBuf {
    PathBuf::from(".forma-cache")
}

fn default_in_flight_timeout_ms() -> u64 {
    30_000
}

fn default_stale_in_progress_ms() -> u64 {
    300_000
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_channel_capacity() -> usize {
    16
}
