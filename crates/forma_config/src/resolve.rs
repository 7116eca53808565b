//! Resolution of configured paths and durations against a project root.

use crate::types::CacheSettings;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Cache settings with the disk directory made absolute relative to the project.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCache {
    /// Maximum number of in-memory entries.
    pub max_size: usize,
    /// Default TTL for memory entries.
    pub default_ttl: Option<Duration>,
    /// Disk layer directory, `None` when the disk layer is disabled.
    pub disk_dir: Option<PathBuf>,
}

/// Resolves cache settings for a project rooted at `project_root`.
///
/// A relative `cache.disk.dir` is joined onto the root; an absolute one is
/// used as is.
pub fn resolve_cache(settings: &CacheSettings, project_root: &Path) -> ResolvedCache {
    let disk_dir = settings.disk.enabled.then(|| {
        if settings.disk.dir.is_absolute() {
            settings.disk.dir.clone()
        } else {
            project_root.join(&settings.disk.dir)
        }
    });
    ResolvedCache {
        max_size: settings.max_size,
        default_ttl: settings.default_ttl(),
        disk_dir,
    }
}
