//! File fingerprinting and path normalization.

use std::io::ErrorKind;
use std::path::{Component, Path};

use forma_common::Fingerprint;

/// Computes the content fingerprint of a file.
///
/// Returns `None` when the path does not exist or cannot be read; callers treat
/// that as "changed". Implemented for any `Fn(&Path) -> Option<Fingerprint>`,
/// so tests can inject an in-memory file system.
pub trait Fingerprinter: Send + Sync {
    /// Fingerprints the file at `path`.
    fn fingerprint(&self, path: &Path) -> Option<Fingerprint>;
}

impl<F> Fingerprinter for F
where
    F: Fn(&Path) -> Option<Fingerprint> + Send + Sync,
{
    fn fingerprint(&self, path: &Path) -> Option<Fingerprint> {
        self(path)
    }
}

/// Hashes the file's bytes with XXH3-128.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentFingerprinter;

impl Fingerprinter for ContentFingerprinter {
    fn fingerprint(&self, path: &Path) -> Option<Fingerprint> {
        match std::fs::read(path) {
            Ok(content) => Some(Fingerprint::of_bytes(&content)),
            Err(e) => {
                if e.kind() != ErrorKind::NotFound {
                    tracing::debug!(path = %path.display(), error = %e, "could not read file for fingerprinting");
                }
                None
            }
        }
    }
}

/// Turns a path into a graph id: forward slashes, no `.` components.
///
/// `..` is kept as written; resolving it would need the file system.
pub fn normalize_path(path: &Path) -> String {
    let mut out = String::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::RootDir => out.push('/'),
            Component::Prefix(prefix) => out.push_str(&prefix.as_os_str().to_string_lossy()),
            Component::ParentDir => push_segment(&mut out, ".."),
            Component::Normal(segment) => {
                push_segment(&mut out, &segment.to_string_lossy().replace('\\', "/"))
            }
        }
    }
    if out.is_empty() {
        out.push('.');
    }
    out
}

fn push_segment(out: &mut String, segment: &str) {
    if !out.is_empty() && !out.ends_with('/') {
        out.push('/');
    }
    out.push_str(segment);
}
