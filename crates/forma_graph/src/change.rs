//! Change classification for tracked files.

/// Result of comparing current file fingerprints against the graph.
///
/// Entries are normalized file ids, each list sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Files that exist but are not tracked yet.
    pub new_files: Vec<String>,

    /// Tracked files whose fingerprint differs from the recorded one.
    pub modified_files: Vec<String>,

    /// Tracked files that no longer exist.
    pub deleted_files: Vec<String>,

    /// Tracked files whose fingerprint matches.
    pub unchanged_files: Vec<String>,
}

impl ChangeSet {
    /// Returns `true` if there are no changes (no new, modified, or deleted files).
    pub fn is_empty(&self) -> bool {
        self.new_files.is_empty() && self.modified_files.is_empty() && self.deleted_files.is_empty()
    }

    /// Returns the number of files that need reprocessing (new + modified).
    pub fn dirty_count(&self) -> usize {
        self.new_files.len() + self.modified_files.len()
    }

    /// New, modified and deleted files together, sorted.
    pub fn changed(&self) -> Vec<String> {
        let mut changed: Vec<String> = self
            .new_files
            .iter()
            .chain(&self.modified_files)
            .chain(&self.deleted_files)
            .cloned()
            .collect();
        changed.sort();
        changed
    }

    pub(crate) fn sort(&mut self) {
        self.new_files.sort();
        self.modified_files.sort();
        self.deleted_files.sort();
        self.unchanged_files.sort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unchanged_only_is_empty() {
        let cs = ChangeSet {
            unchanged_files: vec!["a.clj".into()],
            ..ChangeSet::default()
        };
        assert!(cs.is_empty());
        assert_eq!(cs.dirty_count(), 0);
        assert!(cs.changed().is_empty());
    }

    #[test]
    fn changed_merges_and_sorts() {
        let cs = ChangeSet {
            new_files: vec!["c.clj".into()],
            modified_files: vec!["a.clj".into()],
            deleted_files: vec!["b.clj".into()],
            unchanged_files: vec!["d.clj".into()],
        };
        assert!(!cs.is_empty());
        assert_eq!(cs.dirty_count(), 2);
        assert_eq!(cs.changed(), vec!["a.clj", "b.clj", "c.clj"]);
    }
}
