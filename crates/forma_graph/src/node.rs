//! Graph node types.

use std::path::PathBuf;

use forma_common::{Fingerprint, NodeKind};

/// What the graph remembers about a node besides its edges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeMetadata {
    /// Filesystem path of a file node, as passed to `track_file`.
    pub path: Option<PathBuf>,

    /// Fingerprint recorded the last time the file was tracked.
    /// `None` if the file did not exist at that time.
    pub fingerprint: Option<Fingerprint>,

    /// Resolved value of a token node.
    pub resolved_value: Option<String>,

    /// Id of the file a token was defined in.
    pub source: Option<String>,
}

/// A file, token or page in the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyNode {
    /// Normalized path for files, `token:<ref>` for tokens, the name for pages.
    pub id: String,

    /// Node kind.
    pub kind: NodeKind,

    /// Node metadata.
    pub metadata: NodeMetadata,
}

impl DependencyNode {
    /// Creates a node with explicit kind and metadata.
    pub fn new(id: impl Into<String>, kind: NodeKind, metadata: NodeMetadata) -> Self {
        Self {
            id: id.into(),
            kind,
            metadata,
        }
    }

    /// A node created implicitly by an edge, its kind guessed from the id.
    pub fn bare(id: impl Into<String>) -> Self {
        let id = id.into();
        let kind = NodeKind::infer_from_id(&id);
        Self::new(id, kind, NodeMetadata::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_nodes_infer_kind() {
        assert_eq!(DependencyNode::bare("token:color.primary").kind, NodeKind::Token);
        assert_eq!(DependencyNode::bare("src/pages/home.clj").kind, NodeKind::File);
        assert_eq!(DependencyNode::bare("home").kind, NodeKind::Page);
        assert_eq!(DependencyNode::bare("home").metadata, NodeMetadata::default());
    }
}
