//! The closed set of dependency node kinds.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What a dependency node (and the cache entries keyed by it) represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// A source file on disk, identified by its normalized path.
    File,
    /// A design token, identified as `token:<reference>`.
    Token,
    /// A compilable page, identified by its page name.
    Page,
}

/// Prefix used for token node ids.
pub const TOKEN_PREFIX: &str = "token:";

impl NodeKind {
    /// All kinds, in declaration order.
    pub const ALL: [NodeKind; 3] = [NodeKind::File, NodeKind::Token, NodeKind::Page];

    /// Returns the lowercase name used in keys and patterns.
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::File => "file",
            NodeKind::Token => "token",
            NodeKind::Page => "page",
        }
    }

    /// Guesses the kind of a node that was referenced before being registered.
    ///
    /// `token:`-prefixed ids are tokens, ids that look like paths (contain `/`
    /// or `.`) are files, and anything else is taken to be a page name.
    pub fn infer_from_id(id: &str) -> Self {
        if id.starts_with(TOKEN_PREFIX) {
            NodeKind::Token
        } else if id.contains('/') || id.contains('.') {
            NodeKind::File
        } else {
            NodeKind::Page
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string does not name a [`NodeKind`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown node kind '{0}'")]
pub struct ParseNodeKindError(pub String);

impl FromStr for NodeKind {
    type Err = ParseNodeKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(NodeKind::File),
            "token" => Ok(NodeKind::Token),
            "page" => Ok(NodeKind::Page),
            other => Err(ParseNodeKindError(other.to_string())),
        }
    }
}
