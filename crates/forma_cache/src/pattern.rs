//! Key patterns for bulk invalidation.
//!
//! A pattern is written as `[kind:]text`. The optional kind prefix restricts
//! matches to one node kind. The text matches the whole id when it contains
//! `*` (any run of characters) or `?` (exactly one character), and any id
//! containing it as a substring otherwise. Empty text matches everything.
//!
//! Token ids keep their `token:` prefix, so `token:color.*` is matched against
//! ids like `token:color.primary` as written.

use std::fmt;

use forma_common::NodeKind;

use crate::key::CacheKey;

/// A parsed invalidation pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPattern {
    kind: Option<NodeKind>,
    matcher: IdMatcher,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum IdMatcher {
    Any,
    Substring(String),
    Wildcard(Vec<char>),
}

impl KeyPattern {
    /// Parses the textual pattern form described in the module docs.
    pub fn parse(raw: &str) -> Self {
        if let Some((head, rest)) = raw.split_once(':') {
            if let Ok(kind) = head.parse::<NodeKind>() {
                let text = if kind == NodeKind::Token { raw } else { rest };
                let matcher = if text == raw && rest.is_empty() {
                    IdMatcher::Any
                } else {
                    IdMatcher::from_text(text)
                };
                return Self {
                    kind: Some(kind),
                    matcher,
                };
            }
        }
        Self {
            kind: None,
            matcher: IdMatcher::from_text(raw),
        }
    }

    /// Matches every key.
    pub fn any() -> Self {
        Self {
            kind: None,
            matcher: IdMatcher::Any,
        }
    }

    /// Matches every key of one kind.
    pub fn of_kind(kind: NodeKind) -> Self {
        Self {
            kind: Some(kind),
            matcher: IdMatcher::Any,
        }
    }

    /// Matches ids containing `needle`.
    pub fn substring(needle: impl Into<String>) -> Self {
        Self {
            kind: None,
            matcher: IdMatcher::Substring(needle.into()),
        }
    }

    /// Matches ids against a `*`/`?` wildcard expression.
    pub fn wildcard(glob: &str) -> Self {
        Self {
            kind: None,
            matcher: IdMatcher::Wildcard(glob.chars().collect()),
        }
    }

    /// Restricts this pattern to one node kind.
    pub fn with_kind(mut self, kind: NodeKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// The kind restriction, if any.
    pub fn kind(&self) -> Option<NodeKind> {
        self.kind
    }

    /// Returns `true` if the node `(kind, id)` matches.
    pub fn matches_node(&self, kind: NodeKind, id: &str) -> bool {
        self.kind.map_or(true, |k| k == kind) && self.matcher.matches(id)
    }

    /// Returns `true` if the key matches.
    ///
    /// The text is tried against the key's node id and, failing that, against
    /// its full display form, so a pattern like `#jsx` selects variants.
    pub fn matches(&self, key: &CacheKey) -> bool {
        if self.kind.is_some_and(|k| k != key.kind()) {
            return false;
        }
        self.matcher.matches(key.id()) || self.matcher.matches(&key.to_string())
    }
}

impl IdMatcher {
    fn from_text(text: &str) -> Self {
        if text.is_empty() {
            IdMatcher::Any
        } else if text.contains(['*', '?']) {
            IdMatcher::Wildcard(text.chars().collect())
        } else {
            IdMatcher::Substring(text.to_string())
        }
    }

    fn matches(&self, candidate: &str) -> bool {
        match self {
            IdMatcher::Any => true,
            IdMatcher::Substring(needle) => candidate.contains(needle.as_str()),
            IdMatcher::Wildcard(glob) => wildcard_match(glob, candidate),
        }
    }
}

/// Iterative wildcard match with single-star backtracking.
fn wildcard_match(glob: &[char], candidate: &str) -> bool {
    let text: Vec<char> = candidate.chars().collect();
    let (mut g, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        match glob.get(g) {
            Some('*') => {
                star = Some((g, t));
                g += 1;
            }
            Some(&c) if c == '?' || c == text[t] => {
                g += 1;
                t += 1;
            }
            _ => match star {
                Some((sg, st)) => {
                    g = sg + 1;
                    t = st + 1;
                    star = Some((sg, st + 1));
                }
                None => return false,
            },
        }
    }
    glob[g..].iter().all(|&c| c == '*')
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text: String = match &self.matcher {
            IdMatcher::Any => "*".to_string(),
            IdMatcher::Substring(s) => s.clone(),
            IdMatcher::Wildcard(g) => g.iter().collect(),
        };
        match self.kind {
            Some(NodeKind::Token) if text.starts_with(forma_common::TOKEN_PREFIX) => {
                f.write_str(&text)
            }
            Some(kind) => write!(f, "{kind}:{text}"),
            None => f.write_str(&text),
        }
    }
}
