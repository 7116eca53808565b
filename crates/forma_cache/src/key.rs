//! Structured cache keys and their on-disk file name encoding.

use std::fmt;

use forma_common::{Fingerprint, NodeKind, TOKEN_PREFIX};
use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// Separator between encoded components of an entry file stem.
///
/// `+` is always percent-encoded inside components, so splitting on it is
/// unambiguous.
const STEM_SEPARATOR: char = '+';

/// Longest stem written verbatim; longer keys fall back to a hashed stem.
const MAX_STEM_LEN: usize = 200;

/// Leading component of hashed stems. Not a node kind name.
const HASHED_STEM_TAG: &str = "h";

/// A cache key naming one artifact of one dependency node.
///
/// `kind` and `id` identify the node in the dependency graph, so invalidating
/// a node can find every entry that belongs to it. `variant` separates several
/// artifacts built from the same node, such as an HTML and a JSX rendering of
/// one page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    kind: NodeKind,
    id: String,
    variant: Option<String>,
}

/// How an entry file stem maps back to a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DecodedStem {
    /// The stem spells out the key.
    Key(CacheKey),
    /// The stem is a hash; the key lives inside the record.
    Hashed,
}

impl CacheKey {
    /// Creates a key for the node `id` of the given kind.
    pub fn new(kind: NodeKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            variant: None,
        }
    }

    /// Key for a compiled page.
    pub fn page(name: impl Into<String>) -> Self {
        Self::new(NodeKind::Page, name)
    }

    /// Key for an artifact derived from a source file, by normalized path.
    pub fn file(path: impl Into<String>) -> Self {
        Self::new(NodeKind::File, path)
    }

    /// Key for a resolved token. The `token:` prefix is added when missing.
    pub fn token(reference: &str) -> Self {
        let id = if reference.starts_with(TOKEN_PREFIX) {
            reference.to_string()
        } else {
            format!("{TOKEN_PREFIX}{reference}")
        };
        Self::new(NodeKind::Token, id)
    }

    /// Returns this key narrowed to one artifact variant.
    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    /// The kind of node this entry belongs to.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// The id of the node this entry belongs to.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The artifact variant, if any.
    pub fn variant(&self) -> Option<&str> {
        self.variant.as_deref()
    }

    /// Returns `true` if the entry was built from the node `(kind, id)`.
    pub fn belongs_to(&self, kind: NodeKind, id: &str) -> bool {
        self.kind == kind && self.id == id
    }

    /// Encodes the key as a filesystem-safe file stem.
    ///
    /// Components are percent-encoded and joined with `+`. Stems that would
    /// exceed the length limit are replaced by `h+<fingerprint>`.
    pub(crate) fn file_stem(&self) -> String {
        let mut stem = String::from(self.kind.as_str());
        stem.push(STEM_SEPARATOR);
        stem.push_str(&urlencoding::encode(&self.id));
        if let Some(variant) = &self.variant {
            stem.push(STEM_SEPARATOR);
            stem.push_str(&urlencoding::encode(variant));
        }
        if stem.len() > MAX_STEM_LEN {
            format!(
                "{HASHED_STEM_TAG}{STEM_SEPARATOR}{}",
                Fingerprint::of_str(&stem)
            )
        } else {
            stem
        }
    }

    /// Decodes a file stem produced by [`CacheKey::file_stem`].
    pub(crate) fn decode_file_stem(stem: &str) -> Result<DecodedStem, CacheError> {
        let invalid = |reason: String| CacheError::InvalidKey {
            raw: stem.to_string(),
            reason,
        };
        let mut parts = stem.split(STEM_SEPARATOR);
        let head = parts.next().unwrap_or_default();
        if head == HASHED_STEM_TAG {
            return Ok(DecodedStem::Hashed);
        }
        let kind: NodeKind = head.parse().map_err(|e| invalid(format!("{e}")))?;
        let id = parts
            .next()
            .ok_or_else(|| invalid("missing id component".to_string()))?;
        let id = urlencoding::decode(id).map_err(|e| invalid(e.to_string()))?;
        let variant = parts
            .next()
            .map(|v| urlencoding::decode(v).map(|v| v.into_owned()))
            .transpose()
            .map_err(|e| invalid(e.to_string()))?;
        if parts.next().is_some() {
            return Err(invalid("too many components".to_string()));
        }
        Ok(DecodedStem::Key(CacheKey {
            kind,
            id: id.into_owned(),
            variant,
        }))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Token ids already carry their kind prefix.
        if self.kind == NodeKind::Token && self.id.starts_with(TOKEN_PREFIX) {
            f.write_str(&self.id)?;
        } else {
            write!(f, "{}:{}", self.kind, self.id)?;
        }
        if let Some(variant) = &self.variant {
            write!(f, "#{variant}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(stem: &str) -> CacheKey {
        match CacheKey::decode_file_stem(stem).unwrap() {
            DecodedStem::Key(key) => key,
            DecodedStem::Hashed => panic!("unexpected hashed stem {stem}"),
        }
    }

    #[test]
    fn display_forms() {
        assert_eq!(CacheKey::page("home").to_string(), "page:home");
        assert_eq!(
            CacheKey::page("home").with_variant("jsx").to_string(),
            "page:home#jsx"
        );
        assert_eq!(
            CacheKey::token("color.primary").to_string(),
            "token:color.primary"
        );
    }

    #[test]
    fn token_prefix_not_doubled() {
        assert_eq!(CacheKey::token("token:space.sm").id(), "token:space.sm");
        assert_eq!(CacheKey::token("space.sm").id(), "token:space.sm");
    }

    #[test]
    fn stem_is_filesystem_safe() {
        let key = CacheKey::file("src/pages/home page.clj").with_variant("a+b");
        let stem = key.file_stem();
        assert!(!stem.contains('/'));
        assert!(!stem.contains(' '));
        assert_eq!(stem.matches('+').count(), 2);
        assert_eq!(decode(&stem), key);
    }

    #[test]
    fn separator_inside_id_stays_unambiguous() {
        let a = CacheKey::page("a+b");
        let b = CacheKey::page("a").with_variant("b");
        assert_ne!(a.file_stem(), b.file_stem());
        assert_eq!(decode(&a.file_stem()), a);
        assert_eq!(decode(&b.file_stem()), b);
    }

    #[test]
    fn long_keys_hash() {
        let key = CacheKey::file("x/".repeat(150));
        let stem = key.file_stem();
        assert!(stem.starts_with("h+"));
        assert!(stem.len() < 40);
        assert_eq!(
            CacheKey::decode_file_stem(&stem).unwrap(),
            DecodedStem::Hashed
        );
    }

    #[test]
    fn unknown_kind_is_invalid() {
        let err = CacheKey::decode_file_stem("widget+x").unwrap_err();
        assert!(matches!(err, CacheError::InvalidKey { .. }));
    }

    #[test]
    fn extra_components_are_invalid() {
        assert!(CacheKey::decode_file_stem("page+a+b+c").is_err());
        assert!(CacheKey::decode_file_stem("page").is_err());
    }

    #[test]
    fn belongs_to_ignores_variant() {
        let key = CacheKey::page("home").with_variant("html");
        assert!(key.belongs_to(NodeKind::Page, "home"));
        assert!(!key.belongs_to(NodeKind::File, "home"));
    }
}
