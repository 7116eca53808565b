//! Cache invalidation strategies.
//!
//! Every strategy takes the same inputs and returns the same
//! [`InvalidationReport`], so callers can chain them: classify paths with
//! [`InvalidationStrategy::ContentHash`], then feed `changed` into
//! [`InvalidationStrategy::DependencyBased`].

use std::collections::BTreeSet;
use std::path::Path;

use forma_cache::{CacheKey, KeyPattern, LayeredCache};
use forma_common::NodeKind;
use forma_graph::{normalize_path, DependencyGraph};
use serde::{Deserialize, Serialize};

/// How the items passed to [`InvalidationEngine::invalidate_by_strategy`] are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvalidationStrategy {
    /// Items are file paths; report which changed since they were tracked.
    /// Evicts nothing.
    ContentHash,
    /// Items are known-changed ids or paths; evict them and everything
    /// that transitively depends on them.
    DependencyBased,
    /// Items are [`KeyPattern`]s; evict matching cache entries and collect
    /// matching graph nodes.
    Pattern,
}

/// Outcome of one invalidation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    /// Ids found or given as changed.
    pub changed: BTreeSet<String>,
    /// Ids whose cached artifacts are no longer valid.
    pub invalidated: BTreeSet<String>,
    /// Cache keys actually removed, sorted.
    pub evicted: Vec<CacheKey>,
}

/// Stateless dispatcher over [`InvalidationStrategy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct InvalidationEngine;

impl InvalidationEngine {
    /// Applies `strategy` to `items`.
    pub fn invalidate_by_strategy<V, S: AsRef<str>>(
        cache: &LayeredCache<V>,
        graph: &DependencyGraph,
        items: &[S],
        strategy: InvalidationStrategy,
    ) -> InvalidationReport {
        let report = match strategy {
            InvalidationStrategy::ContentHash => Self::content_hash(graph, items),
            InvalidationStrategy::DependencyBased => Self::dependency_based(cache, graph, items),
            InvalidationStrategy::Pattern => Self::pattern(cache, graph, items),
        };
        tracing::debug!(
            ?strategy,
            items = items.len(),
            changed = report.changed.len(),
            invalidated = report.invalidated.len(),
            evicted = report.evicted.len(),
            "invalidation applied"
        );
        report
    }

    /// Classifies file paths by fingerprint; `changed` holds the ids of those that differ.
    pub fn content_hash<S: AsRef<str>>(graph: &DependencyGraph, items: &[S]) -> InvalidationReport {
        let changed = items
            .iter()
            .map(|item| Path::new(item.as_ref()))
            .filter(|path| graph.file_changed(path))
            .map(normalize_path)
            .collect();
        InvalidationReport {
            changed,
            ..InvalidationReport::default()
        }
    }

    /// Cascade invalidation from known-changed items.
    ///
    /// `changed` holds the items resolved to graph ids, `invalidated` those
    /// ids plus all their transitive dependents.
    pub fn dependency_based<V, S: AsRef<str>>(
        cache: &LayeredCache<V>,
        graph: &DependencyGraph,
        items: &[S],
    ) -> InvalidationReport {
        let changed: BTreeSet<String> = items.iter().map(|i| graph.resolve_id(i.as_ref())).collect();
        let invalidated = Self::affected(graph, &changed);

        let owners: BTreeSet<(NodeKind, &str)> = invalidated
            .iter()
            .map(|id| {
                let kind = graph
                    .node(id)
                    .map_or_else(|| NodeKind::infer_from_id(id), |n| n.kind);
                (kind, id.as_str())
            })
            .collect();
        let evicted = cache.invalidate_where(|key| owners.contains(&(key.kind(), key.id())));

        InvalidationReport {
            changed,
            invalidated,
            evicted,
        }
    }

    /// Evicts entries matching any pattern.
    ///
    /// `invalidated` holds the ids of matching graph nodes and of evicted entries.
    pub fn pattern<V, S: AsRef<str>>(
        cache: &LayeredCache<V>,
        graph: &DependencyGraph,
        items: &[S],
    ) -> InvalidationReport {
        let patterns: Vec<KeyPattern> = items.iter().map(|i| KeyPattern::parse(i.as_ref())).collect();
        let evicted = cache.invalidate_where(|key| patterns.iter().any(|p| p.matches(key)));

        let mut invalidated: BTreeSet<String> = NodeKind::ALL
            .iter()
            .flat_map(|&kind| {
                graph
                    .nodes_of_kind(kind)
                    .into_iter()
                    .filter(|id| patterns.iter().any(|p| p.matches_node(kind, id)))
                    .collect::<Vec<_>>()
            })
            .collect();
        invalidated.extend(evicted.iter().map(|key| key.id().to_string()));

        InvalidationReport {
            changed: BTreeSet::new(),
            invalidated,
            evicted,
        }
    }

    /// `seeds` plus everything that transitively depends on them.
    pub fn affected(graph: &DependencyGraph, seeds: &BTreeSet<String>) -> BTreeSet<String> {
        let mut affected = seeds.clone();
        for seed in seeds {
            affected.extend(graph.get_transitive_dependents(seed));
        }
        affected
    }
}
