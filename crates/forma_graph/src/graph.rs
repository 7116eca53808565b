//! The dependency graph.
//!
//! An edge `(dependent, dependency)` reads "dependent depends on dependency".
//! Edges are stored twice, in a forward map (dependent -> dependencies) and a
//! reverse map (dependency -> dependents), so both directions are O(log n)
//! lookups. All state lives in one [`StateCell`]; fingerprinting happens
//! before the cell is locked.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};

use forma_common::{Fingerprint, NodeKind, StateCell, TOKEN_PREFIX};

use crate::change::ChangeSet;
use crate::fingerprint::{normalize_path, ContentFingerprinter, Fingerprinter};
use crate::node::{DependencyNode, NodeMetadata};

#[derive(Debug, Default)]
struct GraphState {
    nodes: BTreeMap<String, DependencyNode>,
    forward: BTreeMap<String, BTreeSet<String>>,
    reverse: BTreeMap<String, BTreeSet<String>>,
    edge_count: usize,
}

impl GraphState {
    fn ensure_node(&mut self, id: &str) {
        if !self.nodes.contains_key(id) {
            self.nodes.insert(id.to_string(), DependencyNode::bare(id));
        }
    }

    fn add_edge(&mut self, dependent: &str, dependency: &str) -> bool {
        self.ensure_node(dependent);
        self.ensure_node(dependency);
        let added = self
            .forward
            .entry(dependent.to_string())
            .or_default()
            .insert(dependency.to_string());
        if added {
            self.reverse
                .entry(dependency.to_string())
                .or_default()
                .insert(dependent.to_string());
            self.edge_count += 1;
        }
        added
    }

    fn remove_edge(&mut self, dependent: &str, dependency: &str) -> bool {
        let removed = remove_from(&mut self.forward, dependent, dependency);
        if removed {
            remove_from(&mut self.reverse, dependency, dependent);
            self.edge_count -= 1;
        }
        removed
    }

    fn neighbours(map: &BTreeMap<String, BTreeSet<String>>, id: &str) -> BTreeSet<String> {
        map.get(id).cloned().unwrap_or_default()
    }
}

fn remove_from(map: &mut BTreeMap<String, BTreeSet<String>>, from: &str, to: &str) -> bool {
    let Some(set) = map.get_mut(from) else {
        return false;
    };
    let removed = set.remove(to);
    if set.is_empty() {
        map.remove(from);
    }
    removed
}

/// Directed "depends-on" graph over files, tokens and pages.
///
/// Safe to share between threads; every mutation is a single atomic update.
pub struct DependencyGraph {
    state: StateCell<GraphState>,
    fingerprinter: Box<dyn Fingerprinter>,
}

impl fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("nodes", &self.len())
            .field("edges", &self.edge_count())
            .finish_non_exhaustive()
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new(ContentFingerprinter)
    }
}

impl DependencyGraph {
    /// Creates an empty graph that fingerprints files with `fingerprinter`.
    pub fn new(fingerprinter: impl Fingerprinter + 'static) -> Self {
        Self {
            state: StateCell::new(GraphState::default()),
            fingerprinter: Box::new(fingerprinter),
        }
    }

    /// Inserts or replaces the node `id`. Existing edges are kept.
    pub fn add_node(&self, id: impl Into<String>, kind: NodeKind, metadata: NodeMetadata) {
        let node = DependencyNode::new(id, kind, metadata);
        self.state.update(|s| {
            s.nodes.insert(node.id.clone(), node);
        });
    }

    /// Records that `dependent` depends on `dependency`.
    ///
    /// Missing endpoints are created as bare nodes. Returns `false` if the
    /// edge already existed.
    pub fn add_edge(&self, dependent: &str, dependency: &str) -> bool {
        self.state.update(|s| s.add_edge(dependent, dependency))
    }

    /// Removes one edge. Returns `false` if it did not exist.
    pub fn remove_edge(&self, dependent: &str, dependency: &str) -> bool {
        self.state.update(|s| s.remove_edge(dependent, dependency))
    }

    /// Removes a node and every edge touching it.
    pub fn remove_node(&self, id: &str) -> Option<DependencyNode> {
        self.state.update(|s| {
            let node = s.nodes.remove(id)?;
            for dependency in GraphState::neighbours(&s.forward, id) {
                s.remove_edge(id, &dependency);
            }
            for dependent in GraphState::neighbours(&s.reverse, id) {
                s.remove_edge(&dependent, id);
            }
            Some(node)
        })
    }

    /// A copy of the node `id`.
    pub fn node(&self, id: &str) -> Option<DependencyNode> {
        self.state.read(|s| s.nodes.get(id).cloned())
    }

    /// Returns `true` if the graph has a node `id`.
    pub fn contains(&self, id: &str) -> bool {
        self.state.read(|s| s.nodes.contains_key(id))
    }

    /// Ids of all nodes of one kind, sorted.
    pub fn nodes_of_kind(&self, kind: NodeKind) -> Vec<String> {
        self.state.read(|s| {
            s.nodes
                .values()
                .filter(|n| n.kind == kind)
                .map(|n| n.id.clone())
                .collect()
        })
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.state.read(|s| s.nodes.len())
    }

    /// Returns `true` if the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of edges.
    pub fn edge_count(&self) -> usize {
        self.state.read(|s| s.edge_count)
    }

    /// What `id` depends on directly.
    pub fn get_dependencies(&self, id: &str) -> BTreeSet<String> {
        self.state.read(|s| GraphState::neighbours(&s.forward, id))
    }

    /// What depends on `id` directly.
    pub fn get_dependents(&self, id: &str) -> BTreeSet<String> {
        self.state.read(|s| GraphState::neighbours(&s.reverse, id))
    }

    /// Everything that depends on `id`, directly or through other nodes.
    ///
    /// Breadth-first over the reverse map with a visited set, so cycles
    /// terminate. The start node is never part of the result, even when it
    /// lies on a cycle.
    pub fn get_transitive_dependents(&self, id: &str) -> BTreeSet<String> {
        self.state.read(|s| {
            let mut visited = BTreeSet::new();
            let mut queue = VecDeque::from([id.to_string()]);
            while let Some(current) = queue.pop_front() {
                let Some(dependents) = s.reverse.get(&current) else {
                    continue;
                };
                for dependent in dependents {
                    if dependent != id && visited.insert(dependent.clone()) {
                        queue.push_back(dependent.clone());
                    }
                }
            }
            visited
        })
    }

    /// Edges `(dependent, dependency)` with both endpoints in `subset`, sorted.
    pub fn edges_within(&self, subset: &BTreeSet<String>) -> Vec<(String, String)> {
        self.state.read(|s| {
            let mut edges = Vec::new();
            for dependent in subset {
                for dependency in s.forward.get(dependent).into_iter().flatten() {
                    if subset.contains(dependency) {
                        edges.push((dependent.clone(), dependency.clone()));
                    }
                }
            }
            edges
        })
    }

    /// Maps a path or id to the id the graph knows it by.
    ///
    /// Known ids are returned as is; otherwise the normalized path form is
    /// used for anything that looks like a file.
    pub fn resolve_id(&self, item: &str) -> String {
        if self.contains(item) {
            return item.to_string();
        }
        let normalized = normalize_path(Path::new(item));
        if self.contains(&normalized) || NodeKind::infer_from_id(item) == NodeKind::File {
            normalized
        } else {
            item.to_string()
        }
    }

    /// Registers a file and records its current fingerprint. Returns its id.
    ///
    /// Re-tracking refreshes the fingerprint and keeps the node's edges.
    pub fn track_file(&self, path: &Path) -> String {
        let id = normalize_path(path);
        let fingerprint = self.fingerprinter.fingerprint(path);
        tracing::trace!(id = %id, tracked = fingerprint.is_some(), "tracking file");
        self.state.update(|s| {
            let node = s
                .nodes
                .entry(id.clone())
                .or_insert_with(|| DependencyNode::new(id.clone(), NodeKind::File, NodeMetadata::default()));
            node.kind = NodeKind::File;
            node.metadata.path = Some(path.to_path_buf());
            node.metadata.fingerprint = fingerprint;
        });
        id
    }

    /// Returns `true` if the file differs from what was last tracked.
    ///
    /// An untracked path, or one that no longer exists, counts as changed.
    pub fn file_changed(&self, path: &Path) -> bool {
        let current = self.fingerprinter.fingerprint(path);
        let stored = self.recorded_fingerprint(path);
        match (stored, current) {
            (Some(stored), Some(current)) => stored != current,
            _ => true,
        }
    }

    /// Registers a token defined in `source_file` and links it to that file.
    ///
    /// Returns the token's id, `token:<reference>`. Re-tracking a token under
    /// a different source file moves the edge.
    pub fn track_token(&self, reference: &str, resolved_value: &str, source_file: &Path) -> String {
        let id = if reference.starts_with(TOKEN_PREFIX) {
            reference.to_string()
        } else {
            format!("{TOKEN_PREFIX}{reference}")
        };
        let source_id = normalize_path(source_file);
        self.state.update(|s| {
            let previous_source = s.nodes.get(&id).and_then(|n| n.metadata.source.clone());
            if let Some(old) = previous_source.filter(|old| *old != source_id) {
                s.remove_edge(&id, &old);
            }
            let metadata = NodeMetadata {
                resolved_value: Some(resolved_value.to_string()),
                source: Some(source_id.clone()),
                ..NodeMetadata::default()
            };
            s.nodes
                .insert(id.clone(), DependencyNode::new(id.clone(), NodeKind::Token, metadata));
            s.nodes.entry(source_id.clone()).or_insert_with(|| {
                DependencyNode::new(source_id.clone(), NodeKind::File, NodeMetadata::default())
            });
            s.add_edge(&id, &source_id);
        });
        id
    }

    /// Paths of every file node registered through [`track_file`](Self::track_file), sorted by id.
    pub fn tracked_files(&self) -> Vec<PathBuf> {
        self.state.read(|s| {
            s.nodes
                .values()
                .filter(|n| n.kind == NodeKind::File)
                .filter_map(|n| n.metadata.path.clone())
                .collect()
        })
    }

    /// Classifies `paths` against the recorded fingerprints.
    ///
    /// Untracked paths that do not exist are skipped. Nothing is recorded;
    /// call [`track_file`](Self::track_file) to accept the new state.
    pub fn detect_changes<P: AsRef<Path>>(&self, paths: &[P]) -> ChangeSet {
        let current: Vec<(String, Option<Fingerprint>)> = paths
            .iter()
            .map(|p| {
                let path = p.as_ref();
                (normalize_path(path), self.fingerprinter.fingerprint(path))
            })
            .collect();

        let mut changes = ChangeSet::default();
        self.state.read(|s| {
            for (id, fingerprint) in current {
                let tracked = s.nodes.get(&id).filter(|n| n.metadata.path.is_some());
                match (tracked, fingerprint) {
                    (None, Some(_)) => changes.new_files.push(id),
                    (None, None) => {}
                    (Some(_), None) => changes.deleted_files.push(id),
                    (Some(node), Some(fp)) if node.metadata.fingerprint == Some(fp) => {
                        changes.unchanged_files.push(id)
                    }
                    (Some(_), Some(_)) => changes.modified_files.push(id),
                }
            }
        });
        changes.sort();
        changes.new_files.dedup();
        changes.modified_files.dedup();
        changes.deleted_files.dedup();
        changes.unchanged_files.dedup();
        changes
    }

    /// Fingerprints `path` now, without recording anything.
    pub fn fingerprint(&self, path: &Path) -> Option<Fingerprint> {
        self.fingerprinter.fingerprint(path)
    }

    /// The fingerprint recorded by the last [`track_file`](Self::track_file) of `path`.
    pub fn recorded_fingerprint(&self, path: &Path) -> Option<Fingerprint> {
        let id = normalize_path(path);
        self.state
            .read(|s| s.nodes.get(&id).and_then(|n| n.metadata.fingerprint))
    }
}
