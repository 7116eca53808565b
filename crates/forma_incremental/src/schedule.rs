//! Topological scheduling of a node subset.
//!
//! Only edges with both endpoints inside the subset constrain the order.
//! Nodes are released in waves: a wave holds every node whose in-subset
//! dependencies all sit in earlier waves, sorted by id. Nodes of one wave are
//! independent of each other and may compile in parallel.

use std::collections::{BTreeMap, BTreeSet};

use forma_graph::DependencyGraph;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::IncrementalError;

/// Orders `subset` so every dependency precedes its dependents.
///
/// The order is wave by wave, lexicographic within a wave. Fails with
/// [`IncrementalError::Cycle`] if the subset contains a cycle.
pub fn topological_sort(
    graph: &DependencyGraph,
    subset: &BTreeSet<String>,
) -> Result<Vec<String>, IncrementalError> {
    Ok(topological_levels(graph, subset)?.into_iter().flatten().collect())
}

/// Groups `subset` into dependency waves (Kahn's algorithm).
pub fn topological_levels(
    graph: &DependencyGraph,
    subset: &BTreeSet<String>,
) -> Result<Vec<Vec<String>>, IncrementalError> {
    let edges = graph.edges_within(subset);

    let mut waiting_on: BTreeMap<&str, usize> = subset.iter().map(|id| (id.as_str(), 0)).collect();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (dependent, dependency) in &edges {
        *waiting_on.entry(dependent.as_str()).or_default() += 1;
        dependents
            .entry(dependency.as_str())
            .or_default()
            .push(dependent.as_str());
    }

    let mut ready: Vec<&str> = waiting_on
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut levels: Vec<Vec<String>> = Vec::new();
    let mut placed = 0;
    while !ready.is_empty() {
        let mut next = BTreeSet::new();
        for id in &ready {
            for dependent in dependents.get(id).into_iter().flatten() {
                if let Some(count) = waiting_on.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        next.insert(*dependent);
                    }
                }
            }
        }
        placed += ready.len();
        levels.push(ready.iter().map(|id| id.to_string()).collect());
        ready = next.into_iter().collect();
    }

    if placed < subset.len() {
        let ordered: BTreeSet<&str> = levels.iter().flatten().map(String::as_str).collect();
        let unordered: Vec<String> = subset
            .iter()
            .filter(|id| !ordered.contains(id.as_str()))
            .cloned()
            .collect();
        let cycles = strongly_connected(&unordered, &edges);
        tracing::warn!(unordered = unordered.len(), cycles = cycles.len(), "dependency cycle blocks scheduling");
        return Err(IncrementalError::Cycle { unordered, cycles });
    }
    Ok(levels)
}

/// Cycles among `nodes`: components with more than one node or a self-loop.
fn strongly_connected(nodes: &[String], edges: &[(String, String)]) -> Vec<Vec<String>> {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let index: BTreeMap<&str, NodeIndex> = nodes
        .iter()
        .map(|id| (id.as_str(), graph.add_node(id.as_str())))
        .collect();
    for (dependent, dependency) in edges {
        if let (Some(&from), Some(&to)) = (index.get(dependent.as_str()), index.get(dependency.as_str())) {
            graph.add_edge(from, to, ());
        }
    }

    let mut cycles: Vec<Vec<String>> = tarjan_scc(&graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .map(|scc| {
            let mut ids: Vec<String> = scc.iter().map(|&ix| graph[ix].to_string()).collect();
            ids.sort();
            ids
        })
        .collect();
    cycles.sort();
    cycles
}
