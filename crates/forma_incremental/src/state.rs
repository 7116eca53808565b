//! Per-node compilation state machine.
//!
//! Each node moves `Pending -> InProgress -> Compiled`. The transition into
//! `InProgress` is the dedup gate: it succeeds for exactly one caller while
//! the node is already in progress, so two concurrent requests never compile
//! the same node twice.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use forma_common::StateCell;

/// Where a node is in the current pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilationState {
    /// Waiting to be compiled.
    Pending,
    /// Claimed by a compiler since the given instant.
    InProgress {
        /// When the node was claimed.
        since: Instant,
    },
    /// Finished in this pass.
    Compiled,
}

impl CompilationState {
    fn is_in_progress(&self) -> bool {
        matches!(self, CompilationState::InProgress { .. })
    }
}

/// Thread-safe map from node id to [`CompilationState`].
///
/// Ids that were never seen have no state; [`mark_in_progress`](Self::mark_in_progress)
/// treats them as pending.
#[derive(Debug, Default)]
pub struct CompilationTracker {
    states: StateCell<BTreeMap<String, CompilationState>>,
}

impl CompilationTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `id` for compilation.
    ///
    /// Returns `false`, changing nothing, when the node is already in progress.
    pub fn mark_in_progress(&self, id: &str) -> bool {
        self.states.update(|states| {
            if states.get(id).is_some_and(CompilationState::is_in_progress) {
                return false;
            }
            states.insert(
                id.to_string(),
                CompilationState::InProgress {
                    since: Instant::now(),
                },
            );
            true
        })
    }

    /// Moves `id` from in progress to compiled. Returns `false` otherwise.
    pub fn mark_compiled(&self, id: &str) -> bool {
        self.states.update(|states| match states.get_mut(id) {
            Some(state) if state.is_in_progress() => {
                *state = CompilationState::Compiled;
                true
            }
            _ => false,
        })
    }

    /// Puts `id` back to pending, whatever its state.
    pub fn mark_pending(&self, id: &str) {
        self.states.update(|states| {
            states.insert(id.to_string(), CompilationState::Pending);
        });
    }

    /// Sets every id to pending, except ids currently in progress.
    pub fn reset<'a>(&self, ids: impl IntoIterator<Item = &'a String>) {
        self.states.update(|states| {
            for id in ids {
                let state = states.entry(id.clone()).or_insert(CompilationState::Pending);
                if !state.is_in_progress() {
                    *state = CompilationState::Pending;
                }
            }
        });
    }

    /// Forgets the given ids, except ids currently in progress.
    ///
    /// Returns how many were forgotten.
    pub fn discard<'a>(&self, ids: impl IntoIterator<Item = &'a String>) -> usize {
        self.states.update(|states| {
            let mut removed = 0;
            for id in ids {
                if states.get(id).is_some_and(|s| !s.is_in_progress()) {
                    states.remove(id);
                    removed += 1;
                }
            }
            removed
        })
    }

    /// The state of `id`, if tracked.
    pub fn state_of(&self, id: &str) -> Option<CompilationState> {
        self.states.read(|states| states.get(id).copied())
    }

    /// Ids waiting to be compiled.
    pub fn pending(&self) -> BTreeSet<String> {
        self.ids_where(|s| *s == CompilationState::Pending)
    }

    /// Ids currently being compiled.
    pub fn in_progress(&self) -> BTreeSet<String> {
        self.ids_where(CompilationState::is_in_progress)
    }

    /// Ids compiled in the current pass.
    pub fn compiled(&self) -> BTreeSet<String> {
        self.ids_where(|s| *s == CompilationState::Compiled)
    }

    /// Ids in progress for at least `threshold`.
    pub fn stale_in_progress(&self, threshold: Duration) -> Vec<String> {
        let now = Instant::now();
        self.states.read(|states| {
            states
                .iter()
                .filter(|(_, state)| match state {
                    CompilationState::InProgress { since } => {
                        now.saturating_duration_since(*since) >= threshold
                    }
                    _ => false,
                })
                .map(|(id, _)| id.clone())
                .collect()
        })
    }

    /// Forces nodes in progress for at least `threshold` back to pending.
    ///
    /// Returns the reclaimed ids.
    pub fn reclaim_stale(&self, threshold: Duration) -> Vec<String> {
        let now = Instant::now();
        let reclaimed: Vec<String> = self.states.update(|states| {
            states
                .iter_mut()
                .filter_map(|(id, state)| {
                    let CompilationState::InProgress { since } = *state else {
                        return None;
                    };
                    if now.saturating_duration_since(since) < threshold {
                        return None;
                    }
                    *state = CompilationState::Pending;
                    Some(id.clone())
                })
                .collect()
        });
        for id in &reclaimed {
            tracing::warn!(id = %id, ?threshold, "reclaimed node stuck in progress");
        }
        reclaimed
    }

    /// Blocks until `id` is no longer in progress.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub fn wait_until_settled(&self, id: &str, timeout: Duration) -> bool {
        self.states
            .wait_until(timeout, |states| {
                (!states.get(id).is_some_and(CompilationState::is_in_progress)).then_some(())
            })
            .is_some()
    }

    fn ids_where(&self, pred: impl Fn(&CompilationState) -> bool) -> BTreeSet<String> {
        self.states.read(|states| {
            states
                .iter()
                .filter(|(_, state)| pred(*state))
                .map(|(id, _)| id.clone())
                .collect()
        })
    }
}
