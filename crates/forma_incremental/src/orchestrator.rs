//! Incremental compilation driver.
//!
//! [`IncrementalOrchestrator`] ties the pieces together: changed files go
//! through dependency-based invalidation, the affected nodes are ordered into
//! waves, and each page is compiled through the injected [`PageCompiler`]
//! with the [`CompilationTracker`] as dedup gate. Results are written back
//! into the [`LayeredCache`] under [`CacheKey::page`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::{Duration, Instant};

use forma_cache::{CacheKey, LayeredCache, PutOptions};
use forma_common::{NodeKind, StateCell};
use forma_config::{BuildSettings, InFlightMode};
use forma_graph::DependencyGraph;
use rayon::prelude::*;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{BoxError, IncrementalError};
use crate::invalidation::{InvalidationEngine, InvalidationStrategy};
use crate::schedule::topological_levels;
use crate::state::CompilationTracker;
use crate::watch::ChangeBatch;

/// Compiles one page into an artifact.
///
/// Implemented for any `Fn(&str, &C) -> Result<V, BoxError>`.
pub trait PageCompiler<C, V>: Send + Sync {
    /// Compiles `page` with the caller's `context`.
    fn compile(&self, page: &str, context: &C) -> Result<V, BoxError>;
}

impl<C, V, F> PageCompiler<C, V> for F
where
    F: Fn(&str, &C) -> Result<V, BoxError> + Send + Sync,
{
    fn compile(&self, page: &str, context: &C) -> Result<V, BoxError> {
        self(page, context)
    }
}

/// What a caller gets when the page it asked for is already being compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InFlightPolicy {
    /// Wait up to `timeout` for the other compilation, then serve its result.
    Wait {
        /// Upper bound on the wait.
        timeout: Duration,
    },
    /// Serve the artifact cached before invalidation when there is one;
    /// otherwise wait up to `timeout`.
    ServeStale {
        /// Upper bound on the fallback wait.
        timeout: Duration,
    },
}

impl InFlightPolicy {
    /// The policy described by `[build]` settings.
    pub fn from_settings(settings: &BuildSettings) -> Self {
        let timeout = settings.in_flight_timeout();
        match settings.in_flight {
            InFlightMode::Wait => InFlightPolicy::Wait { timeout },
            InFlightMode::ServeStale => InFlightPolicy::ServeStale { timeout },
        }
    }

    fn timeout(&self) -> Duration {
        match *self {
            InFlightPolicy::Wait { timeout } | InFlightPolicy::ServeStale { timeout } => timeout,
        }
    }
}

impl Default for InFlightPolicy {
    fn default() -> Self {
        Self::from_settings(&BuildSettings::default())
    }
}

/// How a requested artifact was obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutcome<V> {
    /// This call ran the compiler.
    Compiled(V),
    /// Served from the cache, possibly after waiting for another compilation.
    Cached(V),
    /// The pre-invalidation artifact, served while a recompilation runs.
    Stale(V),
}

impl<V> CompileOutcome<V> {
    /// The artifact.
    pub fn value(&self) -> &V {
        match self {
            CompileOutcome::Compiled(v) | CompileOutcome::Cached(v) | CompileOutcome::Stale(v) => v,
        }
    }

    /// Consumes the outcome and returns the artifact.
    pub fn into_value(self) -> V {
        match self {
            CompileOutcome::Compiled(v) | CompileOutcome::Cached(v) | CompileOutcome::Stale(v) => v,
        }
    }

    /// Returns `true` if this call ran the compiler.
    pub fn was_compiled(&self) -> bool {
        matches!(self, CompileOutcome::Compiled(_))
    }
}

/// Summary of one [`IncrementalOrchestrator::compile_pass`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// The changed items, resolved to graph ids.
    pub changed: BTreeSet<String>,
    /// Every node invalidated by the change.
    pub invalidated: BTreeSet<String>,
    /// Cache keys evicted by the invalidation.
    pub evicted: Vec<CacheKey>,
    /// The schedule that was run.
    pub levels: Vec<Vec<String>>,
    /// Pages this pass compiled, in completion order per wave.
    pub compiled: Vec<String>,
    /// Pages whose compilation failed, with the error message.
    pub failed: BTreeMap<String, String>,
    /// Nodes not attempted because a dependency failed.
    pub skipped: Vec<String>,
}

impl PassReport {
    /// Returns `true` if nothing failed or was skipped.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

/// Result of driving one node through the state machine.
enum NodeResult {
    /// A page compiled by this pass.
    Compiled,
    /// Settled without running the compiler here.
    Settled,
}

/// Drives incremental compilation over a shared graph and cache.
pub struct IncrementalOrchestrator<C, V> {
    graph: Arc<DependencyGraph>,
    cache: Arc<LayeredCache<V>>,
    compiler: Box<dyn PageCompiler<C, V>>,
    tracker: CompilationTracker,
    policy: InFlightPolicy,
    parallel: bool,
    stale_threshold: Duration,
    /// Pre-invalidation artifacts kept for [`InFlightPolicy::ServeStale`].
    stale: StateCell<HashMap<String, V>>,
}

impl<C, V> std::fmt::Debug for IncrementalOrchestrator<C, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncrementalOrchestrator")
            .field("graph", &self.graph)
            .field("policy", &self.policy)
            .field("parallel", &self.parallel)
            .finish_non_exhaustive()
    }
}

impl<C, V> IncrementalOrchestrator<C, V> {
    /// Creates an orchestrator with default build settings.
    pub fn new(
        graph: Arc<DependencyGraph>,
        cache: Arc<LayeredCache<V>>,
        compiler: impl PageCompiler<C, V> + 'static,
    ) -> Self {
        Self {
            graph,
            cache,
            compiler: Box::new(compiler),
            tracker: CompilationTracker::new(),
            policy: InFlightPolicy::default(),
            parallel: false,
            stale_threshold: BuildSettings::default().stale_in_progress(),
            stale: StateCell::new(HashMap::new()),
        }
    }

    /// Applies `[build]` settings.
    pub fn with_settings(mut self, settings: &BuildSettings) -> Self {
        self.policy = InFlightPolicy::from_settings(settings);
        self.parallel = settings.parallel;
        self.stale_threshold = settings.stale_in_progress();
        self
    }

    /// Sets the in-flight policy.
    pub fn with_policy(mut self, policy: InFlightPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Compiles the nodes of one wave in parallel when `true`.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// The dependency graph.
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// The artifact cache.
    pub fn cache(&self) -> &LayeredCache<V> {
        &self.cache
    }

    /// The per-node compilation states.
    pub fn tracker(&self) -> &CompilationTracker {
        &self.tracker
    }
}

impl<C, V> IncrementalOrchestrator<C, V>
where
    C: Sync,
    V: Clone + Send + Sync + Serialize + DeserializeOwned,
{
    /// Returns the artifact for `page` after applying `changed_files`.
    ///
    /// The changes are invalidated dependency-based. If that touches `page`
    /// it is recompiled; otherwise the cached artifact is served, compiling
    /// only when there is none.
    pub fn compile_incremental<S: AsRef<str>>(
        &self,
        page: &str,
        changed_files: &[S],
        context: &C,
    ) -> Result<CompileOutcome<V>, IncrementalError> {
        let key = CacheKey::page(page);
        let affected = if changed_files.is_empty() {
            false
        } else {
            let seeds: BTreeSet<String> =
                changed_files.iter().map(|f| self.graph.resolve_id(f.as_ref())).collect();
            if InvalidationEngine::affected(&self.graph, &seeds).contains(page) {
                self.stash_stale([page]);
            }
            let report = InvalidationEngine::invalidate_by_strategy(
                &self.cache,
                &self.graph,
                changed_files,
                InvalidationStrategy::DependencyBased,
            );
            report.invalidated.contains(page)
        };

        if !affected {
            if let Some(value) = self.cache.get(&key) {
                tracing::debug!(page, "serving cached artifact");
                return Ok(CompileOutcome::Cached(value));
            }
        }
        self.compile_page(page, context, affected)
    }

    /// Runs a full incremental pass for `changed_files`.
    ///
    /// The affected artifacts are evicted up front, so they are gone even
    /// when a cycle fails the pass. Every node affected by the change is
    /// then driven pending -> in progress -> compiled in dependency order;
    /// pages go through the compiler. Nodes
    /// depending on a failed page are skipped. Afterwards the changed files'
    /// fingerprints are refreshed and the pass state is discarded.
    pub fn compile_pass<S: AsRef<str>>(
        &self,
        changed_files: &[S],
        context: &C,
    ) -> Result<PassReport, IncrementalError> {
        let started = Instant::now();
        let seeds: BTreeSet<String> =
            changed_files.iter().map(|f| self.graph.resolve_id(f.as_ref())).collect();
        let affected = InvalidationEngine::affected(&self.graph, &seeds);

        let affected_pages: Vec<&String> = affected
            .iter()
            .filter(|id| self.kind_of(id) == NodeKind::Page)
            .collect();
        self.stash_stale(affected_pages.iter().map(|id| id.as_str()));

        // Evict first: a pass that cannot be scheduled must not leave
        // outdated artifacts in the cache.
        let invalidation = InvalidationEngine::invalidate_by_strategy(
            &self.cache,
            &self.graph,
            changed_files,
            InvalidationStrategy::DependencyBased,
        );
        let levels = match topological_levels(&self.graph, &affected) {
            Ok(levels) => levels,
            Err(err) => {
                self.release_stale(affected_pages.iter().map(|id| id.as_str()));
                return Err(err);
            }
        };
        self.tracker.reset(&affected);

        let mut report = PassReport {
            changed: invalidation.changed,
            invalidated: invalidation.invalidated,
            evicted: invalidation.evicted,
            levels,
            ..PassReport::default()
        };
        let mut blocked: BTreeSet<String> = BTreeSet::new();

        for level in &report.levels {
            let (runnable, skipped): (Vec<&String>, Vec<&String>) = level.iter().partition(|id| {
                self.graph
                    .get_dependencies(id)
                    .iter()
                    .all(|dep| !blocked.contains(dep))
            });
            for id in skipped {
                tracing::debug!(id = %id, "skipping node with failed dependency");
                self.tracker.mark_pending(id);
                blocked.insert(id.clone());
                report.skipped.push(id.clone());
            }

            let results: Vec<(&String, Result<NodeResult, IncrementalError>)> = if self.parallel {
                runnable
                    .par_iter()
                    .map(|id| (*id, self.drive_node(id, context)))
                    .collect()
            } else {
                runnable
                    .iter()
                    .map(|id| (*id, self.drive_node(id, context)))
                    .collect()
            };

            for (id, result) in results {
                match result {
                    Ok(NodeResult::Compiled) => report.compiled.push(id.clone()),
                    Ok(NodeResult::Settled) => {}
                    Err(err) => {
                        blocked.insert(id.clone());
                        report.failed.insert(id.clone(), err.to_string());
                    }
                }
            }
        }

        self.refresh_fingerprints(&seeds);
        self.tracker.discard(&affected);
        self.release_stale(affected_pages.iter().map(|id| id.as_str()));

        tracing::info!(
            changed = report.changed.len(),
            invalidated = report.invalidated.len(),
            compiled = report.compiled.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "incremental pass finished"
        );
        Ok(report)
    }

    /// Consumes change batches until the channel closes.
    ///
    /// Before each pass, nodes stuck in progress longer than the configured
    /// threshold are reclaimed. `on_pass` receives every pass result.
    pub fn run(
        &self,
        receiver: Receiver<ChangeBatch>,
        context: &C,
        mut on_pass: impl FnMut(Result<PassReport, IncrementalError>),
    ) {
        for batch in receiver {
            if batch.is_empty() {
                continue;
            }
            self.tracker.reclaim_stale(self.stale_threshold);
            tracing::debug!(files = batch.changed.len(), "received change batch");
            on_pass(self.compile_pass(&batch.changed, context));
        }
        tracing::debug!("change channel closed");
    }

    /// Compiles `page` through the dedup gate and caches the artifact.
    ///
    /// Unless `force` is set, an artifact cached by a compilation that
    /// finished before the gate was taken is served instead.
    fn compile_page(
        &self,
        page: &str,
        context: &C,
        force: bool,
    ) -> Result<CompileOutcome<V>, IncrementalError> {
        let key = CacheKey::page(page);
        loop {
            if self.tracker.mark_in_progress(page) {
                if !force {
                    if let Some(value) = self.cache.get(&key) {
                        self.tracker.mark_compiled(page);
                        return Ok(CompileOutcome::Cached(value));
                    }
                }
                return self.run_compiler(page, key, context);
            }
            if let InFlightPolicy::ServeStale { .. } = self.policy {
                if let Some(value) = self.stale.read(|m| m.get(page).cloned()) {
                    tracing::debug!(page, "serving stale artifact while compiling");
                    return Ok(CompileOutcome::Stale(value));
                }
            }
            let timeout = self.policy.timeout();
            if !self.tracker.wait_until_settled(page, timeout) {
                return Err(IncrementalError::InFlightTimeout {
                    id: page.to_string(),
                    waited: timeout,
                });
            }
            if let Some(value) = self.cache.get(&key) {
                return Ok(CompileOutcome::Cached(value));
            }
            // The other compilation failed; try to claim the page ourselves.
        }
    }

    /// Runs the compiler for a page already claimed via the tracker.
    fn run_compiler(
        &self,
        page: &str,
        key: CacheKey,
        context: &C,
    ) -> Result<CompileOutcome<V>, IncrementalError> {
        tracing::debug!(page, "compiling page");
        match self.compiler.compile(page, context) {
            Ok(value) => {
                let stored = self.cache.put(key, value.clone(), PutOptions::default());
                self.tracker.mark_compiled(page);
                self.release_stale([page]);
                stored?;
                Ok(CompileOutcome::Compiled(value))
            }
            Err(source) => {
                tracing::warn!(page, error = %source, "page compilation failed");
                self.tracker.mark_pending(page);
                Err(IncrementalError::Compile {
                    id: page.to_string(),
                    source,
                })
            }
        }
    }

    fn drive_node(&self, id: &str, context: &C) -> Result<NodeResult, IncrementalError> {
        match self.kind_of(id) {
            NodeKind::Page => Ok(match self.compile_page(id, context, true)? {
                CompileOutcome::Compiled(_) => NodeResult::Compiled,
                CompileOutcome::Cached(_) | CompileOutcome::Stale(_) => NodeResult::Settled,
            }),
            NodeKind::File | NodeKind::Token => {
                if self.tracker.mark_in_progress(id) {
                    self.tracker.mark_compiled(id);
                }
                Ok(NodeResult::Settled)
            }
        }
    }

    fn kind_of(&self, id: &str) -> NodeKind {
        self.graph
            .node(id)
            .map_or_else(|| NodeKind::infer_from_id(id), |n| n.kind)
    }

    /// Records the fingerprints the pass compiled against.
    fn refresh_fingerprints(&self, seeds: &BTreeSet<String>) {
        for id in seeds {
            if let Some(path) = self.graph.node(id).and_then(|n| n.metadata.path) {
                self.graph.track_file(&path);
            }
        }
    }

    fn stash_stale<'a>(&self, pages: impl IntoIterator<Item = &'a str>) {
        if !matches!(self.policy, InFlightPolicy::ServeStale { .. }) {
            return;
        }
        let snapshots: Vec<(String, V)> = pages
            .into_iter()
            .filter_map(|page| Some((page.to_string(), self.cache.get(&CacheKey::page(page))?)))
            .collect();
        if !snapshots.is_empty() {
            self.stale.update(|m| m.extend(snapshots));
        }
    }

    fn release_stale<'a>(&self, pages: impl IntoIterator<Item = &'a str>) {
        if !matches!(self.policy, InFlightPolicy::ServeStale { .. }) {
            return;
        }
        self.stale.update(|m| {
            for page in pages {
                m.remove(page);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forma_cache::MemoryCache;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    type Orchestrator = IncrementalOrchestrator<String, String>;

    fn setup(edges: &[(&str, &str)]) -> (Arc<DependencyGraph>, Arc<LayeredCache<String>>) {
        let graph = Arc::new(DependencyGraph::default());
        for (dependent, dependency) in edges {
            graph.add_edge(dependent, dependency);
        }
        let cache = Arc::new(LayeredCache::memory_only(MemoryCache::new(64)));
        (graph, cache)
    }

    fn counting_compiler(calls: Arc<AtomicUsize>) -> impl Fn(&str, &String) -> Result<String, BoxError> {
        move |page: &str, ctx: &String| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{page}@{ctx}"))
        }
    }

    #[test]
    fn compiles_then_serves_cache() {
        let (graph, cache) = setup(&[("home", "src/home.clj")]);
        let calls = Arc::new(AtomicUsize::new(0));
        let orch: Orchestrator = IncrementalOrchestrator::new(graph, cache, counting_compiler(calls.clone()));
        let ctx = "v1".to_string();

        let first = orch.compile_incremental::<&str>("home", &[], &ctx).unwrap();
        assert_eq!(first, CompileOutcome::Compiled("home@v1".to_string()));
        let second = orch.compile_incremental::<&str>("home", &[], &ctx).unwrap();
        assert_eq!(second, CompileOutcome::Cached("home@v1".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn affected_page_is_recompiled() {
        let (graph, cache) = setup(&[("home", "src/home.clj"), ("about", "src/about.clj")]);
        let calls = Arc::new(AtomicUsize::new(0));
        let orch: Orchestrator = IncrementalOrchestrator::new(graph, cache, counting_compiler(calls.clone()));
        let ctx = "v1".to_string();
        orch.compile_incremental::<&str>("home", &[], &ctx).unwrap();
        orch.compile_incremental::<&str>("about", &[], &ctx).unwrap();

        let ctx = "v2".to_string();
        let home = orch.compile_incremental("home", &["src/home.clj"], &ctx).unwrap();
        assert_eq!(home, CompileOutcome::Compiled("home@v2".to_string()));
        let about = orch.compile_incremental("about", &["src/home.clj"], &ctx).unwrap();
        assert_eq!(about, CompileOutcome::Cached("about@v1".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn failed_compile_returns_to_pending() {
        let (graph, cache) = setup(&[]);
        let orch: Orchestrator = IncrementalOrchestrator::new(graph, cache, |page: &str, _: &String| -> Result<String, BoxError> {
            Err(format!("cannot render {page}").into())
        });
        let err = orch.compile_incremental::<&str>("home", &[], &String::new()).unwrap_err();
        assert!(matches!(err, IncrementalError::Compile { ref id, .. } if id == "home"));
        assert_eq!(orch.tracker().state_of("home"), Some(crate::state::CompilationState::Pending));
        assert!(orch.cache().keys().is_empty());
    }

    #[test]
    fn concurrent_requests_compile_once() {
        let (graph, cache) = setup(&[]);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let orch: Arc<Orchestrator> = Arc::new(IncrementalOrchestrator::new(
            graph,
            cache,
            move |page: &str, _: &String| -> Result<String, BoxError> {
                counter.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(50));
                Ok(page.to_uppercase())
            },
        ));

        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let orch = Arc::clone(&orch);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    orch.compile_incremental::<&str>("home", &[], &String::new())
                        .unwrap()
                        .into_value()
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), "HOME");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn serve_stale_returns_previous_artifact() {
        let (graph, cache) = setup(&[("home", "src/home.clj")]);
        let gate = Arc::new(Barrier::new(2));
        let compiler_gate = gate.clone();
        let orch: Arc<Orchestrator> = Arc::new(
            IncrementalOrchestrator::new(graph, cache, move |page: &str, ctx: &String| -> Result<String, BoxError> {
                if ctx == "slow" {
                    compiler_gate.wait();
                    std::thread::sleep(Duration::from_millis(50));
                }
                Ok(format!("{page}@{ctx}"))
            })
            .with_policy(InFlightPolicy::ServeStale {
                timeout: Duration::from_secs(5),
            }),
        );
        orch.compile_incremental::<&str>("home", &[], &"v1".to_string()).unwrap();

        let slow = {
            let orch = Arc::clone(&orch);
            std::thread::spawn(move || {
                orch.compile_incremental("home", &["src/home.clj"], &"slow".to_string())
                    .unwrap()
            })
        };
        gate.wait();
        let served = orch.compile_incremental::<&str>("home", &[], &"fast".to_string()).unwrap();
        assert_eq!(served, CompileOutcome::Stale("home@v1".to_string()));
        assert_eq!(slow.join().unwrap(), CompileOutcome::Compiled("home@slow".to_string()));
    }

    #[test]
    fn wait_policy_times_out() {
        let (graph, cache) = setup(&[]);
        let orch: Orchestrator = IncrementalOrchestrator::new(graph, cache, counting_compiler(Arc::default()))
            .with_policy(InFlightPolicy::Wait {
                timeout: Duration::from_millis(20),
            });
        orch.tracker().mark_in_progress("home");
        let err = orch.compile_incremental::<&str>("home", &[], &String::new()).unwrap_err();
        assert!(matches!(err, IncrementalError::InFlightTimeout { .. }));
    }

    #[test]
    fn pass_compiles_affected_pages_in_order() {
        let (graph, cache) = setup(&[
            ("layout", "src/layout.clj"),
            ("home", "layout"),
            ("about", "src/about.clj"),
        ]);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = order.clone();
        let orch: Orchestrator = IncrementalOrchestrator::new(graph, cache, move |page: &str, _: &String| -> Result<String, BoxError> {
            seen.lock().unwrap().push(page.to_string());
            Ok(page.to_string())
        });

        let report = orch.compile_pass(&["src/layout.clj"], &String::new()).unwrap();
        assert_eq!(
            report.levels,
            vec![vec!["src/layout.clj"], vec!["layout"], vec!["home"]]
        );
        assert_eq!(report.compiled, vec!["layout", "home"]);
        assert!(report.is_success());
        assert_eq!(*order.lock().unwrap(), vec!["layout", "home"]);
        assert!(orch.tracker().compiled().is_empty(), "pass state is discarded");
        assert!(orch.cache().get(&CacheKey::page("home")).is_some());
        assert!(orch.cache().get(&CacheKey::page("about")).is_none());
    }

    #[test]
    fn pass_skips_dependents_of_failures() {
        let (graph, cache) = setup(&[("layout", "src/layout.clj"), ("home", "layout"), ("blog", "src/layout.clj")]);
        let orch: Orchestrator = IncrementalOrchestrator::new(graph, cache, |page: &str, _: &String| -> Result<String, BoxError> {
            if page == "layout" {
                Err("broken layout".into())
            } else {
                Ok(page.to_string())
            }
        });
        let report = orch.compile_pass(&["src/layout.clj"], &String::new()).unwrap();
        assert_eq!(report.compiled, vec!["blog"]);
        assert_eq!(report.skipped, vec!["home"]);
        assert!(report.failed["layout"].contains("broken layout"));
        assert!(!report.is_success());
    }

    #[test]
    fn pass_fails_on_cycle() {
        let (graph, cache) = setup(&[("a", "b"), ("b", "a"), ("b", "src/x.clj")]);
        let orch: Orchestrator = IncrementalOrchestrator::new(graph, cache, counting_compiler(Arc::default()));
        let err = orch.compile_pass(&["src/x.clj"], &String::new()).unwrap_err();
        assert!(matches!(err, IncrementalError::Cycle { .. }));
    }

    #[test]
    fn failed_pass_still_evicts_outdated_artifacts() {
        let (graph, cache) = setup(&[("a", "b"), ("b", "a"), ("b", "src/x.clj"), ("c", "src/y.clj")]);
        let calls = Arc::new(AtomicUsize::new(0));
        let orch: Orchestrator = IncrementalOrchestrator::new(graph, cache, counting_compiler(calls.clone()));
        orch.compile_incremental::<&str>("a", &[], &"v1".to_string()).unwrap();
        orch.compile_incremental::<&str>("c", &[], &"v1".to_string()).unwrap();

        let v2 = "v2".to_string();
        assert!(orch.compile_pass(&["src/x.clj"], &v2).is_err());
        assert_eq!(orch.cache().get(&CacheKey::page("a")), None);
        assert_eq!(orch.cache().get(&CacheKey::page("c")).as_deref(), Some("c@v1"));

        let a = orch.compile_incremental::<&str>("a", &[], &v2).unwrap();
        assert_eq!(a, CompileOutcome::Compiled("a@v2".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn parallel_pass_compiles_every_page() {
        let edges: Vec<(String, &str)> = (0..16).map(|i| (format!("page{i}"), "src/shared.clj")).collect();
        let graph = Arc::new(DependencyGraph::default());
        for (dependent, dependency) in &edges {
            graph.add_edge(dependent, dependency);
        }
        let cache = Arc::new(LayeredCache::memory_only(MemoryCache::new(64)));
        let calls = Arc::new(AtomicUsize::new(0));
        let orch: Orchestrator = IncrementalOrchestrator::new(graph, cache, counting_compiler(calls.clone()))
            .with_parallel(true);

        let report = orch.compile_pass(&["src/shared.clj"], &"ctx".to_string()).unwrap();
        assert_eq!(report.compiled.len(), 16);
        assert_eq!(calls.load(Ordering::SeqCst), 16);
        assert_eq!(orch.cache().keys().len(), 16);
    }

    #[test]
    fn policy_from_settings() {
        let mut settings = BuildSettings::default();
        settings.in_flight = InFlightMode::ServeStale;
        settings.in_flight_timeout_ms = 250;
        assert_eq!(
            InFlightPolicy::from_settings(&settings),
            InFlightPolicy::ServeStale {
                timeout: Duration::from_millis(250)
            }
        );
    }
}
