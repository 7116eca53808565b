//! Polling change watcher.
//!
//! A dedicated thread re-fingerprints every tracked file on an interval and
//! pushes the ids that changed onto a bounded channel. The consumer side is
//! [`IncrementalOrchestrator::run`](crate::IncrementalOrchestrator::run).
//! Dropping the watcher stops and joins the thread; dropping the receiver
//! makes the thread exit at its next send.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use forma_common::Fingerprint;
use forma_config::WatchSettings;
use forma_graph::{normalize_path, DependencyGraph};

/// File ids that changed since the previous batch, sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeBatch {
    /// Normalized ids of the changed files.
    pub changed: Vec<String>,
}

impl ChangeBatch {
    /// Returns `true` if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
    }

    /// Number of changed files.
    pub fn len(&self) -> usize {
        self.changed.len()
    }

    /// Folds `other` into this batch, keeping ids sorted and unique.
    pub fn merge(&mut self, other: ChangeBatch) {
        if other.is_empty() {
            return;
        }
        let merged: BTreeSet<String> = self.changed.drain(..).chain(other.changed).collect();
        self.changed = merged.into_iter().collect();
    }
}

/// Compares tracked files against what was last observed.
///
/// The first observation of a file is compared against the fingerprint the
/// graph recorded for it; later ones against the previous observation, so a
/// change is reported once even before the graph is refreshed.
struct Poller {
    graph: Arc<DependencyGraph>,
    seen: HashMap<PathBuf, Option<Fingerprint>>,
}

impl Poller {
    fn new(graph: Arc<DependencyGraph>) -> Self {
        Self {
            graph,
            seen: HashMap::new(),
        }
    }

    fn poll(&mut self) -> ChangeBatch {
        let mut changed = BTreeSet::new();
        for path in self.graph.tracked_files() {
            let current = self.graph.fingerprint(&path);
            let baseline = match self.seen.get(&path) {
                Some(previous) => *previous,
                None => self.graph.recorded_fingerprint(&path),
            };
            if current != baseline {
                changed.insert(normalize_path(&path));
            }
            self.seen.insert(path, current);
        }
        ChangeBatch {
            changed: changed.into_iter().collect(),
        }
    }
}

/// Handle to the polling thread.
#[derive(Debug)]
pub struct ChangeWatcher {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ChangeWatcher {
    /// Starts watching the files tracked by `graph`.
    ///
    /// Returns the handle and the receiving end of a channel holding at most
    /// `settings.channel_capacity` batches. When the channel is full, new
    /// changes are merged into the next batch instead of blocking.
    pub fn spawn(
        graph: Arc<DependencyGraph>,
        settings: &WatchSettings,
    ) -> io::Result<(Self, Receiver<ChangeBatch>)> {
        let (tx, rx) = mpsc::sync_channel(settings.channel_capacity.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let interval = settings.poll_interval();
        let mut poller = Poller::new(graph);

        let handle = thread::Builder::new()
            .name("forma-watch".to_string())
            .spawn(move || {
                let mut pending = ChangeBatch::default();
                while !stop_flag.load(Ordering::Relaxed) {
                    pending.merge(poller.poll());
                    if !pending.is_empty() {
                        match tx.try_send(std::mem::take(&mut pending)) {
                            Ok(()) => {}
                            Err(TrySendError::Full(batch)) => {
                                tracing::debug!(files = batch.len(), "change channel full, deferring batch");
                                pending = batch;
                            }
                            Err(TrySendError::Disconnected(_)) => {
                                tracing::debug!("change receiver dropped, stopping watcher");
                                return;
                            }
                        }
                    }
                    thread::park_timeout(interval);
                }
            })?;

        tracing::debug!(?interval, "change watcher started");
        Ok((
            Self {
                stop,
                handle: Some(handle),
            },
            rx,
        ))
    }

    /// Returns `true` while the polling thread is alive.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stops the thread and waits for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                tracing::warn!("change watcher thread panicked");
            }
        }
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{Duration, Instant};

    fn settings() -> WatchSettings {
        WatchSettings {
            poll_interval_ms: 10,
            channel_capacity: 4,
        }
    }

    #[test]
    fn merge_sorts_and_dedups() {
        let mut batch = ChangeBatch {
            changed: vec!["b.clj".into(), "d.clj".into()],
        };
        batch.merge(ChangeBatch {
            changed: vec!["a.clj".into(), "b.clj".into()],
        });
        assert_eq!(batch.changed, vec!["a.clj", "b.clj", "d.clj"]);
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn poller_reports_each_change_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.clj");
        fs::write(&path, "[:div]").unwrap();
        let graph = Arc::new(DependencyGraph::default());
        let id = graph.track_file(&path);
        let mut poller = Poller::new(Arc::clone(&graph));

        assert!(poller.poll().is_empty());
        fs::write(&path, "[:span]").unwrap();
        assert_eq!(poller.poll().changed, vec![id.clone()]);
        assert!(poller.poll().is_empty());

        fs::remove_file(&path).unwrap();
        assert_eq!(poller.poll().changed, vec![id]);
    }

    #[test]
    fn poller_baseline_is_recorded_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.clj");
        fs::write(&path, "v1").unwrap();
        let graph = Arc::new(DependencyGraph::default());
        graph.track_file(&path);
        fs::write(&path, "v2").unwrap();

        let mut poller = Poller::new(graph);
        assert_eq!(poller.poll().len(), 1);
    }

    #[test]
    fn watcher_delivers_batches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.edn");
        fs::write(&path, "{}").unwrap();
        let graph = Arc::new(DependencyGraph::default());
        let id = graph.track_file(&path);

        let (watcher, rx) = ChangeWatcher::spawn(Arc::clone(&graph), &settings()).unwrap();
        assert!(watcher.is_running());
        fs::write(&path, "{:color \"red\"}").unwrap();

        let batch = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(batch.changed, vec![id]);

        watcher.stop();
        let _late: Vec<ChangeBatch> = rx.try_iter().collect();
        assert!(
            matches!(rx.try_recv(), Err(mpsc::TryRecvError::Disconnected)),
            "channel closes after stop"
        );
    }

    #[test]
    fn watcher_exits_when_receiver_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.clj");
        fs::write(&path, "a").unwrap();
        let graph = Arc::new(DependencyGraph::default());
        graph.track_file(&path);

        let (watcher, rx) = ChangeWatcher::spawn(graph, &settings()).unwrap();
        drop(rx);
        fs::write(&path, "changed").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while watcher.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!watcher.is_running());
    }
}
