//! A shared cell whose whole state changes through atomic read-modify-write.
//!
//! Every cache, graph and compilation tracker keeps its entire state in one
//! `StateCell`. A mutation is a closure from the old state to the new one and
//! runs as a single critical section, so concurrent callers never observe or
//! produce a torn update. Waiters can block until the state satisfies a
//! predicate; every update wakes them.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Shared state updated only through whole-state transitions.
///
/// A panic inside an update closure does not poison the cell; later callers
/// see whatever state the closure left behind.
#[derive(Debug, Default)]
pub struct StateCell<T> {
    state: Mutex<T>,
    changed: Condvar,
}

impl<T> StateCell<T> {
    /// Creates a cell holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            state: Mutex::new(value),
            changed: Condvar::new(),
        }
    }

    /// Runs `f` against a consistent view of the current state.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.lock();
        f(&guard)
    }

    /// Applies `f` as one atomic transition and wakes every waiter.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let result = {
            let mut guard = self.lock();
            f(&mut guard)
        };
        self.changed.notify_all();
        result
    }

    /// Blocks until `ready` yields a value or `timeout` elapses.
    ///
    /// `ready` is evaluated immediately and again after every update.
    /// Returns `None` on timeout.
    pub fn wait_until<R>(
        &self,
        timeout: Duration,
        mut ready: impl FnMut(&T) -> Option<R>,
    ) -> Option<R> {
        let deadline = Instant::now().checked_add(timeout);
        let mut guard = self.lock();
        loop {
            if let Some(result) = ready(&guard) {
                return Some(result);
            }
            guard = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    self.changed
                        .wait_timeout(guard, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .changed
                    .wait(guard)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    /// Consumes the cell and returns the state.
    pub fn into_inner(self) -> T {
        self.state.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock(&self) -> MutexGuard<'_, T> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone> StateCell<T> {
    /// Returns a copy of the current state.
    pub fn snapshot(&self) -> T {
        self.read(T::clone)
    }
}
