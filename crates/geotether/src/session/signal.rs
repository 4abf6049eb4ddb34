//! Primitives shared between a session's worker and its owner.
//!
//! The owner lives on arbitrary request threads and blocks; the worker runs a
//! cooperative scheduler. [`CancelSignal`] crosses inward (any thread raises,
//! the session's runtime is woken directly). [`Milestones`] crosses outward
//! (the worker publishes, blocked owners are woken through a condvar).

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{Readiness, SessionState};

/// One-shot, idempotent request to stop a session.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    token: CancellationToken,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Safe from any thread, any number of times.
    pub fn raise(&self) {
        self.token.cancel();
    }

    pub fn is_raised(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once [`raise`](Self::raise) has been called.
    pub async fn raised(&self) {
        self.token.cancelled().await
    }
}

#[derive(Debug)]
struct Inner {
    state: SessionState,
    readiness: Option<Readiness>,
    failure: Option<String>,
    exited: bool,
}

/// Readiness and exit of one session, observable from blocking code.
#[derive(Debug)]
pub struct Milestones {
    inner: Mutex<Inner>,
    changed: Condvar,
}

impl Default for Milestones {
    fn default() -> Self {
        Self::new()
    }
}

impl Milestones {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: SessionState::Starting,
                readiness: None,
                failure: None,
                exited: false,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record readiness and move `Starting -> Active`.
    ///
    /// Returns false if readiness was already set or the session is no
    /// longer starting (a stop got there first).
    pub fn publish(&self, readiness: Readiness) -> bool {
        let mut inner = self.lock();
        if inner.readiness.is_some() || inner.state != SessionState::Starting {
            return false;
        }
        inner.readiness = Some(readiness);
        inner.state = SessionState::Active;
        self.changed.notify_all();
        true
    }

    /// Mark that a stop has been requested. Terminal states are left alone.
    pub fn begin_stopping(&self) {
        let mut inner = self.lock();
        if matches!(inner.state, SessionState::Starting | SessionState::Active) {
            inner.state = SessionState::Stopping;
            self.changed.notify_all();
        }
    }

    /// Record that the worker has released its runtime and is exiting.
    pub fn finish(&self, state: SessionState, failure: Option<String>) {
        let mut inner = self.lock();
        inner.state = state;
        if failure.is_some() {
            inner.failure = failure;
        }
        inner.exited = true;
        self.changed.notify_all();
    }

    /// Block until readiness is published, the worker exits, or `timeout`
    /// elapses. Returns the readiness if it was published.
    pub fn wait_ready(&self, timeout: Duration) -> Option<Readiness> {
        let guard = self.lock();
        let (inner, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |i| i.readiness.is_none() && !i.exited)
            .unwrap_or_else(PoisonError::into_inner);
        inner.readiness.clone()
    }

    /// Block until the worker exits or `timeout` elapses. Returns whether it
    /// exited.
    pub fn wait_exited(&self, timeout: Duration) -> bool {
        let guard = self.lock();
        let (inner, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |i| !i.exited)
            .unwrap_or_else(PoisonError::into_inner);
        inner.exited
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn readiness(&self) -> Option<Readiness> {
        self.lock().readiness.clone()
    }

    pub fn failure(&self) -> Option<String> {
        self.lock().failure.clone()
    }

    pub fn has_exited(&self) -> bool {
        self.lock().exited
    }
}
