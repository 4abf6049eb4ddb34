//! One session: a dedicated worker thread running a private runtime.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::signal::{CancelSignal, Milestones};
use super::task::{SessionTask, TaskContext};
use super::{Readiness, SessionKey, SessionState, SessionTimeouts};

/// A long-lived device operation with its own worker thread.
///
/// `start` and `stop` block the calling thread; call them from
/// `spawn_blocking` when on an async runtime.
pub struct Session {
    key: SessionKey,
    timeouts: SessionTimeouts,
    cancel: CancelSignal,
    milestones: Arc<Milestones>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub fn new(key: SessionKey, timeouts: SessionTimeouts) -> Self {
        Self {
            key,
            timeouts,
            cancel: CancelSignal::new(),
            milestones: Arc::new(Milestones::new()),
            worker: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn state(&self) -> SessionState {
        self.milestones.state()
    }

    pub fn readiness(&self) -> Option<Readiness> {
        self.milestones.readiness()
    }

    /// Why the session body failed, if it did.
    pub fn failure(&self) -> Option<String> {
        self.milestones.failure()
    }

    fn worker(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Launch the worker and block until the task publishes readiness, the
    /// worker exits, or the ready timeout elapses.
    ///
    /// On `false` the worker may still be running; callers that abandon the
    /// session must call [`stop`](Self::stop).
    pub fn start(&self, task: Box<dyn SessionTask>) -> bool {
        {
            let mut worker = self.worker();
            if worker.is_some() || self.milestones.has_exited() {
                warn!(key = %self.key, "Session already started");
                return self.milestones.readiness().is_some();
            }

            let ctx = TaskContext::new(
                self.key.clone(),
                self.cancel.clone(),
                Arc::clone(&self.milestones),
            );
            let milestones = Arc::clone(&self.milestones);
            let key = self.key.clone();
            let grace = self.timeouts.teardown_grace;

            let spawned = thread::Builder::new()
                .name(format!("session-{}", self.key))
                .spawn(move || drive(key, task, ctx, milestones, grace));

            match spawned {
                Ok(handle) => *worker = Some(handle),
                Err(e) => {
                    error!(key = %self.key, error = %e, "Failed to spawn session worker");
                    self.milestones
                        .finish(SessionState::Failed, Some(format!("worker spawn failed: {e}")));
                    return false;
                }
            }
        }

        debug!(key = %self.key, timeout = ?self.timeouts.ready, "Waiting for readiness");
        match self.milestones.wait_ready(self.timeouts.ready) {
            Some(_) => true,
            None => {
                warn!(key = %self.key, state = ?self.state(), "Session not ready");
                false
            }
        }
    }

    /// Whether the worker thread is still running.
    pub fn is_active(&self) -> bool {
        self.worker()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Ask the session to stop and wait up to the stop timeout for its
    /// worker to exit. Safe to call repeatedly and from any thread.
    ///
    /// A worker that does not exit in time is left running; `stop` still
    /// returns.
    pub fn stop(&self) {
        self.cancel.raise();
        self.milestones.begin_stopping();

        // The handle stays in place during the wait so `is_active` keeps
        // seeing the live worker.
        if self.worker().is_none() {
            return;
        }

        if !self.milestones.wait_exited(self.timeouts.stop) {
            warn!(
                key = %self.key,
                timeout = ?self.timeouts.stop,
                "Session worker did not exit in time; leaving it to finish"
            );
            return;
        }

        let Some(handle) = self.worker().take() else {
            return;
        };
        if handle.join().is_err() {
            warn!(key = %self.key, "Session worker panicked outside its task");
        }
        debug!(key = %self.key, state = ?self.state(), "Session stopped");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Detached workers still see the signal and wind down on their own.
        self.cancel.raise();
    }
}

/// Worker thread body.
fn drive(
    key: SessionKey,
    task: Box<dyn SessionTask>,
    ctx: TaskContext,
    milestones: Arc<Milestones>,
    grace: Duration,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(%key, error = %e, "Failed to build session runtime");
            milestones.finish(SessionState::Failed, Some(format!("runtime build failed: {e}")));
            return;
        }
    };

    debug!(%key, "Session worker running");
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| runtime.block_on(task.run(ctx))));

    // Cancel whatever the body left scheduled before reporting exit.
    runtime.shutdown_timeout(grace);

    match outcome {
        Ok(Ok(())) => {
            info!(%key, "Session ended");
            milestones.finish(SessionState::Stopped, None);
        }
        Ok(Err(e)) => {
            warn!(%key, error = %e, "Session failed");
            milestones.finish(SessionState::Failed, Some(e.to_string()));
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(%key, panic = %message, "Session panicked");
            milestones.finish(SessionState::Failed, Some(format!("panicked: {message}")));
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
