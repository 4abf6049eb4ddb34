//! Keyed store of live sessions.
//!
//! Mutations of one `(device, kind)` key are serialized through a per-key
//! slot lock, so a replace always finishes stopping the previous session
//! before the next one is spawned. Different keys never wait on each other,
//! and status reads take no slot lock at all.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, instrument, warn};

use super::task::SessionTask;
use super::worker::Session;
use super::{Readiness, SessionError, SessionKey, SessionKind, SessionState, SessionTimeouts};

/// Reported liveness of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub active: bool,
}

/// At most one session per `(device, kind)`.
///
/// All methods except the status reads block; call them from
/// `spawn_blocking` when on an async runtime.
pub struct SessionRegistry {
    timeouts: SessionTimeouts,
    entries: DashMap<SessionKey, Arc<Session>>,
    slots: DashMap<SessionKey, Arc<Mutex<()>>>,
}

impl SessionRegistry {
    pub fn new(timeouts: SessionTimeouts) -> Self {
        Self {
            timeouts,
            entries: DashMap::new(),
            slots: DashMap::new(),
        }
    }

    pub fn timeouts(&self) -> SessionTimeouts {
        self.timeouts
    }

    fn slot(&self, key: &SessionKey) -> Arc<Mutex<()>> {
        Arc::clone(self.slots.entry(key.clone()).or_default().value())
    }

    /// Drop the slot of a key with no registered session, unless another
    /// caller is holding or waiting on it. Call while holding `slot`.
    fn release_slot(&self, key: &SessionKey, slot: &Arc<Mutex<()>>) {
        if self.entries.contains_key(key) {
            return;
        }
        // One reference in the map, one held by the caller.
        self.slots.remove_if(key, |_, current| {
            Arc::ptr_eq(current, slot) && Arc::strong_count(current) == 2
        });
    }

    /// Stop any session already registered for this device and kind, then
    /// start `task` in a fresh one and wait for its readiness.
    ///
    /// The new session is registered before the wait so it can always be
    /// stopped. If it never becomes ready it is stopped and unregistered.
    #[instrument(skip(self, task), fields(kind = %task.kind()))]
    pub fn start_or_replace(
        &self,
        device_id: &str,
        task: Box<dyn SessionTask>,
    ) -> Result<Readiness, SessionError> {
        let key = SessionKey::new(device_id, task.kind());
        let slot = self.slot(&key);
        let _guard = slot.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some((_, previous)) = self.entries.remove(&key) {
            info!(%key, "Replacing existing session");
            previous.stop();
        }

        let session = Arc::new(Session::new(key.clone(), self.timeouts));
        self.entries.insert(key.clone(), Arc::clone(&session));

        if session.start(task) {
            if let Some(readiness) = session.readiness() {
                info!(%key, "Session started");
                return Ok(readiness);
            }
        }

        let failed = session.state() == SessionState::Failed;
        self.entries
            .remove_if(&key, |_, registered| Arc::ptr_eq(registered, &session));
        session.stop();
        self.release_slot(&key, &slot);

        if failed {
            let reason = session
                .failure()
                .unwrap_or_else(|| "session ended before it was ready".to_string());
            warn!(%key, %reason, "Session failed to start");
            Err(SessionError::StartFailed { key, reason })
        } else {
            warn!(%key, waited = ?self.timeouts.ready, "Session did not become ready");
            Err(SessionError::ReadinessTimeout {
                key,
                waited: self.timeouts.ready,
            })
        }
    }

    /// Unregister and stop a session. Returns false if none was registered.
    ///
    /// Returns true even when the worker outlives the stop timeout.
    #[instrument(skip(self))]
    pub fn stop(&self, device_id: &str, kind: SessionKind) -> bool {
        let key = SessionKey::new(device_id, kind);
        let slot = self.slot(&key);
        let _guard = slot.lock().unwrap_or_else(PoisonError::into_inner);

        let stopped = match self.entries.remove(&key) {
            Some((_, session)) => {
                session.stop();
                info!(%key, state = ?session.state(), "Session stopped");
                true
            }
            None => false,
        };
        self.release_slot(&key, &slot);
        stopped
    }

    pub fn get(&self, device_id: &str, kind: SessionKind) -> Option<Arc<Session>> {
        self.entries
            .get(&SessionKey::new(device_id, kind))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Liveness of every registered session of `kind`, by device.
    pub fn status_all(&self, kind: SessionKind) -> BTreeMap<String, SessionStatus> {
        self.sessions(kind)
            .into_iter()
            .map(|session| {
                (
                    session.key().device_id.clone(),
                    SessionStatus {
                        active: session.is_active(),
                    },
                )
            })
            .collect()
    }

    pub fn status_one(&self, device_id: &str, kind: SessionKind) -> Option<SessionStatus> {
        self.get(device_id, kind).map(|session| SessionStatus {
            active: session.is_active(),
        })
    }

    /// Number of registered sessions of `kind` whose worker is running.
    pub fn active_count(&self, kind: SessionKind) -> usize {
        self.sessions(kind).iter().filter(|s| s.is_active()).count()
    }

    fn sessions(&self, kind: SessionKind) -> Vec<Arc<Session>> {
        self.entries
            .iter()
            .filter(|entry| entry.key().kind == kind)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Stop every session: locations first, since they ride on tunnels.
    #[instrument(skip(self))]
    pub fn shutdown(&self) {
        for kind in [SessionKind::Location, SessionKind::Tunnel] {
            let devices: Vec<String> = self
                .sessions(kind)
                .iter()
                .map(|s| s.key().device_id.clone())
                .collect();

            for device_id in devices {
                self.stop(&device_id, kind);
            }
        }
        info!("All sessions stopped");
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            warn!(count = self.entries.len(), "Registry dropped with live sessions");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RsdEndpoint;
    use crate::session::TaskContext;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    fn registry() -> SessionRegistry {
        SessionRegistry::new(SessionTimeouts {
            ready: Duration::from_millis(300),
            stop: Duration::from_millis(500),
            teardown_grace: Duration::from_millis(50),
        })
    }

    #[derive(Default)]
    struct Probe {
        live: AtomicUsize,
        max_live: AtomicUsize,
        events: Mutex<Vec<String>>,
    }

    impl Probe {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    /// Records start/exit markers and tracks concurrent live workers.
    struct Tracked {
        label: String,
        port: u16,
        ready: bool,
        probe: Arc<Probe>,
    }

    impl Tracked {
        fn new(label: &str, probe: &Arc<Probe>) -> Box<Self> {
            Box::new(Self {
                label: label.to_string(),
                port: 1234,
                ready: true,
                probe: Arc::clone(probe),
            })
        }
    }

    impl SessionTask for Tracked {
        fn kind(&self) -> SessionKind {
            SessionKind::Tunnel
        }

        fn run(self: Box<Self>, ctx: TaskContext) -> BoxFuture<'static, Result<(), SessionError>> {
            Box::pin(async move {
                let Tracked {
                    label,
                    port,
                    ready,
                    probe,
                } = *self;
                let now = probe.live.fetch_add(1, Ordering::SeqCst) + 1;
                probe.max_live.fetch_max(now, Ordering::SeqCst);
                probe.events.lock().unwrap().push(format!("start:{label}"));

                if ready {
                    ctx.publish(Readiness::Tunnel(RsdEndpoint::new("10.0.0.1", port)));
                }
                ctx.cancelled().await;

                probe.events.lock().unwrap().push(format!("exit:{label}"));
                probe.live.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    struct FailsFast;

    impl SessionTask for FailsFast {
        fn kind(&self) -> SessionKind {
            SessionKind::Tunnel
        }

        fn run(self: Box<Self>, _ctx: TaskContext) -> BoxFuture<'static, Result<(), SessionError>> {
            Box::pin(async move {
                Err(crate::device::DeviceError::Transport("pairing refused".into()).into())
            })
        }
    }

    #[test]
    fn test_start_registers_and_reports_readiness() {
        let reg = registry();
        let probe = Arc::new(Probe::default());

        let readiness = reg.start_or_replace("ABC", Tracked::new("1", &probe)).unwrap();
        assert_eq!(readiness, Readiness::Tunnel(RsdEndpoint::new("10.0.0.1", 1234)));
        assert_eq!(
            reg.status_one("ABC", SessionKind::Tunnel),
            Some(SessionStatus { active: true })
        );
        assert_eq!(reg.status_one("ABC", SessionKind::Location), None);
        assert_eq!(reg.active_count(SessionKind::Tunnel), 1);

        reg.shutdown();
        assert_eq!(probe.live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_replace_stops_previous_before_starting_next() {
        let reg = registry();
        let probe = Arc::new(Probe::default());

        reg.start_or_replace("ABC", Tracked::new("1", &probe)).unwrap();
        reg.start_or_replace("ABC", Tracked::new("2", &probe)).unwrap();

        assert_eq!(probe.events(), vec!["start:1", "exit:1", "start:2"]);
        assert_eq!(reg.status_all(SessionKind::Tunnel).len(), 1);
        reg.shutdown();
    }

    #[test]
    fn test_concurrent_replace_never_overlaps() {
        let reg = Arc::new(registry());
        let probe = Arc::new(Probe::default());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let reg = Arc::clone(&reg);
                let probe = Arc::clone(&probe);
                thread::spawn(move || {
                    reg.start_or_replace("ABC", Tracked::new(&i.to_string(), &probe))
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(probe.max_live.load(Ordering::SeqCst), 1);
        assert_eq!(reg.status_all(SessionKind::Tunnel).len(), 1);
        reg.shutdown();
        assert_eq!(probe.live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_different_devices_run_side_by_side() {
        let reg = registry();
        let probe = Arc::new(Probe::default());

        reg.start_or_replace("A", Tracked::new("a", &probe)).unwrap();
        reg.start_or_replace("B", Tracked::new("b", &probe)).unwrap();

        assert_eq!(probe.max_live.load(Ordering::SeqCst), 2);
        let status = reg.status_all(SessionKind::Tunnel);
        assert_eq!(status.keys().collect::<Vec<_>>(), vec!["A", "B"]);
        reg.shutdown();
    }

    #[test]
    fn test_stop_twice_reports_not_found() {
        let reg = registry();
        let probe = Arc::new(Probe::default());

        assert!(!reg.stop("ABC", SessionKind::Tunnel));
        reg.start_or_replace("ABC", Tracked::new("1", &probe)).unwrap();

        assert!(reg.stop("ABC", SessionKind::Tunnel));
        assert!(!reg.stop("ABC", SessionKind::Tunnel));
        assert_eq!(probe.events(), vec!["start:1", "exit:1"]);
    }

    #[test]
    fn test_slots_are_released_with_their_sessions() {
        let reg = registry();
        let probe = Arc::new(Probe::default());

        reg.start_or_replace("A", Tracked::new("a", &probe)).unwrap();
        reg.start_or_replace("B", Tracked::new("b", &probe)).unwrap();
        assert_eq!(reg.slots.len(), 2);

        reg.stop("A", SessionKind::Tunnel);
        assert_eq!(reg.slots.len(), 1);
        assert!(!reg.stop("never-seen", SessionKind::Location));
        assert_eq!(reg.slots.len(), 1);

        let mut task = Tracked::new("c", &probe);
        task.ready = false;
        assert!(reg.start_or_replace("C", task).is_err());
        assert_eq!(reg.slots.len(), 1);

        reg.shutdown();
        assert!(reg.slots.is_empty());
    }

    #[test]
    fn test_readiness_timeout_leaves_nothing_running() {
        let reg = registry();
        let probe = Arc::new(Probe::default());
        let mut task = Tracked::new("never", &probe);
        task.ready = false;

        let started = Instant::now();
        let err = reg.start_or_replace("ABC", task).unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(matches!(err, SessionError::ReadinessTimeout { .. }));

        assert!(reg.get("ABC", SessionKind::Tunnel).is_none());
        assert_eq!(probe.live.load(Ordering::SeqCst), 0);
        assert_eq!(probe.events(), vec!["start:never", "exit:never"]);
    }

    #[test]
    fn test_failed_start_reports_reason() {
        let reg = registry();

        let started = Instant::now();
        let err = reg.start_or_replace("ABC", Box::new(FailsFast)).unwrap_err();
        assert!(started.elapsed() < Duration::from_millis(300));
        match err {
            SessionError::StartFailed { key, reason } => {
                assert_eq!(key, SessionKey::new("ABC", SessionKind::Tunnel));
                assert!(reason.contains("pairing refused"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(reg.status_all(SessionKind::Tunnel).is_empty());
    }
}
