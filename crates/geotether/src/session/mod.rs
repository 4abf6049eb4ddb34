//! Device session lifecycle.
//!
//! A session is one long-lived device operation (a tunnel, or a simulated
//! location) bound to a device and a [`SessionKind`]. Each session runs on
//! its own OS thread with its own single-threaded tokio runtime, so a
//! misbehaving device protocol can stall only its own session.
//!
//! - [`signal`]: cancellation and the readiness/exit milestones shared
//!   between a session's worker and its owner
//! - [`worker`]: [`Session`], the worker thread and its blocking start/stop
//! - [`task`]: the bodies that run inside a session's runtime
//! - [`registry`]: [`SessionRegistry`], at most one live session per key

pub mod registry;
pub mod signal;
pub mod task;
pub mod worker;

pub use registry::{SessionRegistry, SessionStatus};
pub use signal::{CancelSignal, Milestones};
pub use task::{LocationTask, SessionTask, TaskContext, TunnelTask};
pub use worker::Session;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::{Coordinate, DeviceError, RsdEndpoint};

/// What a session does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Tunnel,
    Location,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::Tunnel => write!(f, "tunnel"),
            SessionKind::Location => write!(f, "location"),
        }
    }
}

/// Registry key: one device, one kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub device_id: String,
    pub kind: SessionKind,
}

impl SessionKey {
    pub fn new(device_id: impl Into<String>, kind: SessionKind) -> Self {
        Self {
            device_id: device_id.into(),
            kind,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.device_id)
    }
}

/// Lifecycle state of a session.
///
/// `Starting -> Active -> Stopping -> Stopped`, with `Failed` reachable from
/// any non-terminal state when the session body errors or panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Starting,
    Active,
    Stopping,
    Stopped,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Failed)
    }
}

/// What a session publishes once its operation is live. Set at most once.
#[derive(Debug, Clone, PartialEq)]
pub enum Readiness {
    Tunnel(RsdEndpoint),
    Location(Coordinate),
}

impl Readiness {
    pub fn endpoint(&self) -> Option<&RsdEndpoint> {
        match self {
            Readiness::Tunnel(endpoint) => Some(endpoint),
            Readiness::Location(_) => None,
        }
    }
}

/// Bounded waits applied to every session.
#[derive(Debug, Clone, Copy)]
pub struct SessionTimeouts {
    /// How long `start` blocks for readiness.
    pub ready: Duration,
    /// How long `stop` waits for the worker to exit.
    pub stop: Duration,
    /// Time leftover tasks get after the session body returns.
    pub teardown_grace: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self::from(&tetherconf::SessionsConfig::default())
    }
}

impl From<&tetherconf::SessionsConfig> for SessionTimeouts {
    fn from(config: &tetherconf::SessionsConfig) -> Self {
        Self {
            ready: config.ready_timeout(),
            stop: config.stop_timeout(),
            teardown_grace: config.teardown_grace(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session {key} did not become ready within {waited:?}")]
    ReadinessTimeout { key: SessionKey, waited: Duration },

    #[error("Session {key} failed to start: {reason}")]
    StartFailed { key: SessionKey, reason: String },

    #[error("Failed to spawn session worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    #[error("No session for {0}")]
    NotFound(SessionKey),

    #[error("Session {0} is not active")]
    Inactive(SessionKey),

    #[error(transparent)]
    Device(#[from] DeviceError),
}
