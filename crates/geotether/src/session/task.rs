//! Session bodies.
//!
//! A [`SessionTask`] runs inside its session's private runtime. It publishes
//! readiness through its [`TaskContext`] once the operation is live, then
//! holds the operation open until the session is cancelled.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, info};

use super::signal::{CancelSignal, Milestones};
use super::{Readiness, SessionError, SessionKey, SessionKind};
use crate::device::{Coordinate, LocationRuntime, RsdEndpoint, TunnelRuntime};

/// Handle a session body uses to talk to its owner.
pub struct TaskContext {
    key: SessionKey,
    cancel: CancelSignal,
    milestones: Arc<Milestones>,
}

impl TaskContext {
    pub(crate) fn new(key: SessionKey, cancel: CancelSignal, milestones: Arc<Milestones>) -> Self {
        Self {
            key,
            cancel,
            milestones,
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Publish readiness. Returns false if a stop was requested first.
    pub fn publish(&self, readiness: Readiness) -> bool {
        self.milestones.publish(readiness)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_raised()
    }

    /// Completes when the session is asked to stop.
    pub async fn cancelled(&self) {
        self.cancel.raised().await
    }
}

/// A long-lived operation run by a session.
pub trait SessionTask: Send + 'static {
    fn kind(&self) -> SessionKind;

    fn run(self: Box<Self>, ctx: TaskContext) -> BoxFuture<'static, Result<(), SessionError>>;
}

/// Keeps a tunnel to one device open.
pub struct TunnelTask {
    device_id: String,
    runtime: Arc<dyn TunnelRuntime>,
}

impl TunnelTask {
    pub fn new(device_id: impl Into<String>, runtime: Arc<dyn TunnelRuntime>) -> Self {
        Self {
            device_id: device_id.into(),
            runtime,
        }
    }
}

impl SessionTask for TunnelTask {
    fn kind(&self) -> SessionKind {
        SessionKind::Tunnel
    }

    fn run(self: Box<Self>, ctx: TaskContext) -> BoxFuture<'static, Result<(), SessionError>> {
        Box::pin(async move {
            let TunnelTask { device_id, runtime } = *self;

            let mut tunnel = tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    debug!(key = %ctx.key(), "Cancelled before tunnel came up");
                    return Ok(());
                }
                result = runtime.start_tunnel(&device_id) => result?,
            };

            let endpoint = tunnel.endpoint().clone();
            if ctx.publish(Readiness::Tunnel(endpoint.clone())) {
                info!(key = %ctx.key(), %endpoint, "Tunnel ready");
                ctx.cancelled().await;
            }

            tunnel.close().await;
            debug!(key = %ctx.key(), "Tunnel closed");
            Ok(())
        })
    }
}

/// Holds a simulated location on a device reached through its tunnel.
pub struct LocationTask {
    endpoint: RsdEndpoint,
    coordinate: Coordinate,
    runtime: Arc<dyn LocationRuntime>,
}

impl LocationTask {
    pub fn new(
        endpoint: RsdEndpoint,
        coordinate: Coordinate,
        runtime: Arc<dyn LocationRuntime>,
    ) -> Self {
        Self {
            endpoint,
            coordinate,
            runtime,
        }
    }
}

impl SessionTask for LocationTask {
    fn kind(&self) -> SessionKind {
        SessionKind::Location
    }

    fn run(self: Box<Self>, ctx: TaskContext) -> BoxFuture<'static, Result<(), SessionError>> {
        Box::pin(async move {
            let LocationTask {
                endpoint,
                coordinate,
                runtime,
            } = *self;

            let mut hold = tokio::select! {
                biased;
                _ = ctx.cancelled() => return Ok(()),
                result = runtime.apply_location(&endpoint, coordinate) => result?,
            };

            if ctx.publish(Readiness::Location(coordinate)) {
                info!(key = %ctx.key(), lat = coordinate.lat, lon = coordinate.lon, "Location applied");
                ctx.cancelled().await;
            }

            hold.clear().await;
            debug!(key = %ctx.key(), "Location cleared");
            Ok(())
        })
    }
}
