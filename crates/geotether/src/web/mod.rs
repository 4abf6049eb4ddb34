//! HTTP control surface.
//!
//! Handlers translate requests into registry operations and directory
//! queries. Registry calls block, so they run on the blocking pool.

pub mod error;
pub mod handlers;
pub mod rsd;

pub use error::ApiError;
pub use rsd::RsdBook;

use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::device::{DeviceDirectory, LocationRuntime, PyMobileDevice, TunnelRuntime};
use crate::session::SessionRegistry;

/// Shared state for web handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub devices: Arc<dyn DeviceDirectory>,
    pub tunnels: Arc<dyn TunnelRuntime>,
    pub locations: Arc<dyn LocationRuntime>,
    pub rsd: Arc<RsdBook>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        registry: Arc<SessionRegistry>,
        devices: Arc<dyn DeviceDirectory>,
        tunnels: Arc<dyn TunnelRuntime>,
        locations: Arc<dyn LocationRuntime>,
    ) -> Self {
        Self {
            registry,
            devices,
            tunnels,
            locations,
            rsd: Arc::new(RsdBook::new()),
            start_time: Instant::now(),
        }
    }

    /// All three collaborators served by one `pymobiledevice3` backend.
    pub fn with_backend(registry: Arc<SessionRegistry>, backend: PyMobileDevice) -> Self {
        let backend = Arc::new(backend);
        Self::new(
            registry,
            Arc::clone(&backend) as Arc<dyn DeviceDirectory>,
            Arc::clone(&backend) as Arc<dyn TunnelRuntime>,
            backend as Arc<dyn LocationRuntime>,
        )
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/devices", get(handlers::list_devices))
        .route("/devices/{udid}", get(handlers::device_info))
        .route(
            "/devices/{udid}/developer_mode",
            get(handlers::developer_mode_status).post(handlers::enable_developer_mode),
        )
        .route("/connect_wifi", post(handlers::connect_wifi))
        .route("/disconnect_wifi/{udid}", post(handlers::disconnect_wifi))
        .route("/set_location", post(handlers::set_location))
        .route("/stop_location/{udid}", post(handlers::stop_location))
        .route("/location_status", get(handlers::location_status))
        .route("/location_status/{udid}", get(handlers::location_status_for_device))
        .route("/rsd", get(handlers::rsd_all))
        .route("/rsd/{udid}", get(handlers::rsd_for_device))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::very_permissive()),
        )
        .with_state(state)
}
