//! Request handlers.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument};

use super::{ApiError, AppState};
use crate::device::{group_devices, Coordinate, DeviceError, DeviceListing};
use crate::session::{LocationTask, Readiness, SessionError, SessionKind, TunnelTask};

#[derive(Debug, Deserialize)]
pub struct WifiConnectRequest {
    pub udid: String,
    #[serde(default)]
    pub ios_version: Option<String>,
    #[serde(default, rename = "connType")]
    pub conn_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SetLocationRequest {
    pub udid: String,
    pub coordinate: Coordinate,
}

#[derive(Debug, Serialize)]
pub struct WifiConnectResponse {
    pub success: bool,
    pub message: String,
    pub udid: String,
    pub rsd_host: String,
    pub rsd_port: String,
}

#[derive(Debug, Serialize)]
pub struct SetLocationResponse {
    pub success: bool,
    pub message: String,
    pub udid: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Run blocking registry work off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(format!("Worker task failed: {e}")))
}

fn require_udid(udid: &str) -> Result<(), ApiError> {
    if udid.trim().is_empty() {
        return Err(ApiError::BadRequest("udid must not be empty".to_string()));
    }
    Ok(())
}

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": {
            "tunnels": state.registry.active_count(SessionKind::Tunnel),
            "locations": state.registry.active_count(SessionKind::Location),
        }
    }))
}

#[instrument(skip(state))]
pub async fn list_devices(State(state): State<AppState>) -> Result<Json<DeviceListing>, ApiError> {
    match state.devices.list().await {
        Ok(entries) => Ok(Json(group_devices(entries))),
        Err(DeviceError::Transport(reason)) => {
            debug!(%reason, "Device listing aborted");
            Err(ApiError::Unavailable(
                "Connection aborted while retrieving devices".to_string(),
            ))
        }
        Err(e) => Err(ApiError::Internal(format!("Internal server error: {e}"))),
    }
}

#[instrument(skip(state))]
pub async fn device_info(
    State(state): State<AppState>,
    Path(udid): Path<String>,
) -> Result<Response, ApiError> {
    let entries = state.devices.info(&udid).await?;
    let by_conn = group_devices(entries).remove(&udid).unwrap_or_default();
    Ok(Json(by_conn).into_response())
}

#[instrument(skip(state))]
pub async fn developer_mode_status(
    State(state): State<AppState>,
    Path(udid): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let enabled = state.devices.developer_mode_status(&udid).await?;
    Ok(Json(json!({
        "success": true,
        "udid": udid,
        "developer_mode": enabled,
    })))
}

#[instrument(skip(state))]
pub async fn enable_developer_mode(
    State(state): State<AppState>,
    Path(udid): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.devices.enable_developer_mode(&udid).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Developer mode enabled",
        "udid": udid,
    })))
}

#[instrument(skip_all)]
pub async fn connect_wifi(
    State(state): State<AppState>,
    body: Result<Json<WifiConnectRequest>, JsonRejection>,
) -> Result<Json<WifiConnectResponse>, ApiError> {
    let Json(request) = body?;
    require_udid(&request.udid)?;
    debug!(
        udid = %request.udid,
        ios_version = ?request.ios_version,
        conn_type = ?request.conn_type,
        "Connect requested"
    );

    let udid = request.udid;
    let registry = state.registry.clone();
    let task = Box::new(TunnelTask::new(udid.clone(), state.tunnels.clone()));
    let device_id = udid.clone();

    let started = blocking(move || {
        // A location rides on the tunnel being replaced.
        registry.stop(&device_id, SessionKind::Location);
        registry.start_or_replace(&device_id, task)
    })
    .await?;

    let endpoint = match started {
        Ok(Readiness::Tunnel(endpoint)) => endpoint,
        failed => {
            // Any previous tunnel is gone by now, and so is its endpoint.
            state.rsd.forget(&udid);
            return Err(match failed {
                Ok(other) => ApiError::Internal(format!("Unexpected tunnel readiness: {other:?}")),
                Err(SessionError::ReadinessTimeout { .. }) => {
                    ApiError::Internal("Failed to start tunnel".to_string())
                }
                Err(e) => ApiError::Internal(format!("Connection failed: {e}")),
            });
        }
    };

    state.rsd.record(&udid, endpoint.clone());
    info!(%udid, %endpoint, "WiFi connection initiated");

    Ok(Json(WifiConnectResponse {
        success: true,
        message: "WiFi connection initiated".to_string(),
        udid,
        rsd_host: endpoint.host,
        rsd_port: endpoint.port.to_string(),
    }))
}

#[instrument(skip(state))]
pub async fn disconnect_wifi(
    State(state): State<AppState>,
    Path(udid): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let registry = state.registry.clone();
    let device_id = udid.clone();

    let stopped = blocking(move || {
        registry.stop(&device_id, SessionKind::Location);
        registry.stop(&device_id, SessionKind::Tunnel)
    })
    .await?;

    if !stopped {
        return Err(ApiError::BadRequest(
            "No active tunnel for this device".to_string(),
        ));
    }

    state.rsd.forget(&udid);
    Ok(Json(json!({
        "success": true,
        "message": "WiFi connection stopped",
        "udid": udid,
    })))
}

#[instrument(skip_all)]
pub async fn set_location(
    State(state): State<AppState>,
    body: Result<Json<SetLocationRequest>, JsonRejection>,
) -> Result<Json<SetLocationResponse>, ApiError> {
    let Json(request) = body?;
    require_udid(&request.udid)?;
    request.coordinate.validate()?;

    let udid = request.udid;
    let coordinate = request.coordinate;

    let Some(tunnel) = state.registry.get(&udid, SessionKind::Tunnel) else {
        return Err(ApiError::BadRequest(
            "No active tunnel for this device. Connect to WiFi first.".to_string(),
        ));
    };

    let endpoint = match tunnel.readiness() {
        Some(Readiness::Tunnel(endpoint)) if tunnel.is_active() => endpoint,
        _ => {
            return Err(ApiError::BadRequest(
                "Tunnel is not active. Reconnect to WiFi first.".to_string(),
            ))
        }
    };

    let registry = state.registry.clone();
    let task = Box::new(LocationTask::new(endpoint, coordinate, state.locations.clone()));
    let device_id = udid.clone();

    blocking(move || registry.start_or_replace(&device_id, task))
        .await?
        .map_err(|e| ApiError::Internal(format!("Location setting failed: {e}")))?;

    info!(%udid, lat = coordinate.lat, lon = coordinate.lon, "Location setting initiated");
    Ok(Json(SetLocationResponse {
        success: true,
        message: "Location setting initiated".to_string(),
        udid,
        latitude: coordinate.lat,
        longitude: coordinate.lon,
    }))
}

#[instrument(skip(state))]
pub async fn stop_location(
    State(state): State<AppState>,
    Path(udid): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let registry = state.registry.clone();
    let device_id = udid.clone();

    let stopped = blocking(move || registry.stop(&device_id, SessionKind::Location)).await?;
    if !stopped {
        return Err(ApiError::BadRequest(
            "No active location setting for this device".to_string(),
        ));
    }

    Ok(Json(json!({
        "success": true,
        "message": "Location setting stopped",
        "udid": udid,
    })))
}

pub async fn location_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "success": true,
        "location_status": state.registry.status_all(SessionKind::Location),
    }))
}

pub async fn location_status_for_device(
    State(state): State<AppState>,
    Path(udid): Path<String>,
) -> Json<serde_json::Value> {
    match state.registry.status_one(&udid, SessionKind::Location) {
        Some(status) => Json(json!({
            "success": true,
            "udid": udid,
            "active": status.active,
        })),
        None => Json(json!({
            "success": false,
            "udid": udid,
            "active": false,
            "message": "No location setting active for this device",
        })),
    }
}

pub async fn rsd_all(State(state): State<AppState>) -> Json<serde_json::Value> {
    if state.rsd.is_empty() {
        return Json(json!({
            "success": false,
            "error": "No active tunnels",
            "rsd_data": {},
        }));
    }

    Json(json!({
        "success": true,
        "rsd_data": state.rsd.snapshot(),
    }))
}

pub async fn rsd_for_device(
    State(state): State<AppState>,
    Path(udid): Path<String>,
) -> Json<serde_json::Value> {
    let tunnel = state.registry.get(&udid, SessionKind::Tunnel);

    match (state.rsd.get(&udid), tunnel) {
        (Some(endpoint), Some(tunnel)) => Json(json!({
            "success": true,
            "udid": udid,
            "rsd_host": endpoint.host,
            "rsd_port": endpoint.port.to_string(),
            "tunnel_active": tunnel.is_active(),
        })),
        _ => Json(json!({
            "success": false,
            "error": format!("No active tunnel for device {udid}"),
        })),
    }
}
