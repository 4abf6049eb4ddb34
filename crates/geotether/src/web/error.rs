//! HTTP error mapping.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::device::DeviceError;
use crate::session::SessionError;

/// Errors returned by control surface handlers.
///
/// Every variant renders as `{"success": false, "detail": "<message>"}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Device(e) => device_status(e),
            Self::Session(e) => match e {
                SessionError::NotFound(_) | SessionError::Inactive(_) => StatusCode::BAD_REQUEST,
                SessionError::Device(inner) => device_status(inner),
                SessionError::ReadinessTimeout { .. }
                | SessionError::StartFailed { .. }
                | SessionError::WorkerSpawn(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

fn device_status(e: &DeviceError) -> StatusCode {
    match e {
        DeviceError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
        DeviceError::InvalidInput(_) | DeviceError::NotFound(_) => StatusCode::BAD_REQUEST,
        DeviceError::Backend(_) | DeviceError::Parse(_) | DeviceError::Io(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let detail = self.to_string();

        if status.is_server_error() {
            tracing::error!(%status, %detail, "Request failed");
        } else {
            tracing::debug!(%status, %detail, "Request rejected");
        }

        let body = Json(serde_json::json!({
            "success": false,
            "detail": detail,
        }));
        (status, body).into_response()
    }
}
