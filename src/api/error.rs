use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::registry::RegistryError;
use crate::relay::RelayError;

/// Structured error type for all API handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message. Implements [`IntoResponse`] so handlers can
/// return `Result<T, ApiError>` directly.
#[derive(Debug)]
pub enum ApiError {
    /// 403 - Launch secret missing or wrong.
    AuthInvalid,
    /// 503 - The instance limit is reached.
    CapacityExceeded,
    /// 400 - Malformed or invalid request.
    InvalidRequest(String),
    /// 404 - Malformed or unknown emulator id.
    EmulatorNotFound(String),
    /// 400 - A WebSocket endpoint was requested without an upgrade.
    NotWebSocket,
    /// 500 - Provisioning failed; the instance is already torn down.
    LaunchFailed(String),
    /// 502 - The instance's internal WebSocket could not be reached.
    ProxyConnect(String),
    /// 500 - Catch-all internal error.
    InternalError(String),
}

impl ApiError {
    /// Returns the HTTP status code for this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::AuthInvalid => StatusCode::FORBIDDEN,
            ApiError::CapacityExceeded => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::EmulatorNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::NotWebSocket => StatusCode::BAD_REQUEST,
            ApiError::LaunchFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::ProxyConnect(_) => StatusCode::BAD_GATEWAY,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a machine-readable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::AuthInvalid => "auth_invalid",
            ApiError::CapacityExceeded => "capacity_exceeded",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::EmulatorNotFound(_) => "emulator_not_found",
            ApiError::NotWebSocket => "not_websocket",
            ApiError::LaunchFailed(_) => "launch_failed",
            ApiError::ProxyConnect(_) => "proxy_connect_failed",
            ApiError::InternalError(_) => "internal_error",
        }
    }

    /// Returns a human-readable error message.
    pub fn message(&self) -> String {
        match self {
            ApiError::AuthInvalid => "Invalid launch authorization.".to_string(),
            ApiError::CapacityExceeded => {
                "No emulator capacity available. Try again later.".to_string()
            }
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}.", detail),
            ApiError::EmulatorNotFound(id) => format!("No emulator exists with id '{}'.", id),
            ApiError::NotWebSocket => "This endpoint requires a WebSocket upgrade.".to_string(),
            ApiError::LaunchFailed(detail) => format!("Failed to launch emulator: {}.", detail),
            ApiError::ProxyConnect(detail) => {
                format!("Could not reach the emulator: {}.", detail)
            }
            ApiError::InternalError(detail) => format!("Internal error: {}.", detail),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::CapacityExceeded => ApiError::CapacityExceeded,
            RegistryError::Launch(e) => ApiError::LaunchFailed(e.to_string()),
        }
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Connect { url, source } => {
                ApiError::ProxyConnect(format!("{}: {}", url, source))
            }
            other => ApiError::InternalError(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}
