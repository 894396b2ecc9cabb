use axum::{
    extract::{
        rejection::FormRejection,
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        Path, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
    Form, Json,
};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::emulator::EmulatorConfig;
use crate::platform::{validate_path_component, Platform};
use crate::registry::Liveness;
use crate::relay;

use super::error::ApiError;
use super::AppState;

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
    emulators: usize,
}

pub(super) async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        emulators: state.registry.len(),
    })
}

#[derive(Debug, Deserialize)]
pub(super) struct LaunchForm {
    token: String,
    platform: String,
    version: String,
    tz_offset: Option<i32>,
    oauth: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LaunchResponse {
    pub uuid: Uuid,
    pub ws_port: u16,
    pub vnc_display: u16,
    pub vnc_ws_port: u16,
}

pub(super) async fn launch(
    State(state): State<AppState>,
    headers: HeaderMap,
    form: Result<Form<LaunchForm>, FormRejection>,
) -> Result<Json<LaunchResponse>, ApiError> {
    let presented = headers
        .get("authorization")
        .map(|v| v.as_bytes())
        .unwrap_or_default();
    if !bool::from(presented.ct_eq(state.launch_secret.as_bytes())) {
        return Err(ApiError::AuthInvalid);
    }
    if !state.registry.has_capacity() {
        return Err(ApiError::CapacityExceeded);
    }

    let Form(form) = form.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;
    let config = launch_config(form)?;
    tracing::info!(
        platform = %config.platform,
        version = %config.version,
        tz_offset = ?config.tz_offset,
        "launching emulator"
    );

    let (uuid, endpoints) = state.registry.create(config).await?;
    Ok(Json(LaunchResponse {
        uuid,
        ws_port: endpoints.ws_port,
        vnc_display: endpoints.vnc_display,
        vnc_ws_port: endpoints.vnc_ws_port,
    }))
}

fn launch_config(form: LaunchForm) -> Result<EmulatorConfig, ApiError> {
    let invalid = |e: crate::platform::PlatformError| ApiError::InvalidRequest(e.to_string());
    validate_path_component("version", &form.version).map_err(invalid)?;
    let platform: Platform = form.platform.parse().map_err(invalid)?;
    if form.token.is_empty() {
        return Err(ApiError::InvalidRequest("token must not be empty".to_string()));
    }
    Ok(EmulatorConfig {
        token: form.token,
        platform,
        version: form.version,
        tz_offset: form.tz_offset,
        oauth: form.oauth.filter(|o| !o.is_empty()),
    })
}

/// Ids in URLs must be UUIDs; anything else is reported as not found.
fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::EmulatorNotFound(raw.to_string()))
}

#[derive(Serialize, Deserialize)]
pub struct PingResponse {
    pub alive: bool,
}

pub(super) async fn ping(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PingResponse>, ApiError> {
    let id = parse_id(&id)?;
    let alive = match state.registry.touch(id).await {
        Liveness::Alive => true,
        Liveness::Dead | Liveness::Unknown => false,
    };
    Ok(Json(PingResponse { alive }))
}

#[derive(Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

pub(super) async fn kill(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let id = parse_id(&id)?;
    match state.registry.remove(id).await {
        Ok(true) => tracing::info!(emulator = %id, "emulator killed on request"),
        Ok(false) => tracing::debug!(emulator = %id, "kill for unknown emulator"),
        Err(e) => tracing::error!(emulator = %id, error = %e, "failed to kill emulator"),
    }
    Ok(Json(StatusResponse {
        status: "ok".to_string(),
    }))
}

/// Which internal endpoint of an instance a WebSocket is relayed to.
#[derive(Debug, Clone, Copy)]
enum Channel {
    Phone,
    Vnc,
}

impl Channel {
    fn subprotocol(self) -> Option<&'static str> {
        match self {
            Channel::Phone => None,
            Channel::Vnc => Some("binary"),
        }
    }
}

pub(super) async fn ws_phone(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    proxy_ws(state, &id, ws, Channel::Phone).await
}

pub(super) async fn ws_vnc(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    proxy_ws(state, &id, ws, Channel::Vnc).await
}

async fn proxy_ws(
    state: AppState,
    raw_id: &str,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    channel: Channel,
) -> Result<Response, ApiError> {
    let ws = ws.map_err(|e| {
        tracing::warn!(?channel, error = %e, "websocket endpoint called without upgrade");
        ApiError::NotWebSocket
    })?;
    let id = parse_id(raw_id)?;
    let endpoints = state
        .registry
        .get(id)
        .and_then(|emulator| emulator.endpoints())
        .ok_or_else(|| ApiError::EmulatorNotFound(raw_id.to_string()))?;
    let port = match channel {
        Channel::Phone => endpoints.ws_port,
        Channel::Vnc => endpoints.vnc_ws_port,
    };

    let url = format!("ws://127.0.0.1:{}/", port);
    let internal = relay::connect_internal(&url, channel.subprotocol()).await?;
    tracing::info!(emulator = %id, ?channel, %url, "starting relay");

    let ws = match channel.subprotocol() {
        Some(protocol) => ws.protocols([protocol]),
        None => ws,
    };
    Ok(ws
        .on_upgrade(move |socket| async move {
            match relay::pump(socket, internal).await {
                Ok(stats) => tracing::info!(
                    emulator = %id,
                    ?channel,
                    inbound = stats.inbound,
                    outbound = stats.outbound,
                    "relay ended"
                ),
                Err(e) => tracing::warn!(emulator = %id, ?channel, error = %e, "relay failed"),
            }
        })
        .into_response())
}
