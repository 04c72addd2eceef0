use crate::broadcast::BroadcastHub;
use crate::simulation::{MetricsSnapshot, SimError, SimHandle};
use axum::{
    body::Bytes,
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::{net::SocketAddr, sync::Arc};
use telem_core::{
    wire::{TelemetryUpdate, MAX_FRAME_BYTES},
    Device,
};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<BroadcastHub>,
    pub sim: SimHandle,
    pub allowed_origins: Arc<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
}

pub fn router(state: AppState) -> Router {
    let origins: Vec<HeaderValue> = state
        .allowed_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .route("/api/devices", get(list_devices))
        .route("/api/metrics", get(list_metrics))
        .route("/api/telemetry", post(post_telemetry))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Browsers always send `Origin`; non-browser clients may omit it.
fn origin_allowed(headers: &HeaderMap, allowed: &[String]) -> bool {
    match headers.get(header::ORIGIN) {
        None => true,
        Some(value) => value
            .to_str()
            .map(|origin| allowed.iter().any(|candidate| candidate == origin))
            .unwrap_or(false),
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    if !origin_allowed(&headers, &state.allowed_origins) {
        warn!(event = "origin_rejected", remote = %remote);
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| async move {
            state.hub.handle_socket(socket, remote, state.sim).await;
        })
}

async fn list_devices(State(state): State<AppState>) -> Result<Json<Vec<Device>>, ApiError> {
    state
        .sim
        .devices()
        .await
        .map(Json)
        .map_err(|err| api_error(StatusCode::SERVICE_UNAVAILABLE, err.to_string()))
}

async fn list_metrics(
    State(state): State<AppState>,
) -> Result<Json<Vec<MetricsSnapshot>>, ApiError> {
    state
        .sim
        .metrics()
        .await
        .map(Json)
        .map_err(|err| api_error(StatusCode::SERVICE_UNAVAILABLE, err.to_string()))
}

async fn post_telemetry(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let value: Value = serde_json::from_slice(&body).map_err(|err| {
        warn!(event = "telemetry_invalid_json", error = %err);
        api_error(StatusCode::BAD_REQUEST, format!("invalid JSON: {err}"))
    })?;
    let update = TelemetryUpdate::from_value(&value).map_err(|err| {
        warn!(event = "telemetry_invalid", error = %err);
        api_error(StatusCode::BAD_REQUEST, err.to_string())
    })?;
    match state.sim.ingest(update).await {
        Ok(device) => Ok(Json(json!({
            "success": true,
            "device": device.status_descriptor(),
        }))),
        Err(err @ SimError::UnknownDevice(_)) => {
            Err(api_error(StatusCode::NOT_FOUND, err.to_string()))
        }
        Err(err @ SimError::Unavailable) => {
            Err(api_error(StatusCode::SERVICE_UNAVAILABLE, err.to_string()))
        }
    }
}
