//! ==============================================================================
//! api.rs - http and websocket boundary
//! ==============================================================================
//!
//! purpose:
//!     thin axum layer over the core. every handler looks something up,
//!     calls one core operation and shapes the json.
//!
//! routes (all under /api):
//!     GET  /sources                   configured sources + running state
//!     GET  /sources/:name/values      recent history (up to W+1 readings)
//!     GET  /sources/:name/sensors     sensor names announced by the device
//!     GET  /sources/:name/effectors   effector names announced by the device
//!     POST /sources/:name/effectors   send a command
//!     GET  /room/:name                one-line temperature summary
//!     GET  /ws                        live readings over a websocket
//!
//! relationships:
//!     - uses: device.rs, history.rs, hub.rs, pump.rs
//!     - built by: main.rs
//!
//! ==============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::StreamExt;
use serde::Serialize;
use tower_http::cors::CorsLayer;

use crate::config::SourceConfig;
use crate::device::{Device, DeviceDirectory};
use crate::domain::{Command, Reading};
use crate::history::HistoryHandle;
use crate::hub::{Client, HubHandle};
use crate::pump::{self, PumpConfig, PONG_WAIT};

/// readings averaged for the room summary
const ROOM_SAMPLE: usize = 6;

/// channel the room summary averages
const ROOM_CHANNEL: &str = "tempC";

/// clients only send control frames; anything bigger is refused
const MAX_INBOUND_MESSAGE: usize = 1024;

// ==============================================================================
// shared state
// ==============================================================================

#[derive(Clone)]
pub struct ApiState {
    pub sources: Arc<Vec<SourceConfig>>,
    pub devices: Arc<DeviceDirectory>,
    pub history: HistoryHandle,
    pub hub: HubHandle,
    /// history window W; value queries return up to W+1
    pub window: usize,
}

pub fn router(state: ApiState) -> Router {
    let api = Router::new()
        .route("/sources", get(list_sources))
        .route("/sources/:name/values", get(list_values))
        .route("/sources/:name/sensors", get(list_sensors))
        .route("/sources/:name/effectors", get(list_effectors).post(send_command))
        .route("/room/:name", get(room_conditions))
        .route("/ws", get(start_websocket));

    Router::new()
        .nest("/api", api)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ==============================================================================
// response shapes
// ==============================================================================

#[derive(Serialize)]
struct StatusBody<'a> {
    status: &'a str,
    msg: String,
}

fn status_json(code: StatusCode, status: &str, msg: impl Into<String>) -> Response {
    (code, Json(StatusBody { status, msg: msg.into() })).into_response()
}

#[derive(Serialize)]
struct Items<T> {
    items: T,
}

#[derive(Serialize)]
struct SourceStatus<'a> {
    #[serde(flatten)]
    config: &'a SourceConfig,
    running: bool,
    #[serde(rename = "lastError", skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
}

#[derive(Serialize)]
struct Sources<'a> {
    sources: Vec<SourceStatus<'a>>,
}

fn lookup(state: &ApiState, name: &str) -> Result<Arc<Device>, Response> {
    match state.devices.get(name) {
        Some(device) => Ok(Arc::clone(device)),
        None => {
            tracing::info!(source = %name, "cannot find source");
            Err(status_json(StatusCode::NOT_FOUND, "Error", "Unknown source"))
        }
    }
}

// ==============================================================================
// handlers
// ==============================================================================

async fn list_sources(State(state): State<ApiState>) -> Response {
    tracing::debug!("listing sources");
    let sources = state
        .sources
        .iter()
        .map(|config| {
            let device = state.devices.get(&config.name);
            SourceStatus {
                config,
                running: device.is_some_and(|d| d.is_running()),
                last_error: device.and_then(|d| d.last_error()),
            }
        })
        .collect();
    Json(Sources { sources }).into_response()
}

async fn list_values(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    if let Err(resp) = lookup(&state, &name) {
        return resp;
    }
    tracing::debug!(source = %name, "listing values");
    let items = state.history.get_last(&name, state.window + 1).await;
    Json(Items { items }).into_response()
}

async fn list_sensors(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    match lookup(&state, &name) {
        Ok(device) => Json(Items { items: device.input_types() }).into_response(),
        Err(resp) => resp,
    }
}

async fn list_effectors(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    match lookup(&state, &name) {
        Ok(device) => Json(Items { items: device.output_types() }).into_response(),
        Err(resp) => resp,
    }
}

async fn send_command(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    body: Result<Json<Command>, JsonRejection>,
) -> Response {
    let device = match lookup(&state, &name) {
        Ok(device) => device,
        Err(resp) => return resp,
    };
    let Json(cmd) = match body {
        Ok(cmd) => cmd,
        Err(e) => {
            tracing::warn!(source = %name, error = %e, "unable to parse command");
            return status_json(StatusCode::BAD_REQUEST, "Error", "Invalid command");
        }
    };

    // the serial write blocks, keep it off the async workers
    let sent = {
        let cmd = cmd.clone();
        tokio::task::spawn_blocking(move || device.send_command(&cmd)).await
    };

    match sent {
        Ok(Ok(())) => {
            tracing::info!(source = %name, effector = %cmd.name, action = %cmd.action, "command sent");
            status_json(StatusCode::OK, "Ok", "Command sent")
        }
        Ok(Err(e)) => {
            tracing::warn!(source = %name, error = %e, "unable to send command");
            status_json(StatusCode::BAD_REQUEST, "Failure", format!("Unable to send command: {e}"))
        }
        Err(e) => {
            tracing::error!(source = %name, error = %e, "command task failed");
            status_json(StatusCode::INTERNAL_SERVER_ERROR, "Error", "Command task failed")
        }
    }
}

#[derive(Serialize)]
struct RoomSummary {
    summary: String,
}

async fn room_conditions(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    let device = match lookup(&state, &name) {
        Ok(device) => device,
        Err(resp) => return resp,
    };
    if device.sensor_position(ROOM_CHANNEL).is_none() {
        return status_json(
            StatusCode::SERVICE_UNAVAILABLE,
            "Not available",
            "This room has no temperature sensor",
        );
    }

    tracing::debug!(source = %name, "generating room information");
    let readings = state.history.get_last(&name, ROOM_SAMPLE).await;
    match room_summary(&readings) {
        Some(summary) => Json(RoomSummary { summary }).into_response(),
        None => status_json(
            StatusCode::SERVICE_UNAVAILABLE,
            "Not available",
            "No temperature readings for this room",
        ),
    }
}

/// average temperature sentence, None when no reading carries the channel
pub fn room_summary(readings: &[Reading]) -> Option<String> {
    let temps: Vec<f64> = readings.iter().filter_map(|r| r.value_of(ROOM_CHANNEL)).collect();
    if temps.is_empty() {
        return None;
    }
    let avg = temps.iter().sum::<f64>() / temps.len() as f64;
    Some(format!("The current temperature in this room is around {avg:.0}°C"))
}

// ==============================================================================
// websocket
// ==============================================================================

async fn start_websocket(ws: WebSocketUpgrade, State(state): State<ApiState>) -> Response {
    tracing::debug!("starting websocket connection");
    ws.max_message_size(MAX_INBOUND_MESSAGE)
        .max_frame_size(MAX_INBOUND_MESSAGE)
        .on_upgrade(move |socket| client_session(socket, state.hub))
}

/// one connected client: register, pump out, drain in, unregister
async fn client_session(socket: WebSocket, hub: HubHandle) {
    let (sink, stream) = socket.split();
    let (client, outbound) = Client::new();
    let id = client.id();
    hub.register(client).await;

    let pump = tokio::spawn(pump::run_output_pump(
        id,
        sink,
        outbound,
        hub.clone(),
        PumpConfig::default(),
    ));

    pump::drain_inbound(id, stream, PONG_WAIT).await;

    // closes the queue, the pump sends its close frame and exits
    hub.unregister(id).await;
    if let Err(e) = pump.await {
        tracing::error!(client = %id, error = %e, "output pump panicked");
    }
}
