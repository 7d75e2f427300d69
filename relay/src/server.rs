use crate::store::{SlotSummary, SnapshotStore, UpdateOutcome};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use lift_common::{
    event_bus::{SessionId, SubscriptionFilter},
    events::{Event, Topic},
    session::SessionManager,
    snapshot::{RELAY_UPDATE_PATH, StateSnapshot},
};
use log::*;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::time::{Duration, Instant, interval_at};

const MIN_PING_PERIOD: Duration = Duration::from_millis(100);

/// Pings go out often enough that a display answering them never looks idle
fn ping_period(idle_timeout: Duration) -> Duration {
    (idle_timeout / 3).max(MIN_PING_PERIOD)
}

#[derive(Debug, Clone)]
pub struct AppState {
    pub store: SnapshotStore,
    pub sessions: SessionManager,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(RELAY_UPDATE_PATH, post(update))
        .route("/snapshot/{fop}", get(current_snapshot))
        .route("/displays/{fop}/ws", get(display_ws))
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Malformed snapshot: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Snapshot has no field of play name")]
    MissingFop,
    #[error("Nothing received for field of play {0:?} yet")]
    NotFound(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            ApiError::Malformed(_) | ApiError::MissingFop => {
                warn!("Rejected update: {self}");
                StatusCode::BAD_REQUEST
            }
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
        };
        (status, self.to_string()).into_response()
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    fields_of_play: BTreeMap<String, SlotSummary>,
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        fields_of_play: state.store.summary(),
    })
}

/// The body is read raw so that a bad snapshot is a 400 rather than axum's 422
async fn update(State(state): State<AppState>, body: Bytes) -> Result<impl IntoResponse, ApiError> {
    let snapshot = StateSnapshot::decode(&body)?;
    if snapshot.fop_name.is_empty() {
        return Err(ApiError::MissingFop);
    }

    let fop_name = snapshot.fop_name.clone();
    let sequence = snapshot.sequence;
    match state.store.update(snapshot, OffsetDateTime::now_utc()) {
        UpdateOutcome::Stored { subscribers } => {
            debug!("Stored snapshot {sequence} of {fop_name}, sent to {subscribers} displays");
            Ok("ok".to_string())
        }
        UpdateOutcome::Stale { current } => {
            info!("Dropped stale snapshot {sequence} of {fop_name}, current is {current}");
            Ok(format!("stale, current is {current}"))
        }
    }
}

async fn current_snapshot(
    State(state): State<AppState>,
    Path(fop): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let stored = state.store.current(&fop).ok_or(ApiError::NotFound(fop))?;
    Ok(Json(stored.snapshot))
}

async fn display_ws(
    State(state): State<AppState>,
    Path(fop): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_display(socket, state, fop))
}

async fn send_json<T: Serialize>(socket: &mut WebSocket, value: &T) -> Result<(), ()> {
    let json = serde_json::to_string(value).map_err(|e| error!("Could not encode: {e}"))?;
    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|e| debug!("Display went away: {e}"))
}

fn touch(sessions: &SessionManager, id: SessionId) {
    if let Err(e) = sessions.touch(id) {
        debug!("Could not touch session {id}: {e}");
    }
}

/// Subscribes before reading the stored snapshot, so nothing stored in between
/// is missed. The display may see the same snapshot twice, which is harmless.
///
/// A spectator display never has to send anything: delivered snapshots and
/// answered pings both count as activity.
async fn handle_display(mut socket: WebSocket, state: AppState, fop: String) {
    let mut subscription = state.sessions.attach(
        &state.store.bus(&fop),
        SubscriptionFilter::topics([Topic::Snapshot]),
    );
    let id = subscription.id();
    let period = ping_period(state.sessions.settings().idle_timeout());
    let mut ping = interval_at(Instant::now() + period, period);

    let mut connected = true;
    if let Some(stored) = state.store.current(&fop) {
        let event = Event::Snapshot {
            snapshot: Box::new(stored.snapshot),
        };
        connected = send_json(&mut socket, &event).await.is_ok();
    }

    while connected {
        tokio::select! {
            event = subscription.recv() => match event {
                Some(event) => {
                    connected = send_json(&mut socket, event.as_ref()).await.is_ok();
                    if connected {
                        touch(&state.sessions, id);
                    }
                }
                None => {
                    info!("Display session {id} was closed");
                    if let Err(e) = socket.send(Message::Close(None)).await {
                        debug!("Could not close display session {id}: {e}");
                    }
                    return;
                }
            },
            _ = ping.tick() => {
                connected = socket
                    .send(Message::Ping(Bytes::new()))
                    .await
                    .map_err(|e| debug!("Display went away: {e}"))
                    .is_ok();
            }
            msg = socket.recv() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => connected = false,
                Some(Ok(_)) => touch(&state.sessions, id),
            },
        }
    }

    if let Err(e) = state.sessions.soft_detach(id) {
        debug!("Session {id} was already gone: {e}");
    }
}
