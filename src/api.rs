//! REST + WebSocket surface for the pipeline state store.
//!
//! | Route | Operation |
//! |---|---|
//! | `GET /api/pipeline[?stage=]` | `pipeline.getAll` |
//! | `POST /api/pipeline/stage` | `pipeline.setStage` |
//! | `GET /api/pipeline/{thread_id}` | single record |
//! | `DELETE /api/pipeline/{thread_id}` | thread deletion |
//! | `GET /api/pipeline/{thread_id}/transitions` | audit log |
//! | `GET /ws` | snapshot + live `stage_set` events |

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::pipeline::types::{PipelineRecord, Stage, TriggeredBy};
use crate::store::PipelineStore;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Events pushed to WebSocket subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    /// Full snapshot, sent on connect and after a lagged receiver. `as_of`
    /// is the server time just before the snapshot was read.
    #[serde(rename_all = "camelCase")]
    RecordsSync {
        records: Vec<PipelineRecord>,
        as_of: DateTime<Utc>,
    },
    /// The snapshot could not be read; subscribers keep what they have.
    SyncFailed { error: String, retryable: bool },
    /// A stage was written.
    StageSet { record: PipelineRecord },
    /// A thread and its record were deleted.
    #[serde(rename_all = "camelCase")]
    ThreadDeleted { thread_id: String },
}

/// `pipeline.setStage` input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetStageRequest {
    pub thread_id: String,
    pub stage: Stage,
    #[serde(default = "default_trigger")]
    pub triggered_by: TriggeredBy,
}

fn default_trigger() -> TriggeredBy {
    TriggeredBy::User
}

/// `{ok: true}` plus the stored record where one exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<PipelineRecord>,
}

/// JSON error body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default)]
    pub retryable: bool,
}

#[derive(Debug, Deserialize)]
struct StageFilter {
    stage: Option<Stage>,
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn PipelineStore>,
    pub events: broadcast::Sender<StoreEvent>,
}

impl AppState {
    pub fn new(store: Arc<dyn PipelineStore>) -> Self {
        let (events, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Self { store, events }
    }
}

/// Build the Axum router with pipeline REST and WebSocket routes.
pub fn pipeline_routes(store: Arc<dyn PipelineStore>) -> Router {
    router_with_state(AppState::new(store))
}

/// Build the router around existing state (lets callers keep the sender).
pub fn router_with_state(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/api/pipeline", get(list_records))
        .route("/api/pipeline/stage", post(set_stage))
        .route(
            "/api/pipeline/{thread_id}",
            get(get_record).delete(delete_record),
        )
        .route("/api/pipeline/{thread_id}/transitions", get(list_transitions))
        .with_state(state)
}

fn error_response(err: StoreError) -> Response {
    let status = match &err {
        StoreError::InvalidThreadId { .. } => StatusCode::BAD_REQUEST,
        StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = ErrorBody {
        retryable: err.is_retryable(),
        error: err.to_string(),
    };
    (status, Json(body)).into_response()
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "pipeline-board"
    }))
}

// ── REST Endpoints ──────────────────────────────────────────────────────

async fn list_records(
    State(state): State<AppState>,
    Query(filter): Query<StageFilter>,
) -> Response {
    let result = match filter.stage {
        Some(stage) => state.store.get_by_stage(stage).await,
        None => state.store.get_all().await,
    };
    match result {
        Ok(records) => Json(records).into_response(),
        Err(e) => error_response(e),
    }
}

async fn set_stage(State(state): State<AppState>, Json(body): Json<SetStageRequest>) -> Response {
    match state
        .store
        .set_stage(&body.thread_id, body.stage, body.triggered_by)
        .await
    {
        Ok(record) => {
            info!(
                thread_id = %record.thread_id,
                stage = %record.stage,
                triggered_by = %record.triggered_by,
                "Stage set via API"
            );
            let _ = state.events.send(StoreEvent::StageSet {
                record: record.clone(),
            });
            Json(OkResponse {
                ok: true,
                record: Some(record),
            })
            .into_response()
        }
        Err(e) => {
            warn!(thread_id = %body.thread_id, error = %e, "setStage failed");
            error_response(e)
        }
    }
}

async fn get_record(State(state): State<AppState>, Path(thread_id): Path<String>) -> Response {
    match state.store.get(&thread_id).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => error_response(StoreError::NotFound { thread_id }),
        Err(e) => error_response(e),
    }
}

async fn delete_record(State(state): State<AppState>, Path(thread_id): Path<String>) -> Response {
    match state.store.delete_thread(&thread_id).await {
        Ok(true) => {
            let _ = state.events.send(StoreEvent::ThreadDeleted {
                thread_id: thread_id.clone(),
            });
            Json(OkResponse {
                ok: true,
                record: None,
            })
            .into_response()
        }
        Ok(false) => error_response(StoreError::NotFound { thread_id }),
        Err(e) => error_response(e),
    }
}

async fn list_transitions(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Response {
    match state.store.transitions(&thread_id).await {
        Ok(log) => Json(log).into_response(),
        Err(e) => error_response(e),
    }
}

// ── WebSocket ───────────────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("WebSocket client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Send the current snapshot, or `sync_failed` when the store cannot be
/// read. Returns false once the client is gone.
async fn send_snapshot(socket: &mut WebSocket, store: &dyn PipelineStore) -> bool {
    let as_of = Utc::now();
    let event = match store.get_all().await {
        Ok(records) => StoreEvent::RecordsSync { records, as_of },
        Err(e) => {
            warn!(error = %e, "Failed to load snapshot for WS client");
            StoreEvent::SyncFailed {
                retryable: e.is_retryable(),
                error: e.to_string(),
            }
        }
    };
    match serde_json::to_string(&event) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(_) => true,
    }
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    // Subscribe before the snapshot so no write slips between them.
    let mut rx = state.events.subscribe();

    if !send_snapshot(&mut socket, state.store.as_ref()).await {
        warn!("Failed to send initial sync, client disconnected");
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if let Ok(json) = serde_json::to_string(&event) {
                            if socket.send(Message::Text(json.into())).await.is_err() {
                                debug!("Client disconnected during send");
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "WS client lagged behind broadcast");
                        if !send_snapshot(&mut socket, state.store.as_ref()).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Broadcast channel closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("WebSocket connection closed");
}
