use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::Utc;
use futures::stream::StreamExt;
use hrsync_authority::RemoteTransferAuthority;
use hrsync_contract::{PropertyTransfer, RecordId};
use hrsync_transfer::{EngineConfig, SyncError, TransferSyncEngine};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{error, info, warn};

pub type TransferEngine = TransferSyncEngine<PropertyTransfer>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub http_bind: String,
    #[serde(skip_serializing, default)]
    pub http_auth_token: Option<String>,
    pub sqlite_path: String,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    pub online: bool,
    pub draining: bool,
    pub stats: hrsync_transfer::QueueStats,
    pub timestamp: String,
}

#[derive(Debug, Deserialize)]
struct EnqueueRequest {
    record_id: Option<RecordId>,
    priority: Option<i32>,
    payload: PropertyTransfer,
}

#[derive(Debug, Deserialize)]
struct ConnectivityRequest {
    online: bool,
}

#[derive(Debug, Deserialize)]
struct DiscardQuery {
    exhausted_only: Option<bool>,
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<TransferEngine>,
    pub authority: Arc<dyn RemoteTransferAuthority<PropertyTransfer>>,
    pub config: Arc<ServiceConfig>,
    pub require_bearer: bool,
}

impl AppState {
    pub fn new(
        engine: Arc<TransferEngine>,
        authority: Arc<dyn RemoteTransferAuthority<PropertyTransfer>>,
        config: ServiceConfig,
        require_bearer: bool,
    ) -> Self {
        Self {
            engine,
            authority,
            config: Arc::new(config),
            require_bearer,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .route("/v1/config", get(service_config))
        .route("/v1/sync/status", get(sync_status))
        .route("/v1/sync/drain", post(drain))
        .route("/v1/sync/connectivity", put(set_connectivity))
        .route("/v1/sync/failed", delete(discard_failed))
        .route("/v1/sync/failed/retry", post(retry_failed))
        .route("/v1/sync/events", get(stream_events))
        .route("/v1/transfers", get(list_transfers).post(enqueue_transfer))
        .route(
            "/v1/transfers/{record_id}",
            get(get_transfer).delete(cancel_transfer),
        )
        .with_state(state)
}

async fn health_live() -> impl IntoResponse {
    Json(json!({
        "status": "live",
        "timestamp": Utc::now().to_rfc3339()
    }))
}

async fn health_ready(State(state): State<AppState>) -> impl IntoResponse {
    let ready = state.authority.probe().await.is_ok();
    let payload = Json(json!({
        "status": if ready { "ready" } else { "degraded" },
        "timestamp": Utc::now().to_rfc3339()
    }));

    if ready {
        (StatusCode::OK, payload).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, payload).into_response()
    }
}

async fn service_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.config.as_ref().clone())
}

async fn sync_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(SyncStatus {
        online: state.engine.is_online(),
        draining: state.engine.is_draining(),
        stats: state.engine.stats().await,
        timestamp: Utc::now().to_rfc3339(),
    })
}

async fn list_transfers(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "items": state.engine.snapshot().await }))
}

async fn get_transfer(
    State(state): State<AppState>,
    Path(record_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    match state.engine.get(&record_id).await {
        Some(record) => Ok((StatusCode::OK, Json(record))),
        None => Err(sync_error(SyncError::NotFound(record_id))),
    }
}

async fn enqueue_transfer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<EnqueueRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    authorize(&state, &headers)?;

    let priority = request
        .priority
        .unwrap_or_else(|| request.payload.classification.default_priority());
    let record = match request.record_id {
        Some(record_id) => {
            state
                .engine
                .enqueue_with_id(record_id, request.payload, Some(priority))
                .await
        }
        None => state.engine.enqueue(request.payload, Some(priority)).await,
    }
    .map_err(sync_error)?;

    Ok((StatusCode::CREATED, Json(record)))
}

async fn cancel_transfer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(record_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    authorize(&state, &headers)?;
    state.engine.remove(&record_id).await.map_err(sync_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn drain(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    authorize(&state, &headers)?;
    let summary = state.engine.drain().await.map_err(sync_error)?;
    Ok((StatusCode::OK, Json(summary)))
}

async fn set_connectivity(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ConnectivityRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    authorize(&state, &headers)?;

    let drain_started = match state.engine.on_connectivity_change(request.online) {
        Some(handle) => {
            tokio::spawn(async move {
                match handle.await {
                    Ok(Ok(summary)) => {
                        info!(succeeded = summary.succeeded, failed = summary.failed, "reconnect drain done")
                    }
                    Ok(Err(err)) => warn!(error = %err, "reconnect drain refused"),
                    Err(err) => error!(error = %err, "reconnect drain panicked"),
                }
            });
            true
        }
        None => false,
    };

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "online": request.online, "drain_started": drain_started })),
    ))
}

async fn retry_failed(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    authorize(&state, &headers)?;
    let requeued = state.engine.retry_failed().await.map_err(sync_error)?;
    Ok((StatusCode::OK, Json(json!({ "requeued": requeued }))))
}

async fn discard_failed(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<DiscardQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    authorize(&state, &headers)?;
    let discarded = if query.exhausted_only.unwrap_or(false) {
        state.engine.discard_exhausted().await
    } else {
        state.engine.discard_failed().await
    }
    .map_err(sync_error)?;
    Ok((StatusCode::OK, Json(json!({ "discarded": discarded }))))
}

async fn stream_events(
    State(state): State<AppState>,
) -> Sse<impl futures::Stream<Item = Result<SseEvent, std::convert::Infallible>>> {
    let receiver = state.engine.subscribe();
    let stream = BroadcastStream::new(receiver).filter_map(|item| async move {
        match item {
            Ok(event) => {
                let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
                Some(Ok(SseEvent::default().event(event.event_name()).data(data)))
            }
            Err(_) => None,
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(15)))
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), (StatusCode, Json<Value>)> {
    if !state.require_bearer {
        return Ok(());
    }

    let token = state.config.http_auth_token.as_deref().ok_or_else(|| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error":"auth_token_required_but_not_configured"})),
        )
    })?;

    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    if provided == format!("Bearer {token}") {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error":"invalid_or_missing_bearer_token"})),
        ))
    }
}

fn sync_error(error: SyncError) -> (StatusCode, Json<Value>) {
    let (status, code) = match &error {
        SyncError::InvalidPayload(_) => (StatusCode::BAD_REQUEST, "invalid_payload"),
        SyncError::NotFound(_) => (StatusCode::NOT_FOUND, "transfer_not_found"),
        SyncError::Offline => (StatusCode::SERVICE_UNAVAILABLE, "offline"),
        SyncError::AlreadyInProgress => (StatusCode::CONFLICT, "drain_in_progress"),
        SyncError::DuplicateRecord(_) => (StatusCode::CONFLICT, "duplicate_transfer"),
        SyncError::AlreadyApplied(_) => (StatusCode::CONFLICT, "transfer_already_applied"),
        SyncError::RecordInFlight(_) => (StatusCode::CONFLICT, "transfer_in_flight"),
        SyncError::QueueFull { .. } => (StatusCode::INSUFFICIENT_STORAGE, "queue_full"),
        SyncError::Store(_) => {
            error!(error = %error, "queue store failure");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
        }
    };
    (status, Json(json!({ "error": code, "detail": error.to_string() })))
}
