// HTTP surface: sessions, batches, progress polling and archive delivery

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::core::config::Config;
use crate::core::errors::{AuthError, PipelineError, QueryError};
use crate::core::types::{BatchId, BatchSummary, LayerHandle, ObjectIdRange};
use crate::orchestration::{BatchOrchestrator, BatchRequest, BatchTicket, ProgressStatus};
use crate::services::layer_service::{AuthProvider, LayerService};
use crate::utils::Metrics;

type ApiResult<T> = Result<T, (StatusCode, String)>;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub orchestrator: Arc<BatchOrchestrator>,
    pub auth: Arc<dyn AuthProvider>,
    pub layers: Arc<dyn LayerService>,
    /// Signed-in layer handles keyed by session id
    pub sessions: Arc<DashMap<String, LayerHandle>>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        auth: Arc<dyn AuthProvider>,
        layers: Arc<dyn LayerService>,
        metrics: Metrics,
    ) -> Self {
        let orchestrator = Arc::new(BatchOrchestrator::new(
            Arc::clone(&config),
            Arc::clone(&layers),
            metrics.clone(),
        ));
        Self {
            config,
            orchestrator,
            auth,
            layers,
            sessions: Arc::new(DashMap::new()),
            metrics,
        }
    }

    /// Layer bound to a session. A session whose token has expired is
    /// forgotten and refused.
    fn layer_for(&self, session_id: &str) -> ApiResult<LayerHandle> {
        let layer = self
            .sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Unknown session: {}", session_id)))?;

        if layer.session.is_expired_at(Utc::now().timestamp_millis()) {
            self.sessions.remove(session_id);
            return Err(auth_error(AuthError::SessionExpired));
        }
        Ok(layer)
    }

    /// Drop sessions whose token expired before `now_ms`; returns how many went
    pub fn evict_expired_sessions(&self, now_ms: i64) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, layer| !layer.session.is_expired_at(now_ms));
        before.saturating_sub(self.sessions.len())
    }

    /// One retention pass over batches and sessions
    pub async fn sweep(&self) {
        let batches = self.orchestrator.sweep_expired().await;
        let sessions = self.evict_expired_sessions(Utc::now().timestamp_millis());
        if batches + sessions > 0 {
            debug!("Retention sweep: {} batch(es), {} session(s) dropped", batches, sessions);
        }
    }

    /// Run `sweep` every configured interval until the task is aborted
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let state = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(state.config.sweep_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                state.sweep().await;
            }
        })
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/stats", get(stats_endpoint))
        .route("/sessions", post(create_session))
        .route("/sessions/{id}/layer", get(layer_info))
        .route("/sessions/{id}/batches", post(start_batch))
        .route("/check_status", get(check_status))
        .route("/batches/{id}", delete(cancel_batch))
        .route("/batches/{id}/status", get(batch_status))
        .route("/batches/{id}/summary", get(batch_summary))
        .route("/processed_images/{id}", post(processed_images))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

#[derive(Debug, Deserialize)]
pub struct SignInRequest {
    pub login_name: String,
    pub password: String,
    pub layer_url: String,
}

#[derive(Debug, Serialize)]
pub struct SignInResponse {
    pub session_id: String,
    pub layer_name: String,
}

#[derive(Debug, Serialize)]
pub struct LayerInfoResponse {
    pub layer_name: String,
    pub fields: Vec<String>,
    pub total_features: u64,
}

#[derive(Debug, Deserialize)]
pub struct StartBatchRequest {
    #[serde(default)]
    pub selected_fields: Vec<String>,
    #[serde(default)]
    pub start_object_id: Option<i64>,
    #[serde(default)]
    pub end_object_id: Option<i64>,
    #[serde(default)]
    pub process_all: bool,
}

impl StartBatchRequest {
    fn range(&self) -> ApiResult<ObjectIdRange> {
        if self.process_all {
            return Ok(ObjectIdRange::All);
        }
        match (self.start_object_id, self.end_object_id) {
            (Some(start), Some(end)) => Ok(ObjectIdRange::Between { start, end }),
            _ => Err((
                StatusCode::BAD_REQUEST,
                "start_object_id and end_object_id are required unless process_all is set"
                    .to_string(),
            )),
        }
    }
}

async fn root() -> &'static str {
    "Survey photo annotator"
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "active_batches": state.orchestrator.active_batches(),
        "tracked_batches": state.orchestrator.tracked_batches(),
        "retention_seconds": state.config.batch_retention().as_secs(),
    }))
}

/// Prometheus metrics endpoint
async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.to_prometheus(),
    )
}

/// Detailed statistics endpoint (JSON)
async fn stats_endpoint(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    serde_json::to_value(state.metrics.snapshot())
        .map(Json)
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to serialize metrics: {}", e),
            )
        })
}

/// Sign in and bind the session to one feature layer
async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<SignInRequest>,
) -> ApiResult<(StatusCode, Json<SignInResponse>)> {
    state.metrics.record_endpoint_request("/sessions");

    let session = state
        .auth
        .sign_in(&request.login_name, &request.password)
        .await
        .map_err(auth_error)?;

    let layer = LayerHandle::new(&request.layer_url, session);
    let info = state.layers.describe_layer(&layer).await.map_err(query_error)?;

    let session_id = uuid::Uuid::new_v4().to_string();
    state.sessions.insert(session_id.clone(), layer);
    info!("Session opened for layer '{}'", info.name);

    Ok((
        StatusCode::CREATED,
        Json(SignInResponse {
            session_id,
            layer_name: info.name,
        }),
    ))
}

/// Layer name, selectable fields and feature count for the field picker
async fn layer_info(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<LayerInfoResponse>> {
    state.metrics.record_endpoint_request("/sessions/layer");
    let layer = state.layer_for(&session_id)?;

    let info = state.layers.describe_layer(&layer).await.map_err(query_error)?;
    let total_features = state.layers.count_records(&layer).await.map_err(query_error)?;

    Ok(Json(LayerInfoResponse {
        layer_name: info.name,
        fields: info.fields,
        total_features,
    }))
}

async fn start_batch(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<StartBatchRequest>,
) -> ApiResult<(StatusCode, Json<BatchTicket>)> {
    state.metrics.record_endpoint_request("/sessions/batches");
    let layer = state.layer_for(&session_id)?;
    let range = request.range()?;

    let ticket = state
        .orchestrator
        .start_batch(BatchRequest {
            layer,
            selected_fields: request.selected_fields,
            range,
        })
        .await
        .map_err(pipeline_error)?;

    Ok((StatusCode::ACCEPTED, Json(ticket)))
}

/// Status of the most recently started batch
async fn check_status(State(state): State<AppState>) -> ApiResult<Json<ProgressStatus>> {
    state.metrics.record_endpoint_request("/check_status");
    state
        .orchestrator
        .latest_status()
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, "No batch has been started".to_string()))
}

async fn batch_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ProgressStatus>> {
    state.metrics.record_endpoint_request("/batches/status");
    let batch_id = parse_batch_id(&id)?;
    state
        .orchestrator
        .status(&batch_id)
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Unknown batch: {}", batch_id)))
}

async fn batch_summary(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<BatchSummary>> {
    state.metrics.record_endpoint_request("/batches/summary");
    let batch_id = parse_batch_id(&id)?;
    state
        .orchestrator
        .summary(&batch_id)
        .map(Json)
        .map_err(pipeline_error)
}

async fn cancel_batch(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    state.metrics.record_endpoint_request("/batches/cancel");
    let batch_id = parse_batch_id(&id)?;
    state.orchestrator.cancel(&batch_id).map_err(pipeline_error)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "cancelling", "batch_id": batch_id })),
    ))
}

/// ZIP of the batch's annotated images; the batch's files are removed afterwards
async fn processed_images(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    state.metrics.record_endpoint_request("/processed_images");
    let batch_id = parse_batch_id(&id)?;
    let bytes = state
        .orchestrator
        .archive(&batch_id)
        .await
        .map_err(pipeline_error)?;

    let disposition = format!("attachment; filename=\"{}\"", batch_id.archive_name());
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

fn parse_batch_id(id: &str) -> ApiResult<BatchId> {
    id.parse()
        .map_err(|e: String| (StatusCode::BAD_REQUEST, e))
}

fn auth_error(e: AuthError) -> (StatusCode, String) {
    warn!("Authentication failed: {}", e);
    match e {
        AuthError::InvalidCredentials(_) | AuthError::SessionExpired => {
            (StatusCode::UNAUTHORIZED, e.to_string())
        }
        AuthError::Unreachable(_) | AuthError::InvalidResponse(_) => {
            (StatusCode::BAD_GATEWAY, e.to_string())
        }
    }
}

fn query_error(e: QueryError) -> (StatusCode, String) {
    warn!("Feature service query failed: {}", e);
    (StatusCode::BAD_GATEWAY, e.to_string())
}

fn pipeline_error(e: PipelineError) -> (StatusCode, String) {
    let status = match &e {
        PipelineError::QueryFailed(_) => StatusCode::BAD_GATEWAY,
        PipelineError::InvalidRange { .. } => StatusCode::BAD_REQUEST,
        PipelineError::UnknownBatch(_) => StatusCode::NOT_FOUND,
        PipelineError::StillRunning(_) | PipelineError::ArchiveInProgress(_) => {
            StatusCode::CONFLICT
        }
        PipelineError::WorkingFolder { .. }
        | PipelineError::TaskFailed(_)
        | PipelineError::ArchiveFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!("Request failed: {}", e);
    }
    (status, e.to_string())
}
