//! REST control surface for fetchers and conversation threads.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::warn;

use crate::diagnostics::{Diagnostics, LogStream};
use crate::error::{ConversationError, EngineError, FetcherError, RegistryError};
use crate::fetcher::FetcherManager;
use crate::orchestrator::ConversationEngine;
use crate::tenant::{ResourceRegistry, TenantContext};

/// Largest page served by the log endpoint.
const MAX_LOG_LIMIT: usize = 500;
const DEFAULT_LOG_LIMIT: usize = 50;

/// State shared across handlers.
#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<FetcherManager>,
    pub registry: Arc<ResourceRegistry>,
    pub engine: Arc<ConversationEngine>,
    pub diagnostics: Arc<Diagnostics>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tenants/{uid}/fetcher/start", post(start_fetcher))
        .route("/tenants/{uid}/fetcher/stop", post(stop_fetcher))
        .route("/tenants/{uid}/fetcher/run", post(run_fetcher))
        .route("/tenants/{uid}/fetcher/status", get(fetcher_status))
        .route("/tenants/{uid}/fetcher/log", get(fetcher_log))
        .route("/tenants/{uid}/threads/{thread_id}", get(get_thread))
        .route("/tenants/{uid}/threads/{thread_id}/step", post(step_thread))
        .route("/tenants/{uid}/threads/{thread_id}/finalize", post(finalize_thread))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Handler error mapped onto an HTTP status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(status = %self.status, error = %self.message, "Request failed");
        }
        (self.status, Json(json!({"error": self.message}))).into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::Tenant(_) => Self::new(StatusCode::BAD_REQUEST, e.to_string()),
            RegistryError::Storage(_) => Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }
}

impl From<FetcherError> for ApiError {
    fn from(e: FetcherError) -> Self {
        match e {
            FetcherError::Tenant(_) => Self::new(StatusCode::BAD_REQUEST, e.to_string()),
            FetcherError::Registry(inner) => inner.into(),
            _ => Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let status = match &e {
            EngineError::NotFound { .. } | EngineError::Conversation(ConversationError::NotFound { .. }) => {
                StatusCode::NOT_FOUND
            }
            EngineError::Conversation(_) => StatusCode::CONFLICT,
            EngineError::StepTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            EngineError::Llm(_) => StatusCode::BAD_GATEWAY,
            EngineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

type ApiResult = Result<Response, ApiError>;

async fn context(state: &ApiState, uid: &str) -> Result<TenantContext, ApiError> {
    Ok(state.registry.context(uid).await?)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "mail-director"
    }))
}

// ── Fetcher ─────────────────────────────────────────────────────────────

async fn start_fetcher(State(state): State<ApiState>, Path(uid): Path<String>) -> ApiResult {
    let status = state.manager.start(&uid).await?;
    Ok(Json(status).into_response())
}

async fn stop_fetcher(State(state): State<ApiState>, Path(uid): Path<String>) -> ApiResult {
    let status = state.manager.stop(&uid).await?;
    Ok(Json(status).into_response())
}

async fn run_fetcher(State(state): State<ApiState>, Path(uid): Path<String>) -> ApiResult {
    let run = state.manager.run_once(&uid).await?;
    Ok(Json(run).into_response())
}

async fn fetcher_status(State(state): State<ApiState>, Path(uid): Path<String>) -> ApiResult {
    let status = state.manager.status(&uid).await?;
    Ok(Json(status).into_response())
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    limit: Option<usize>,
}

async fn fetcher_log(
    State(state): State<ApiState>,
    Path(uid): Path<String>,
    Query(query): Query<LogQuery>,
) -> ApiResult {
    let ctx = context(&state, &uid).await?;
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).min(MAX_LOG_LIMIT);
    let entries = state
        .diagnostics
        .log
        .recent(&ctx, LogStream::Fetcher, limit)
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(json!({ "entries": entries })).into_response())
}

// ── Threads ─────────────────────────────────────────────────────────────

async fn get_thread(
    State(state): State<ApiState>,
    Path((uid, thread_id)): Path<(String, String)>,
) -> ApiResult {
    let ctx = context(&state, &uid).await?;
    let thread = state.engine.get_thread(&ctx, &thread_id).await?;
    Ok(Json(thread).into_response())
}

async fn step_thread(
    State(state): State<ApiState>,
    Path((uid, thread_id)): Path<(String, String)>,
) -> ApiResult {
    let ctx = context(&state, &uid).await?;
    let outcome = state.engine.run_step(&ctx, &thread_id).await?;
    Ok(Json(outcome).into_response())
}

async fn finalize_thread(
    State(state): State<ApiState>,
    Path((uid, thread_id)): Path<(String, String)>,
) -> ApiResult {
    let ctx = context(&state, &uid).await?;
    let thread = state.engine.finalize_thread(&ctx, &thread_id).await?;
    Ok(Json(thread).into_response())
}
