//! Thin HTTP transport over the Agent Service (C9).
//!
//! This is deliberately minimal per spec.md §1's Non-goals (transport,
//! auth, UI rendering are out of scope for the core): it exposes just
//! enough of the Agent Service's surface to drive it end to end and to
//! demonstrate the event-bus-to-SSE wiring described in spec §4.9/§6.
//! File layout, auth, and rendering are the transport's business, not
//! the core's.

mod sse;
mod types;

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

use crate::agent_service::AgentService;
use crate::config::AdapterKind;
use crate::error::CoreError;
use types::{
    AbortResponse, CreateSessionRequest, CreateSessionResponse, ErrorResponse, HistoryResponse,
    PermissionDecisionRequest, QueryRequest, QueryResponse, SessionListResponse, SetAdapterRequest,
    ToggleFastEditRequest,
};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<AgentService>,
}

/// Builds the router. The transport layer owns its own routing and error
/// mapping; the core underneath never depends on axum types.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/sessions", post(create_session).get(list_sessions))
        .route("/api/sessions/:id", get(get_history).delete(delete_session))
        .route("/api/sessions/:id/query", post(process_query))
        .route("/api/sessions/:id/abort", post(abort_operation))
        .route(
            "/api/sessions/:id/permissions/:permission_id",
            post(resolve_permission),
        )
        .route("/api/sessions/:id/fast-edit", post(toggle_fast_edit))
        .route("/api/sessions/:id/adapter", post(set_adapter_kind))
        .route("/api/sessions/:id/events", get(sse::stream_session_events))
        .with_state(state)
}

async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Json<CreateSessionResponse> {
    let session = state.service.start_session_with_cwd(req.cwd.map(Into::into));
    Json(CreateSessionResponse { id: session.id })
}

async fn list_sessions(State(state): State<AppState>) -> Result<Json<SessionListResponse>, AppError> {
    let sessions = state
        .service
        .list_persisted_sessions()
        .await
        .map_err(AppError::from)?;
    Ok(Json(SessionListResponse { sessions }))
}

async fn get_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<HistoryResponse>, AppError> {
    let messages = state.service.get_history(&id).map_err(AppError::from)?;
    Ok(Json(HistoryResponse { messages }))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.service.delete_session(&id).await.map_err(AppError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn process_query(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    let outcome = state
        .service
        .process_query(&id, &req.query)
        .await
        .map_err(AppError::from)?;
    Ok(Json(QueryResponse {
        response: outcome.response,
        tool_results: outcome.tool_results,
        aborted: outcome.aborted,
    }))
}

async fn abort_operation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AbortResponse>, AppError> {
    state.service.abort_operation(&id).map_err(AppError::from)?;
    Ok(Json(AbortResponse { aborted: true }))
}

async fn resolve_permission(
    State(state): State<AppState>,
    Path((_session_id, permission_id)): Path<(String, String)>,
    Json(req): Json<PermissionDecisionRequest>,
) -> Result<StatusCode, AppError> {
    state
        .service
        .resolve_permission(&permission_id, req.granted)
        .map_err(AppError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn toggle_fast_edit(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ToggleFastEditRequest>,
) -> Result<StatusCode, AppError> {
    state
        .service
        .toggle_fast_edit_mode(&id, req.enabled)
        .map_err(AppError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_adapter_kind(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SetAdapterRequest>,
) -> Result<StatusCode, AppError> {
    let kind = match req.kind.as_str() {
        "local" => AdapterKind::Local,
        "container" => AdapterKind::Container,
        "remote" => AdapterKind::Remote,
        other => return Err(AppError::BadRequest(format!("unknown adapter kind: {other}"))),
    };
    state.service.set_adapter_kind(&id, kind).map_err(AppError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::SessionNotFound(_) => Self::NotFound(err.to_string()),
            CoreError::AgentBusy => Self::Conflict(err.to_string()),
            CoreError::ToolValidation(_) | CoreError::InvalidTransition(_) => {
                Self::BadRequest(err.to_string())
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(ErrorResponse::new(message))).into_response()
    }
}
