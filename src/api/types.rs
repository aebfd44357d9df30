//! Request/response bodies for the thin HTTP transport.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::{ConversationEntry, SessionSummary};

#[derive(Debug, Deserialize, Default)]
pub struct CreateSessionRequest {
    pub cwd: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionSummary>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub messages: Vec<ConversationEntry>,
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub query: String,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub response: String,
    pub tool_results: Vec<Value>,
    pub aborted: bool,
}

#[derive(Debug, Serialize)]
pub struct AbortResponse {
    pub aborted: bool,
}

#[derive(Debug, Deserialize)]
pub struct PermissionDecisionRequest {
    pub granted: bool,
}

#[derive(Debug, Deserialize)]
pub struct ToggleFastEditRequest {
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct SetAdapterRequest {
    pub kind: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self { error: message.into() }
    }
}
