//! API request and response types.

use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::agent::TurnOutcome;
use crate::session::Message;

/// Error body for every failed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

/// Error as returned from handlers.
pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            success: false,
            error: error.into(),
        }),
    )
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
}

/// Request to run one agent turn.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub clear_history: bool,
}

/// Successful agent turn.
#[derive(Debug, Clone, Serialize)]
pub struct ChatReply {
    pub success: bool,
    #[serde(flatten)]
    pub outcome: TurnOutcome,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub success: bool,
    pub user_id: String,
    pub messages: Vec<Message>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClearHistoryResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub success: bool,
    pub agent_available: bool,
    pub active_conversations: usize,
    pub api_key_configured: bool,
    pub approval_configured: bool,
}
