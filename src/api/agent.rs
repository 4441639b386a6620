//! Agent chat, history and status handlers.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, State},
    http::StatusCode,
    Json,
};
use tokio_util::sync::CancellationToken;

use super::auth::AuthUser;
use super::routes::AppState;
use super::types::*;
use crate::agent::AgentError;

/// Run one agent turn for the authenticated user.
pub async fn chat(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatReply>, ApiError> {
    let Json(req) = payload.map_err(|e| {
        api_error(
            StatusCode::BAD_REQUEST,
            format!("Message is required and must be a string ({})", e.body_text()),
        )
    })?;
    if req.message.trim().is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Message is required and must be a non-empty string",
        ));
    }

    let agent = state.agent.as_ref().ok_or_else(|| {
        api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "Agent is not available. Check that OPENROUTER_API_KEY is configured.",
        )
    })?;

    // Cancels the turn (and its subprocesses) if the client goes away.
    let cancel = CancellationToken::new();
    let _disconnect = cancel.clone().drop_guard();

    tracing::info!(user_id = %user.id, clear_history = req.clear_history, "Chat request");

    let turn_timeout = state.config.agent.turn_timeout;
    let turn = agent.run_turn(&user.id, &req.message, req.clear_history, cancel.clone());
    tokio::pin!(turn);
    let result = tokio::select! {
        result = &mut turn => result,
        _ = tokio::time::sleep(turn_timeout) => {
            // Let the turn observe cancellation so running tools are reaped.
            cancel.cancel();
            let _ = turn.await;
            tracing::warn!(user_id = %user.id, timeout_secs = turn_timeout.as_secs(), "Agent turn timed out");
            return Err(api_error(
                StatusCode::GATEWAY_TIMEOUT,
                format!("Agent turn timed out after {} seconds", turn_timeout.as_secs()),
            ));
        }
    };

    match result {
        Ok(outcome) => Ok(Json(ChatReply {
            success: true,
            outcome,
        })),
        Err(AgentError::EmptyMessage) => Err(api_error(
            StatusCode::BAD_REQUEST,
            AgentError::EmptyMessage.to_string(),
        )),
        Err(e) => {
            tracing::error!(user_id = %user.id, "Agent turn failed: {}", e);
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

pub async fn get_history(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Json<HistoryResponse> {
    let messages = state.sessions.history(&user.id).await;
    Json(HistoryResponse {
        success: true,
        user_id: user.id,
        count: messages.len(),
        messages,
    })
}

pub async fn clear_history(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Json<ClearHistoryResponse> {
    // Through the agent so an in-flight turn finishes first.
    match &state.agent {
        Some(agent) => agent.clear_history(&user.id).await,
        None => state.sessions.clear(&user.id).await,
    };
    tracing::info!(user_id = %user.id, "Conversation history cleared");
    Json(ClearHistoryResponse {
        success: true,
        message: "Conversation history cleared".to_string(),
    })
}

pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        success: true,
        agent_available: state.agent.is_some(),
        active_conversations: state.sessions.session_count().await,
        api_key_configured: state.config.agent.api_key.is_some(),
        approval_configured: state.approvals_configured,
    })
}
