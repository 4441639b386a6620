//! HTTP route wiring and server lifecycle.

use std::sync::Arc;

use axum::middleware;
use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::agent::AgentLoop;
use crate::approval::{ApprovalGate, DisabledApprovalGate, HttpApprovalGate};
use crate::config::Config;
use crate::llm::{LlmClient, OpenRouterClient};
use crate::sandbox::ProcessSandbox;
use crate::session::{InMemorySessionStore, SharedSessionStore};
use crate::tools::ToolRegistry;
use crate::workspace::WorkspaceResolver;

use super::agent as agent_api;
use super::auth;
use super::types::{api_error, ApiError, HealthResponse};

/// Shared application state.
pub struct AppState {
    pub config: Config,
    /// `None` when no model credential is configured
    pub agent: Option<Arc<AgentLoop>>,
    pub sessions: SharedSessionStore,
    pub approvals_configured: bool,
}

impl AppState {
    /// Build state with the OpenRouter backend when a key is configured.
    pub async fn new(config: Config) -> anyhow::Result<Arc<Self>> {
        let llm: Option<Arc<dyn LlmClient>> = match config.agent.api_key.clone() {
            Some(key) => Some(Arc::new(OpenRouterClient::new(key))),
            None => {
                tracing::warn!("OPENROUTER_API_KEY not set; agent chat will answer 503 until it is configured");
                None
            }
        };
        Self::with_llm(config, llm).await
    }

    /// Build state around any model backend.
    pub async fn with_llm(config: Config, llm: Option<Arc<dyn LlmClient>>) -> anyhow::Result<Arc<Self>> {
        let workspaces = Arc::new(WorkspaceResolver::new(&config.workspaces_root).await?);

        let approvals: Arc<dyn ApprovalGate> = match (&config.approval.url, &config.approval.api_key) {
            (Some(url), Some(key)) => {
                tracing::info!("Approval service configured at {}", url);
                Arc::new(HttpApprovalGate::new(url.clone(), key.clone(), config.approval.timeout))
            }
            _ => {
                tracing::info!("Approval service disabled (no APPROVAL_API_URL)");
                Arc::new(DisabledApprovalGate)
            }
        };
        let approvals_configured = approvals.is_configured();

        let sessions: SharedSessionStore = Arc::new(InMemorySessionStore::new());
        let agent = llm.map(|llm| {
            let tools = Arc::new(ToolRegistry::new(
                Arc::clone(&workspaces),
                ProcessSandbox::new(config.process.max_output_bytes),
                approvals,
                config.tool_settings(),
            ));
            tracing::info!(model = %config.agent.model, "Coding agent ready");
            Arc::new(AgentLoop::new(llm, tools, Arc::clone(&sessions), config.agent_settings()))
        });

        Ok(Arc::new(Self {
            config,
            agent,
            sessions,
            approvals_configured,
        }))
    }
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/api/agent/status", get(agent_api::status));

    let protected_routes = Router::new()
        .route("/api/agent/chat", post(agent_api::chat))
        .route(
            "/api/agent/history",
            get(agent_api::get_history).delete(agent_api::clear_history),
        )
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_auth,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .fallback(not_found)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn not_found() -> ApiError {
    api_error(StatusCode::NOT_FOUND, "Not Found")
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let state = AppState::new(config).await?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for SIGTERM/SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining in-flight requests...");
}

/// Health check endpoint.
async fn health(State(_state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}
