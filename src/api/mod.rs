//! HTTP API for the coding agent.
//!
//! ## Endpoints
//!
//! - `GET /health` - Health check
//! - `GET /api/agent/status` - Agent availability and session count
//! - `POST /api/agent/chat` - Run one agent turn for the caller
//! - `GET /api/agent/history` - The caller's conversation
//! - `DELETE /api/agent/history` - Clear the caller's conversation

mod agent;
pub mod auth;
mod routes;
pub mod types;

pub use routes::{router, serve, AppState};
