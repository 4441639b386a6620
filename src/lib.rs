//! # Vibez Agent
//!
//! A multi-tenant coding agent service. Each authenticated user gets an
//! isolated workspace directory, a conversation history, and an LLM-driven
//! agent that can read and write files, run scripts, use git and ask a human
//! for approval, all confined to that workspace.
//!
//! ## Architecture
//!
//! ```text
//!   HTTP (api) ──► AgentLoop ──► LlmClient (OpenRouter)
//!                     │
//!                     ▼
//!               ToolRegistry ──► WorkspaceResolver  (path confinement)
//!                     │     ──► ProcessSandbox     (node, git)
//!                     │     ──► ApprovalGate       (approval service)
//!                     ▼
//!               SessionStore (per-user history)
//! ```
//!
//! ## Modules
//! - `workspace`: per-user roots and confined path resolution
//! - `sandbox`: bounded subprocess execution
//! - `tools`: the tool set and its registry
//! - `approval`: approval service client
//! - `session`: conversation storage
//! - `agent`: the turn loop
//! - `llm`: model backend client
//! - `api`: HTTP surface and auth
//! - `config`: environment configuration

pub mod agent;
pub mod api;
pub mod approval;
pub mod config;
pub mod llm;
pub mod locks;
pub mod sandbox;
pub mod session;
pub mod tools;
pub mod workspace;

pub use agent::{AgentLoop, AgentSettings, TurnOutcome};
pub use config::Config;
pub use tools::{ToolRegistry, ToolResult};
pub use workspace::WorkspaceResolver;
