//! Configuration management.
//!
//! Configuration is read from environment variables:
//! - `HOST` - Address to bind (default: 0.0.0.0)
//! - `PORT` - Server port (default: 3000)
//! - `DEV_MODE` - Bypass authentication (default: false)
//! - `DEV_USER_ID` - Principal used when auth is bypassed (default: dev)
//! - `JWT_SECRET` - HS256 secret for bearer tokens
//! - `WORKSPACES_ROOT` - Directory holding one workspace per user (default: ./workspaces)
//! - `OPENROUTER_API_KEY` - Model backend credential; without it the agent is unavailable
//! - `AGENT_MODEL` - Model id (default: anthropic/claude-sonnet-4.5)
//! - `AGENT_MAX_ITERATIONS` - Model calls per turn (default: 25)
//! - `AGENT_TEMPERATURE` - Sampling temperature (default: 0.2)
//! - `AGENT_MAX_TOKENS` - Output token limit per call (default: 4096)
//! - `TURN_TIMEOUT_SECS` - Wall-clock bound for one chat turn (default: 600)
//! - `APPROVAL_API_URL` / `APPROVAL_API_KEY` - Approval service endpoint and key
//! - `APPROVAL_TIMEOUT_SECS` - Approval request timeout (default: 15)
//! - `SCRIPT_RUNNER` - Program that runs `run_node` scripts (default: node)
//! - `SCRIPT_TIMEOUT_MS` / `SCRIPT_MAX_TIMEOUT_MS` - Script timeout default and cap
//! - `GIT_TIMEOUT_SECS` - Bound for git processes (default: 120)
//! - `MAX_OUTPUT_BYTES` - Per-stream capture limit for subprocesses (default: 1 MiB)

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::agent::{AgentSettings, DEFAULT_MAX_ITERATIONS, DEFAULT_MAX_TOKENS, DEFAULT_MODEL, DEFAULT_TEMPERATURE};
use crate::approval::DEFAULT_APPROVAL_TIMEOUT;
use crate::sandbox::DEFAULT_MAX_OUTPUT_BYTES;
use crate::tools::{ToolSettings, DEFAULT_GIT_TIMEOUT, DEFAULT_MAX_SCRIPT_TIMEOUT, DEFAULT_SCRIPT_TIMEOUT};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: '{value}' ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{key} is required when {because} is set")]
    MissingValue {
        key: &'static str,
        because: &'static str,
    },
}

/// Bearer-token authentication settings.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: Option<String>,
    /// Principal assigned to every request in dev mode.
    pub dev_user_id: String,
}

impl AuthConfig {
    pub fn auth_required(&self, dev_mode: bool) -> bool {
        !dev_mode
    }
}

/// Model backend and turn limits.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub max_iterations: usize,
    pub temperature: f64,
    pub max_tokens: u64,
    pub turn_timeout: Duration,
}

/// Approval service endpoint.
#[derive(Debug, Clone)]
pub struct ApprovalConfig {
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

/// Subprocess limits for tools.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub script_runner: String,
    pub script_timeout: Duration,
    pub max_script_timeout: Duration,
    pub git_timeout: Duration,
    pub max_output_bytes: usize,
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub dev_mode: bool,
    pub auth: AuthConfig,
    pub workspaces_root: PathBuf,
    pub agent: AgentConfig,
    pub approval: ApprovalConfig,
    pub process: ProcessConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);

        let dev_mode = vars.flag("DEV_MODE")?.unwrap_or(false);
        let auth = AuthConfig {
            jwt_secret: vars.string("JWT_SECRET"),
            dev_user_id: vars.string("DEV_USER_ID").unwrap_or_else(|| "dev".to_string()),
        };
        if !dev_mode && auth.jwt_secret.is_none() {
            tracing::warn!("JWT_SECRET is not set; authenticated endpoints will reject every request");
        }

        let agent = AgentConfig {
            api_key: vars.string("OPENROUTER_API_KEY"),
            model: vars.string("AGENT_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            max_iterations: vars.parse("AGENT_MAX_ITERATIONS")?.unwrap_or(DEFAULT_MAX_ITERATIONS),
            temperature: vars.parse("AGENT_TEMPERATURE")?.unwrap_or(DEFAULT_TEMPERATURE),
            max_tokens: vars.parse("AGENT_MAX_TOKENS")?.unwrap_or(DEFAULT_MAX_TOKENS),
            turn_timeout: vars
                .parse("TURN_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(600)),
        };
        if agent.max_iterations == 0 {
            return Err(ConfigError::InvalidValue {
                key: "AGENT_MAX_ITERATIONS",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let approval = ApprovalConfig {
            url: vars.url("APPROVAL_API_URL")?,
            api_key: vars.string("APPROVAL_API_KEY"),
            timeout: vars
                .parse("APPROVAL_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_APPROVAL_TIMEOUT),
        };
        if approval.url.is_some() && approval.api_key.is_none() {
            return Err(ConfigError::MissingValue {
                key: "APPROVAL_API_KEY",
                because: "APPROVAL_API_URL",
            });
        }

        let process = ProcessConfig {
            script_runner: vars.string("SCRIPT_RUNNER").unwrap_or_else(|| "node".to_string()),
            script_timeout: vars
                .parse("SCRIPT_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_SCRIPT_TIMEOUT),
            max_script_timeout: vars
                .parse("SCRIPT_MAX_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_MAX_SCRIPT_TIMEOUT),
            git_timeout: vars
                .parse("GIT_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_GIT_TIMEOUT),
            max_output_bytes: vars.parse("MAX_OUTPUT_BYTES")?.unwrap_or(DEFAULT_MAX_OUTPUT_BYTES),
        };

        Ok(Self {
            host: vars.string("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: vars.parse("PORT")?.unwrap_or(3000),
            dev_mode,
            auth,
            workspaces_root: vars
                .string("WORKSPACES_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./workspaces")),
            agent,
            approval,
            process,
        })
    }

    /// Agent loop settings derived from this config.
    pub fn agent_settings(&self) -> AgentSettings {
        AgentSettings {
            model: self.agent.model.clone(),
            max_iterations: self.agent.max_iterations,
            temperature: self.agent.temperature,
            max_tokens: self.agent.max_tokens,
            ..AgentSettings::default()
        }
    }

    /// Tool limits derived from this config.
    pub fn tool_settings(&self) -> ToolSettings {
        ToolSettings {
            script_runner: self.process.script_runner.clone(),
            script_timeout: self.process.script_timeout.min(self.process.max_script_timeout),
            max_script_timeout: self.process.max_script_timeout,
            git_timeout: self.process.git_timeout,
        }
    }
}

struct Vars<F>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(key) {
            None => Ok(None),
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    key,
                    reason: e.to_string(),
                    value,
                }),
        }
    }

    fn flag(&self, key: &'static str) -> Result<Option<bool>, ConfigError> {
        match self.string(key) {
            None => Ok(None),
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(Some(true)),
                "0" | "false" | "no" | "off" => Ok(Some(false)),
                _ => Err(ConfigError::InvalidValue {
                    key,
                    value,
                    reason: "expected true or false".to_string(),
                }),
            },
        }
    }

    fn url(&self, key: &'static str) -> Result<Option<String>, ConfigError> {
        match self.string(key) {
            None => Ok(None),
            Some(value) => match url::Url::parse(&value) {
                Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(Some(value)),
                Ok(parsed) => Err(ConfigError::InvalidValue {
                    key,
                    reason: format!("unsupported scheme '{}'", parsed.scheme()),
                    value,
                }),
                Err(e) => Err(ConfigError::InvalidValue {
                    key,
                    reason: e.to_string(),
                    value,
                }),
            },
        }
    }
}
