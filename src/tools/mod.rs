//! Tools the agent can call on behalf of a user.
//!
//! Every tool is confined to the calling user's workspace:
//! - File tools: `read_file`, `write_file`, `list_files`, `delete_file`
//! - Script execution: `run_node`
//! - Git: `git_config`, `git_clone`, `git_command`
//! - Human review: `request_approval`
//!
//! A call arrives as a tool name plus a JSON argument string. It is parsed
//! into a [`ToolInvocation`] (one variant per tool, typed parameters) and
//! executed by the [`ToolRegistry`], which always produces a [`ToolResult`]
//! instead of raising. Failures carry an `errorKind` so the model can tell a
//! rejected path from a missing file or a timed-out script.

mod approval;
mod file_ops;
mod git;
mod terminal;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::approval::{ApprovalGate, SubmissionError};
use crate::llm::{FunctionDefinition, ToolDefinition};
use crate::locks::KeyedLocks;
use crate::sandbox::{ProcessSandbox, SandboxError};
use crate::workspace::{SecurityError, SharedWorkspaceResolver, WorkspaceError};

pub use git::tokenize_command;

/// Default bound for `run_node` when the call does not give one.
pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_millis(30_000);
/// Upper bound a caller can ask `run_node` for.
pub const DEFAULT_MAX_SCRIPT_TIMEOUT: Duration = Duration::from_millis(600_000);
/// Bound for every git process.
pub const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Who a tool runs for, and when to give up.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub user_id: String,
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(user_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            user_id: user_id.into(),
            cancel,
        }
    }
}

/// The closed set of tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    ReadFile,
    WriteFile,
    ListFiles,
    DeleteFile,
    RunNode,
    GitConfig,
    GitClone,
    GitCommand,
    RequestApproval,
}

impl ToolKind {
    pub const ALL: [ToolKind; 9] = [
        ToolKind::ReadFile,
        ToolKind::WriteFile,
        ToolKind::ListFiles,
        ToolKind::DeleteFile,
        ToolKind::RunNode,
        ToolKind::GitConfig,
        ToolKind::GitClone,
        ToolKind::GitCommand,
        ToolKind::RequestApproval,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ToolKind::ReadFile => "read_file",
            ToolKind::WriteFile => "write_file",
            ToolKind::ListFiles => "list_files",
            ToolKind::DeleteFile => "delete_file",
            ToolKind::RunNode => "run_node",
            ToolKind::GitConfig => "git_config",
            ToolKind::GitClone => "git_clone",
            ToolKind::GitCommand => "git_command",
            ToolKind::RequestApproval => "request_approval",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    pub fn description(self) -> &'static str {
        match self {
            ToolKind::ReadFile => {
                "Read a text file from your workspace. Optionally restrict to a 1-indexed, inclusive line range."
            }
            ToolKind::WriteFile => {
                "Write content to a file in your workspace. Creates the file (and parent directories) or overwrites it."
            }
            ToolKind::ListFiles => {
                "List the files and directories in a workspace directory. Set recursive to include subdirectories."
            }
            ToolKind::DeleteFile => "Delete a file from your workspace.",
            ToolKind::RunNode => {
                "Run a Node.js script from your workspace. The working directory is the workspace root. Returns stdout, stderr and the exit code."
            }
            ToolKind::GitConfig => {
                "Set the git user name and email used for commits in your workspace."
            }
            ToolKind::GitClone => {
                "Clone a git repository into a new folder of your workspace. Fails if the folder already exists."
            }
            ToolKind::GitCommand => {
                "Run a git command (for example 'status', 'add .', 'commit -m \"msg\"', 'push') inside a workspace folder."
            }
            ToolKind::RequestApproval => {
                "Submit a request for human approval, for example before publishing or deploying. Returns a request id; it does not wait for the decision."
            }
        }
    }

    pub fn parameters_schema(self) -> Value {
        match self {
            ToolKind::ReadFile => json!({
                "type": "object",
                "properties": {
                    "relativePath": {
                        "type": "string",
                        "description": "Path relative to your workspace root"
                    },
                    "startLine": {
                        "type": "integer",
                        "description": "Optional: first line to return (1-indexed)"
                    },
                    "endLine": {
                        "type": "integer",
                        "description": "Optional: last line to return (inclusive)"
                    }
                },
                "required": ["relativePath"]
            }),
            ToolKind::WriteFile => json!({
                "type": "object",
                "properties": {
                    "relativePath": {
                        "type": "string",
                        "description": "Path relative to your workspace root"
                    },
                    "content": {
                        "type": "string",
                        "description": "The full content to write"
                    }
                },
                "required": ["relativePath", "content"]
            }),
            ToolKind::ListFiles => json!({
                "type": "object",
                "properties": {
                    "relativePath": {
                        "type": "string",
                        "description": "Directory relative to your workspace root (default: the root)"
                    },
                    "recursive": {
                        "type": "boolean",
                        "description": "Include the contents of subdirectories (default: false)"
                    }
                }
            }),
            ToolKind::DeleteFile => json!({
                "type": "object",
                "properties": {
                    "relativePath": {
                        "type": "string",
                        "description": "File path relative to your workspace root"
                    }
                },
                "required": ["relativePath"]
            }),
            ToolKind::RunNode => json!({
                "type": "object",
                "properties": {
                    "relativePath": {
                        "type": "string",
                        "description": "Script path relative to your workspace root"
                    },
                    "timeoutMs": {
                        "type": "integer",
                        "description": "Optional: kill the script after this many milliseconds (default: 30000)"
                    }
                },
                "required": ["relativePath"]
            }),
            ToolKind::GitConfig => json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string", "description": "Author name for commits" },
                    "email": { "type": "string", "description": "Author email for commits" }
                },
                "required": ["name", "email"]
            }),
            ToolKind::GitClone => json!({
                "type": "object",
                "properties": {
                    "repoUrl": {
                        "type": "string",
                        "description": "Repository URL (https, ssh or git@host:path)"
                    },
                    "folderName": {
                        "type": "string",
                        "description": "Folder to clone into, relative to your workspace root"
                    },
                    "branch": {
                        "type": "string",
                        "description": "Optional: branch to check out"
                    }
                },
                "required": ["repoUrl", "folderName"]
            }),
            ToolKind::GitCommand => json!({
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "description": "Git command without the leading 'git', e.g. 'status' or 'commit -m \"msg\"'"
                    },
                    "folderPath": {
                        "type": "string",
                        "description": "Repository folder relative to your workspace root"
                    }
                },
                "required": ["command", "folderPath"]
            }),
            ToolKind::RequestApproval => json!({
                "type": "object",
                "properties": {
                    "title": { "type": "string", "description": "Short summary of what needs approval" },
                    "description": { "type": "string", "description": "What will happen and why" },
                    "code_snippet": { "type": "string", "description": "Optional: relevant code to review" },
                    "metadata": { "type": "object", "description": "Optional: extra context" }
                },
                "required": ["title", "description"]
            }),
        }
    }

    /// Definition in the shape the model backend expects.
    pub fn definition(self) -> ToolDefinition {
        ToolDefinition {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: self.name().to_string(),
                description: self.description().to_string(),
                parameters: self.parameters_schema(),
            },
        }
    }
}

fn root_dir() -> String {
    ".".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadFileParams {
    pub relative_path: String,
    #[serde(default)]
    pub start_line: Option<usize>,
    #[serde(default)]
    pub end_line: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteFileParams {
    pub relative_path: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFilesParams {
    #[serde(default = "root_dir")]
    pub relative_path: String,
    #[serde(default)]
    pub recursive: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteFileParams {
    pub relative_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunNodeParams {
    pub relative_path: String,
    #[serde(default, alias = "timeout")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitConfigParams {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitCloneParams {
    pub repo_url: String,
    pub folder_name: String,
    #[serde(default)]
    pub branch: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitCommandParams {
    pub command: String,
    #[serde(default = "root_dir")]
    pub folder_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequestApprovalParams {
    pub title: String,
    pub description: String,
    #[serde(default, alias = "codeSnippet")]
    pub code_snippet: Option<String>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

/// A parsed, typed tool call.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "name", content = "arguments", rename_all = "snake_case")]
pub enum ToolInvocation {
    ReadFile(ReadFileParams),
    WriteFile(WriteFileParams),
    ListFiles(ListFilesParams),
    DeleteFile(DeleteFileParams),
    RunNode(RunNodeParams),
    GitConfig(GitConfigParams),
    GitClone(GitCloneParams),
    GitCommand(GitCommandParams),
    RequestApproval(RequestApprovalParams),
}

impl ToolInvocation {
    /// Parse a model tool call. Empty arguments mean `{}`.
    pub fn parse(name: &str, arguments: &str) -> Result<Self, ToolError> {
        let kind = ToolKind::from_name(name).ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;

        let arguments = if arguments.trim().is_empty() {
            Value::Object(Map::new())
        } else {
            serde_json::from_str::<Value>(arguments).map_err(|e| ToolError::InvalidParameters {
                tool: kind.name(),
                message: format!("arguments are not valid JSON: {}", e),
            })?
        };

        serde_json::from_value(json!({ "name": kind.name(), "arguments": arguments })).map_err(|e| {
            ToolError::InvalidParameters {
                tool: kind.name(),
                message: e.to_string(),
            }
        })
    }

    pub fn kind(&self) -> ToolKind {
        match self {
            ToolInvocation::ReadFile(_) => ToolKind::ReadFile,
            ToolInvocation::WriteFile(_) => ToolKind::WriteFile,
            ToolInvocation::ListFiles(_) => ToolKind::ListFiles,
            ToolInvocation::DeleteFile(_) => ToolKind::DeleteFile,
            ToolInvocation::RunNode(_) => ToolKind::RunNode,
            ToolInvocation::GitConfig(_) => ToolKind::GitConfig,
            ToolInvocation::GitClone(_) => ToolKind::GitClone,
            ToolInvocation::GitCommand(_) => ToolKind::GitCommand,
            ToolInvocation::RequestApproval(_) => ToolKind::RequestApproval,
        }
    }
}

/// Machine-readable failure class reported to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    Security,
    Io,
    Timeout,
    Process,
    Submission,
    InvalidParameters,
    UnknownTool,
    AlreadyExists,
    NotFound,
    Cancelled,
}

/// Why a tool call failed.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error("{0}")]
    Io(String),

    #[error("Timed out after {timeout_ms} ms; the process was killed")]
    Timeout { timeout_ms: u64 },

    #[error("{0}")]
    Process(String),

    #[error("Process exited with code {exit_code}")]
    ProcessExit {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("Approval request failed: {0}")]
    Submission(#[from] SubmissionError),

    #[error("Invalid parameters for {tool}: {message}")]
    InvalidParameters { tool: &'static str, message: String },

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Folder already exists: {0}")]
    AlreadyExists(String),

    #[error("Folder does not exist: {0}")]
    NotFound(String),

    #[error("Cancelled")]
    Cancelled,
}

impl ToolError {
    /// I/O failure on a workspace path, shown relative to the workspace.
    pub fn io(action: &str, display_path: &str, err: std::io::Error) -> Self {
        ToolError::Io(format!("Failed to {} {}: {}", action, display_path, err))
    }

    pub fn invalid(tool: ToolKind, message: impl Into<String>) -> Self {
        ToolError::InvalidParameters {
            tool: tool.name(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ToolErrorKind {
        match self {
            ToolError::Security(_) => ToolErrorKind::Security,
            ToolError::Io(_) => ToolErrorKind::Io,
            ToolError::Timeout { .. } => ToolErrorKind::Timeout,
            ToolError::Process(_) | ToolError::ProcessExit { .. } => ToolErrorKind::Process,
            ToolError::Submission(_) => ToolErrorKind::Submission,
            ToolError::InvalidParameters { .. } => ToolErrorKind::InvalidParameters,
            ToolError::UnknownTool(_) => ToolErrorKind::UnknownTool,
            ToolError::AlreadyExists(_) => ToolErrorKind::AlreadyExists,
            ToolError::NotFound(_) => ToolErrorKind::NotFound,
            ToolError::Cancelled => ToolErrorKind::Cancelled,
        }
    }
}

impl From<WorkspaceError> for ToolError {
    fn from(err: WorkspaceError) -> Self {
        match err {
            WorkspaceError::Security(e) => ToolError::Security(e),
            WorkspaceError::Io(e) => ToolError::Io(format!("Workspace unavailable: {}", e)),
        }
    }
}

impl From<SandboxError> for ToolError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::Spawn { .. } => ToolError::Process(err.to_string()),
            SandboxError::Io(e) => ToolError::Io(format!("Process I/O failed: {}", e)),
            SandboxError::Timeout { timeout, .. } => ToolError::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            },
            SandboxError::Cancelled => ToolError::Cancelled,
        }
    }
}

/// Successful tool payload: fields merged into the result object.
pub type Payload = Map<String, Value>;

type ToolOutcome = Result<Payload, ToolError>;

/// What the model sees for one tool call.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(flatten)]
    pub payload: Payload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "errorKind", skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ToolErrorKind>,
}

impl ToolResult {
    pub fn ok(payload: Payload) -> Self {
        Self {
            success: true,
            payload,
            error: None,
            error_kind: None,
        }
    }

    pub fn failure(err: &ToolError) -> Self {
        let mut payload = Payload::new();
        if let ToolError::ProcessExit {
            exit_code,
            stdout,
            stderr,
        } = err
        {
            payload.insert("exitCode".into(), json!(exit_code));
            payload.insert("stdout".into(), json!(stdout));
            payload.insert("stderr".into(), json!(stderr));
        }
        Self {
            success: false,
            payload,
            error: Some(err.to_string()),
            error_kind: Some(err.kind()),
        }
    }

    /// Serialized form fed back to the model.
    pub fn to_content(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            json!({ "success": false, "error": format!("Failed to encode tool result: {}", e) })
                .to_string()
        })
    }

    /// Payload field lookup, mostly for tests and logging.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
}

impl From<ToolOutcome> for ToolResult {
    fn from(outcome: ToolOutcome) -> Self {
        match outcome {
            Ok(payload) => ToolResult::ok(payload),
            Err(err) => ToolResult::failure(&err),
        }
    }
}

/// Limits for process-backed tools.
#[derive(Debug, Clone)]
pub struct ToolSettings {
    /// Program that runs scripts for `run_node`.
    pub script_runner: String,
    pub script_timeout: Duration,
    pub max_script_timeout: Duration,
    pub git_timeout: Duration,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            script_runner: "node".to_string(),
            script_timeout: DEFAULT_SCRIPT_TIMEOUT,
            max_script_timeout: DEFAULT_MAX_SCRIPT_TIMEOUT,
            git_timeout: DEFAULT_GIT_TIMEOUT,
        }
    }
}

/// Executes tool calls against its injected dependencies.
pub struct ToolRegistry {
    workspaces: SharedWorkspaceResolver,
    sandbox: ProcessSandbox,
    approvals: Arc<dyn ApprovalGate>,
    settings: ToolSettings,
    clone_locks: KeyedLocks<(String, PathBuf)>,
}

impl ToolRegistry {
    pub fn new(
        workspaces: SharedWorkspaceResolver,
        sandbox: ProcessSandbox,
        approvals: Arc<dyn ApprovalGate>,
        settings: ToolSettings,
    ) -> Self {
        Self {
            workspaces,
            sandbox,
            approvals,
            settings,
            clone_locks: KeyedLocks::new(),
        }
    }

    /// Tool definitions to declare to the model.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        ToolKind::ALL.into_iter().map(ToolKind::definition).collect()
    }

    /// Parse and execute a raw model tool call.
    pub async fn execute_call(&self, ctx: &ExecutionContext, name: &str, arguments: &str) -> ToolResult {
        match ToolInvocation::parse(name, arguments) {
            Ok(invocation) => self.execute(ctx, invocation).await,
            Err(err) => {
                tracing::warn!(user_id = %ctx.user_id, tool = name, "Rejected tool call: {}", err);
                ToolResult::failure(&err)
            }
        }
    }

    /// Execute a typed tool call. Never fails past this boundary.
    pub async fn execute(&self, ctx: &ExecutionContext, invocation: ToolInvocation) -> ToolResult {
        let tool = invocation.kind().name();
        tracing::debug!(user_id = %ctx.user_id, tool, "Executing tool");

        if ctx.cancel.is_cancelled() {
            return ToolResult::failure(&ToolError::Cancelled);
        }

        // Polling dispatch first lets the sandbox see the cancellation and
        // kill the whole process group before the future is dropped.
        let outcome = tokio::select! {
            biased;
            outcome = self.dispatch(ctx, invocation) => outcome,
            _ = ctx.cancel.cancelled() => Err(ToolError::Cancelled),
        };

        match &outcome {
            Ok(_) => tracing::debug!(user_id = %ctx.user_id, tool, "Tool succeeded"),
            Err(ToolError::Security(e)) => {
                tracing::warn!(user_id = %ctx.user_id, tool, "Tool rejected: {}", e)
            }
            Err(e) => tracing::info!(user_id = %ctx.user_id, tool, "Tool failed: {}", e),
        }
        outcome.into()
    }

    async fn dispatch(&self, ctx: &ExecutionContext, invocation: ToolInvocation) -> ToolOutcome {
        match invocation {
            ToolInvocation::ReadFile(p) => file_ops::read_file(&self.workspaces, ctx, p).await,
            ToolInvocation::WriteFile(p) => file_ops::write_file(&self.workspaces, ctx, p).await,
            ToolInvocation::ListFiles(p) => file_ops::list_files(&self.workspaces, ctx, p).await,
            ToolInvocation::DeleteFile(p) => file_ops::delete_file(&self.workspaces, ctx, p).await,
            ToolInvocation::RunNode(p) => terminal::run_node(self, ctx, p).await,
            ToolInvocation::GitConfig(p) => git::git_config(self, ctx, p).await,
            ToolInvocation::GitClone(p) => git::git_clone(self, ctx, p).await,
            ToolInvocation::GitCommand(p) => git::git_command(self, ctx, p).await,
            ToolInvocation::RequestApproval(p) => approval::request_approval(self, ctx, p).await,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::approval::DisabledApprovalGate;
    use crate::workspace::WorkspaceResolver;

    /// Registry over a fresh temp workspace base.
    pub async fn registry_with(
        approvals: Arc<dyn ApprovalGate>,
        settings: ToolSettings,
    ) -> (ToolRegistry, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_at(&dir.path().join("workspaces"), approvals, settings).await;
        (registry, dir)
    }

    /// Registry whose workspaces live under `base`.
    pub async fn registry_at(
        base: &std::path::Path,
        approvals: Arc<dyn ApprovalGate>,
        settings: ToolSettings,
    ) -> ToolRegistry {
        let workspaces = Arc::new(WorkspaceResolver::new(base).await.unwrap());
        ToolRegistry::new(workspaces, ProcessSandbox::default(), approvals, settings)
    }

    pub async fn registry() -> (ToolRegistry, tempfile::TempDir) {
        registry_with(Arc::new(DisabledApprovalGate), ToolSettings::default()).await
    }

    pub async fn call(registry: &ToolRegistry, user: &str, name: &str, args: Value) -> ToolResult {
        registry
            .execute_call(&ExecutionContext::new(user), name, &args.to_string())
            .await
    }
}
