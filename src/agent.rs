//! The coding agent loop.
//!
//! A turn sends the system prompt, the user's stored history and the new
//! message to the model. While the model asks for tools, each call is run in
//! order through the [`ToolRegistry`] and its result fed back. The final text
//! answer ends the turn; only then are the user message and the reply appended
//! to the session, together.
//!
//! The loop itself holds no conversation state. Turns for one user are
//! serialized by a fair per-user lock taken before anything else, so they are
//! applied in the order they were accepted. Different users never wait on each
//! other.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::llm::{ChatMessage, ChatOptions, LlmClient, Role, TokenUsage};
use crate::locks::KeyedLocks;
use crate::session::{Message, MessageRole, SharedSessionStore};
use crate::tools::{ExecutionContext, ToolRegistry};

pub const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4.5";
pub const DEFAULT_MAX_ITERATIONS: usize = 25;
pub const DEFAULT_TEMPERATURE: f64 = 0.2;
pub const DEFAULT_MAX_TOKENS: u64 = 4096;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a senior full-stack engineer with access to a user's isolated workspace.
You can read, write, list and delete files, run Node.js scripts, and work with git repositories.

Your tools:
- read_file: read a file in the workspace
- write_file: create or modify files
- list_files: list directory contents
- delete_file: remove files
- run_node: execute Node.js scripts and see their output
- git_config, git_clone, git_command: set the commit identity, clone repositories, run git commands
- request_approval: ask the user for explicit sign-off

Working practices:
1. Check that a file exists with list_files before reading it
2. Explain what you are doing step by step
3. Write clean code with comments where they help
4. Test your code with run_node when appropriate
5. Be helpful, clear and concise

Every user has their own isolated workspace. All paths are relative to it and you cannot reach files outside it.

Use request_approval before deleting several or important files, before running potentially destructive commands, before significant changes to critical files, and before deploying or publishing code.";

/// Model and loop parameters.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub model: String,
    pub max_iterations: usize,
    pub temperature: f64,
    pub max_tokens: u64,
    pub system_prompt: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Message must be a non-empty string")]
    EmptyMessage,

    #[error("Model request failed: {0:#}")]
    Llm(anyhow::Error),

    #[error("Turn was cancelled")]
    Cancelled,

    #[error("No final answer after {0} model calls")]
    MaxIterations(usize),
}

/// Result of one completed turn.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnOutcome {
    pub reply: String,
    pub tool_call_count: usize,
    pub conversation_length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

pub struct AgentLoop {
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,
    sessions: SharedSessionStore,
    turns: KeyedLocks<String>,
    settings: AgentSettings,
}

impl AgentLoop {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        tools: Arc<ToolRegistry>,
        sessions: SharedSessionStore,
        settings: AgentSettings,
    ) -> Self {
        Self {
            llm,
            tools,
            sessions,
            turns: KeyedLocks::new(),
            settings,
        }
    }

    /// Run one turn for `user_id`.
    pub async fn run_turn(
        &self,
        user_id: &str,
        message: &str,
        clear_history: bool,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(AgentError::EmptyMessage);
        }

        let key = user_id.to_string();
        let _turn = tokio::select! {
            guard = self.turns.lock(&key) => guard,
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
        };
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        if clear_history && self.sessions.clear(user_id).await {
            tracing::info!(user_id, "Conversation history cleared for new turn");
        }

        let history = self.sessions.history(user_id).await;
        tracing::info!(user_id, history_len = history.len(), "Starting agent turn");

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::new(Role::System, self.settings.system_prompt.as_str()));
        messages.extend(history.iter().map(|m| {
            let role = match m.role {
                MessageRole::User => Role::User,
                MessageRole::Assistant => Role::Assistant,
            };
            ChatMessage::new(role, m.content.as_str())
        }));
        messages.push(ChatMessage::new(Role::User, message));

        let ctx = ExecutionContext::with_cancel(user_id, cancel.clone());
        let tool_definitions = self.tools.definitions();
        let mut usage: Option<TokenUsage> = None;
        let mut tool_call_count = 0;

        for iteration in 0..self.settings.max_iterations {
            let options = ChatOptions {
                temperature: Some(self.settings.temperature),
                top_p: None,
                max_tokens: Some(self.settings.max_tokens),
            };
            let request = self.llm.chat_completion_with_options(
                &self.settings.model,
                &messages,
                Some(&tool_definitions),
                options,
            );
            let response = tokio::select! {
                response = request => response.map_err(|e| {
                    tracing::error!(user_id, iteration, "Model request failed: {:#}", e);
                    AgentError::Llm(e)
                })?,
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            };

            if let Some(call_usage) = &response.usage {
                usage.get_or_insert_with(TokenUsage::default).add(call_usage);
            }

            let calls = match response.tool_calls {
                Some(calls) if !calls.is_empty() => calls,
                _ => {
                    let reply = response.content.unwrap_or_default();
                    let conversation_length = self
                        .sessions
                        .append(user_id, vec![Message::user(message), Message::assistant(reply.as_str())])
                        .await;
                    tracing::info!(
                        user_id,
                        iterations = iteration + 1,
                        tool_call_count,
                        conversation_length,
                        "Agent turn complete"
                    );
                    return Ok(TurnOutcome {
                        reply,
                        tool_call_count,
                        conversation_length,
                        usage,
                    });
                }
            };

            tracing::debug!(user_id, iteration, calls = calls.len(), "Model requested tools");
            messages.push(ChatMessage::assistant_tool_calls(response.content, calls.clone()));
            for call in &calls {
                tool_call_count += 1;
                let result = self
                    .tools
                    .execute_call(&ctx, &call.function.name, &call.function.arguments)
                    .await;
                if cancel.is_cancelled() {
                    return Err(AgentError::Cancelled);
                }
                messages.push(ChatMessage::tool_result(call.id.as_str(), result.to_content()));
            }
        }

        tracing::warn!(user_id, max_iterations = self.settings.max_iterations, "Agent turn hit iteration limit");
        Err(AgentError::MaxIterations(self.settings.max_iterations))
    }

    /// Drop a user's history, waiting for any in-flight turn first.
    pub async fn clear_history(&self, user_id: &str) -> bool {
        let _turn = self.turns.lock(&user_id.to_string()).await;
        self.sessions.clear(user_id).await
    }

    pub async fn history(&self, user_id: &str) -> Vec<Message> {
        self.sessions.history(user_id).await
    }

    pub async fn active_conversations(&self) -> usize {
        self.sessions.session_count().await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::future::join_all;
    use serde_json::json;

    use super::*;
    use crate::approval::DisabledApprovalGate;
    use crate::llm::{ChatResponse, ToolCall, ToolDefinition};
    use crate::sandbox::ProcessSandbox;
    use crate::session::InMemorySessionStore;
    use crate::tools::ToolSettings;
    use crate::workspace::WorkspaceResolver;

    /// Returns queued responses in order, recording every request.
    #[derive(Default)]
    struct ScriptedLlm {
        responses: Mutex<VecDeque<anyhow::Result<ChatResponse>>>,
        requests: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<anyhow::Result<ChatResponse>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::default(),
            })
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn chat_completion(
            &self,
            _model: &str,
            messages: &[ChatMessage],
            _tools: Option<&[ToolDefinition]>,
        ) -> anyhow::Result<ChatResponse> {
            self.requests.lock().unwrap().push(messages.to_vec());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(text("(script exhausted)")))
        }
    }

    /// Replies "re: <last user message>" after a short delay.
    struct EchoLlm {
        delay: Duration,
    }

    #[async_trait]
    impl LlmClient for EchoLlm {
        async fn chat_completion(
            &self,
            _model: &str,
            messages: &[ChatMessage],
            _tools: Option<&[ToolDefinition]>,
        ) -> anyhow::Result<ChatResponse> {
            tokio::time::sleep(self.delay).await;
            let last = messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .and_then(|m| m.content.as_deref())
                .unwrap_or_default();
            Ok(text(&format!("re: {}", last)))
        }
    }

    fn text(content: &str) -> ChatResponse {
        ChatResponse {
            content: Some(content.to_string()),
            usage: Some(TokenUsage::new(10, 5)),
            ..ChatResponse::default()
        }
    }

    fn tool_call(id: &str, name: &str, args: serde_json::Value) -> ChatResponse {
        ChatResponse {
            tool_calls: Some(vec![ToolCall::function(id, name, args.to_string())]),
            usage: Some(TokenUsage::new(20, 3)),
            ..ChatResponse::default()
        }
    }

    async fn agent_with(llm: Arc<dyn LlmClient>, settings: AgentSettings) -> (AgentLoop, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let workspaces = Arc::new(WorkspaceResolver::new(dir.path()).await.unwrap());
        let tools = Arc::new(ToolRegistry::new(
            workspaces,
            ProcessSandbox::default(),
            Arc::new(DisabledApprovalGate),
            ToolSettings::default(),
        ));
        let sessions: SharedSessionStore = Arc::new(InMemorySessionStore::new());
        (AgentLoop::new(llm, tools, sessions, settings), dir)
    }

    #[tokio::test]
    async fn test_tool_call_then_answer() {
        let llm = ScriptedLlm::new(vec![
            Ok(tool_call(
                "call_1",
                "write_file",
                json!({ "relativePath": "hello.js", "content": "console.log('hi')" }),
            )),
            Ok(text("Created hello.js")),
        ]);
        let (agent, dir) = agent_with(llm.clone(), AgentSettings::default()).await;

        let outcome = agent
            .run_turn("alice", "make a hello script", false, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.reply, "Created hello.js");
        assert_eq!(outcome.tool_call_count, 1);
        assert_eq!(outcome.conversation_length, 2);
        assert_eq!(outcome.usage, Some(TokenUsage::new(30, 8)));
        assert!(dir.path().join("alice/hello.js").exists());

        let requests = llm.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0][0].role, Role::System);
        let tool_message = requests[1].last().unwrap();
        assert_eq!(tool_message.role, Role::Tool);
        assert_eq!(tool_message.tool_call_id.as_deref(), Some("call_1"));
        let result: serde_json::Value = serde_json::from_str(tool_message.content.as_deref().unwrap()).unwrap();
        assert_eq!(result["success"], true);
    }

    #[tokio::test]
    async fn test_history_is_sent_and_clear_resets() {
        let llm = Arc::new(EchoLlm {
            delay: Duration::from_millis(1),
        });
        let (agent, _dir) = agent_with(llm, AgentSettings::default()).await;
        let cancel = CancellationToken::new();

        agent.run_turn("alice", "one", false, cancel.clone()).await.unwrap();
        let second = agent.run_turn("alice", "two", false, cancel.clone()).await.unwrap();
        assert_eq!(second.conversation_length, 4);

        let cleared = agent.run_turn("alice", "fresh", true, cancel.clone()).await.unwrap();
        assert_eq!(cleared.conversation_length, 2);
        let history = agent.history("alice").await;
        assert_eq!(history, vec![Message::user("fresh"), Message::assistant("re: fresh")]);

        assert!(agent.clear_history("alice").await);
        assert!(agent.history("alice").await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_turns_apply_in_acceptance_order() {
        let llm = Arc::new(EchoLlm {
            delay: Duration::from_millis(10),
        });
        let (agent, _dir) = agent_with(llm, AgentSettings::default()).await;

        let messages: Vec<String> = (0..5).map(|i| format!("m{}", i)).collect();
        // join_all polls in order, so turns queue on the user lock in index order.
        let outcomes = join_all(
            messages
                .iter()
                .map(|m| agent.run_turn("alice", m, false, CancellationToken::new())),
        )
        .await;
        let lengths: Vec<usize> = outcomes.into_iter().map(|o| o.unwrap().conversation_length).collect();
        assert_eq!(lengths, vec![2, 4, 6, 8, 10]);

        let expected: Vec<Message> = messages
            .iter()
            .flat_map(|m| [Message::user(m.as_str()), Message::assistant(format!("re: {}", m))])
            .collect();
        assert_eq!(agent.history("alice").await, expected);
    }

    #[tokio::test]
    async fn test_users_do_not_wait_on_each_other() {
        let llm = Arc::new(EchoLlm {
            delay: Duration::from_millis(200),
        });
        let (agent, _dir) = agent_with(llm, AgentSettings::default()).await;

        let started = std::time::Instant::now();
        let (a, b) = tokio::join!(
            agent.run_turn("alice", "hi", false, CancellationToken::new()),
            agent.run_turn("bob", "hi", false, CancellationToken::new()),
        );
        tokio_test::assert_ok!(a);
        tokio_test::assert_ok!(b);
        assert!(started.elapsed() < Duration::from_millis(390));
        assert_eq!(agent.active_conversations().await, 2);
    }

    #[tokio::test]
    async fn test_failed_approval_does_not_abort_turn() {
        let llm = ScriptedLlm::new(vec![
            Ok(tool_call(
                "call_1",
                "request_approval",
                json!({ "title": "Deploy", "description": "ship the site" }),
            )),
            Ok(text("Approval could not be requested; not deploying.")),
        ]);
        let (agent, _dir) = agent_with(llm.clone(), AgentSettings::default()).await;

        let outcome = agent
            .run_turn("alice", "deploy it", false, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.conversation_length, 2);

        let requests = llm.requests.lock().unwrap();
        let result: serde_json::Value =
            serde_json::from_str(requests[1].last().unwrap().content.as_deref().unwrap()).unwrap();
        assert_eq!(result["success"], false);
        assert_eq!(result["errorKind"], "submission");
    }

    #[tokio::test]
    async fn test_failed_turn_appends_nothing() {
        let llm = ScriptedLlm::new(vec![Err(anyhow::anyhow!("upstream exploded"))]);
        let (agent, _dir) = agent_with(llm, AgentSettings::default()).await;

        let err = agent
            .run_turn("alice", "hello", false, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Llm(_)));
        assert!(err.to_string().contains("upstream exploded"));
        assert!(agent.history("alice").await.is_empty());
    }

    #[tokio::test]
    async fn test_iteration_limit() {
        let responses = (0..5)
            .map(|i| Ok(tool_call(&format!("call_{}", i), "list_files", json!({}))))
            .collect();
        let llm = ScriptedLlm::new(responses);
        let settings = AgentSettings {
            max_iterations: 3,
            ..AgentSettings::default()
        };
        let (agent, _dir) = agent_with(llm, settings).await;

        let err = agent
            .run_turn("alice", "loop forever", false, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::MaxIterations(3)));
        assert!(agent.history("alice").await.is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_stops_the_turn() {
        let llm = Arc::new(EchoLlm {
            delay: Duration::from_secs(30),
        });
        let (agent, _dir) = agent_with(llm, AgentSettings::default()).await;
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            }
        };
        let (result, _) = tokio::join!(agent.run_turn("alice", "slow", false, cancel), canceller);
        assert!(matches!(result, Err(AgentError::Cancelled)));
    }

    #[tokio::test]
    async fn test_empty_message_is_rejected() {
        let (agent, _dir) = agent_with(ScriptedLlm::new(vec![]), AgentSettings::default()).await;
        let err = agent
            .run_turn("alice", "   ", false, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::EmptyMessage));
    }
}
