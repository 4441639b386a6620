//! Chat completions against OpenRouter (or any OpenAI-compatible endpoint).
//!
//! Transient failures (429, 5xx, network) are retried with backoff until
//! either the attempt budget or the time budget of [`RetryConfig`] runs out.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{header::HeaderMap, Client};
use serde::{Deserialize, Serialize};

use super::error::{LlmError, RetryConfig};
use super::{
    ChatMessage, ChatOptions, ChatResponse, LlmClient, TokenUsage, ToolCall, ToolDefinition,
};

pub const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

pub struct OpenRouterClient {
    client: Client,
    api_key: String,
    endpoint: String,
    retry: RetryConfig,
}

impl OpenRouterClient {
    pub fn new(api_key: String) -> Self {
        Self::with_retry_config(api_key, RetryConfig::default())
    }

    pub fn with_retry_config(api_key: String, retry: RetryConfig) -> Self {
        Self {
            client: Client::new(),
            api_key,
            endpoint: OPENROUTER_API_URL.to_string(),
            retry,
        }
    }

    /// Send requests to another chat completions URL.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// One attempt, no retry.
    async fn send(&self, body: &CompletionRequest<'_>) -> Result<ChatResponse, LlmError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header("X-Title", "Vibez Agent")
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let retry_after = retry_after(response.headers());
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(LlmError::from_status(status.as_u16(), text, retry_after));
        }

        let parsed: CompletionResponse = serde_json::from_str(&text).map_err(|e| {
            LlmError::parse_error(format!("Failed to parse response: {}, body: {}", e, text))
        })?;
        parsed.into_chat_response()
    }

    async fn send_with_retry(&self, body: &CompletionRequest<'_>) -> Result<ChatResponse, LlmError> {
        let started = Instant::now();
        let deadline = started + self.retry.max_retry_duration;
        let mut attempt: u32 = 0;

        loop {
            let error = match self.send(body).await {
                Ok(response) => {
                    if attempt > 0 {
                        tracing::info!(
                            retries = attempt,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "Model request succeeded after retry"
                        );
                    }
                    return Ok(response);
                }
                Err(error) => error,
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            let delay = error.suggested_delay(attempt).min(remaining);
            let give_up = !self.retry.should_retry(&error)
                || attempt >= self.retry.max_retries
                || delay.is_zero();
            if give_up {
                tracing::error!(retries = attempt, kind = %error.kind, "Model request failed: {}", error);
                return Err(error);
            }

            tracing::warn!(
                attempt = attempt + 1,
                kind = %error.kind,
                delay_ms = delay.as_millis() as u64,
                "Model request failed, retrying: {}",
                error.message
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// `Retry-After` in whole seconds; the HTTP-date form is ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl LlmClient for OpenRouterClient {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
    ) -> anyhow::Result<ChatResponse> {
        self.chat_completion_with_options(model, messages, tools, ChatOptions::default())
            .await
    }

    async fn chat_completion_with_options(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        options: ChatOptions,
    ) -> anyhow::Result<ChatResponse> {
        let body = CompletionRequest {
            model,
            messages,
            tool_choice: tools.map(|_| "auto"),
            tools,
            temperature: options.temperature,
            top_p: options.top_p,
            max_tokens: options.max_tokens,
        };
        tracing::debug!(model, messages = messages.len(), "Sending chat completion");
        Ok(self.send_with_retry(&body).await?)
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolDefinition]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

impl CompletionResponse {
    fn into_chat_response(self) -> Result<ChatResponse, LlmError> {
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::parse_error("No choices in response".to_string()))?;
        Ok(ChatResponse {
            content: choice.message.content,
            tool_calls: choice.message.tool_calls,
            usage: self
                .usage
                .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens)),
        })
    }
}
