//! Outbound human-approval requests.
//!
//! The gate forwards a structured request to an external approval service and
//! returns the service's request id. It never waits for the human decision and
//! keeps no state between calls.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Default timeout for a single submission.
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(15);

/// A request for human sign-off.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    pub title: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_snippet: Option<String>,
    pub metadata: Map<String, Value>,
}

impl ApprovalRequest {
    /// Build a request on behalf of a user, stamping `userId` and `timestamp`
    /// into the metadata (overriding any caller-supplied values).
    pub fn for_user(
        user_id: &str,
        title: impl Into<String>,
        description: impl Into<String>,
        code_snippet: Option<String>,
        metadata: Option<Map<String, Value>>,
    ) -> Self {
        let mut metadata = metadata.unwrap_or_default();
        metadata.insert("userId".to_string(), Value::String(user_id.to_string()));
        metadata.insert(
            "timestamp".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
        Self {
            title: title.into(),
            description: description.into(),
            code_snippet,
            metadata,
        }
    }
}

/// Identifier returned by the approval service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalReceipt {
    pub request_id: String,
}

#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("Approval service unreachable: {0}")]
    Network(String),

    #[error("Approval service did not answer within {} ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Approval service rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Approval service returned an unusable response: {0}")]
    MalformedResponse(String),

    #[error("Approval service is not configured")]
    NotConfigured,
}

/// Submits approval requests somewhere a human will see them.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn submit(&self, request: &ApprovalRequest) -> Result<ApprovalReceipt, SubmissionError>;

    /// Whether submissions can succeed at all.
    fn is_configured(&self) -> bool {
        true
    }
}

/// Approval gate backed by an HTTP endpoint authenticated with `x-api-key`.
pub struct HttpApprovalGate {
    client: Client,
    url: String,
    api_key: String,
    timeout: Duration,
}

impl HttpApprovalGate {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            api_key: api_key.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ApprovalGate for HttpApprovalGate {
    async fn submit(&self, request: &ApprovalRequest) -> Result<ApprovalReceipt, SubmissionError> {
        tracing::info!(title = %request.title, "Submitting approval request");

        let resp = self
            .client
            .post(&self.url)
            .header("x-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .timeout(self.timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SubmissionError::Timeout(self.timeout)
                } else {
                    SubmissionError::Network(e.to_string())
                }
            })?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| {
            if e.is_timeout() {
                SubmissionError::Timeout(self.timeout)
            } else {
                SubmissionError::Network(e.to_string())
            }
        })?;

        if !status.is_success() {
            let message = rejection_message(&text)
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown error").to_string());
            tracing::warn!(status = status.as_u16(), "Approval request rejected: {}", message);
            return Err(SubmissionError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let body: Value = serde_json::from_str(&text)
            .map_err(|e| SubmissionError::MalformedResponse(format!("{}: {}", e, truncate(&text))))?;
        let request_id = extract_request_id(&body).ok_or_else(|| {
            SubmissionError::MalformedResponse(format!("no id or request_id in {}", truncate(&text)))
        })?;

        tracing::info!(request_id = %request_id, "Approval request submitted");
        Ok(ApprovalReceipt { request_id })
    }
}

/// Gate used when no approval service is configured.
#[derive(Debug, Default)]
pub struct DisabledApprovalGate;

#[async_trait]
impl ApprovalGate for DisabledApprovalGate {
    async fn submit(&self, _request: &ApprovalRequest) -> Result<ApprovalReceipt, SubmissionError> {
        Err(SubmissionError::NotConfigured)
    }

    fn is_configured(&self) -> bool {
        false
    }
}

fn extract_request_id(body: &Value) -> Option<String> {
    ["id", "request_id"].iter().find_map(|key| match body.get(*key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn rejection_message(text: &str) -> Option<String> {
    if let Ok(body) = serde_json::from_str::<Value>(text) {
        if let Some(error) = body.get("error").and_then(|v| v.as_str()) {
            return Some(error.to_string());
        }
    }
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| truncate(trimmed))
}

fn truncate(text: &str) -> String {
    const MAX: usize = 500;
    if text.len() <= MAX {
        return text.to_string();
    }
    let mut end = MAX;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
