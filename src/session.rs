//! Per-user conversation history.
//!
//! A session is an ordered, append-only list of user/assistant messages keyed
//! by user id. It can be cleared, which returns the user to "no session".
//! Storage is behind the [`SessionStore`] trait so the agent loop does not
//! care whether history lives in memory or somewhere durable.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Author of a stored message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// One stored conversation message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Storage for conversation sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Snapshot of a user's messages (empty when there is no session).
    async fn history(&self, user_id: &str) -> Vec<Message>;

    /// Append messages atomically and return the new session length.
    async fn append(&self, user_id: &str, messages: Vec<Message>) -> usize;

    /// Drop a user's session. Returns whether one existed.
    async fn clear(&self, user_id: &str) -> bool;

    /// Number of users with a session.
    async fn session_count(&self) -> usize;
}

/// Shared session store handle.
pub type SharedSessionStore = Arc<dyn SessionStore>;

/// Process-lifetime session store.
///
/// Each user's log has its own lock; the outer map lock is only held to find,
/// create or remove a log.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Arc<RwLock<Vec<Message>>>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn get(&self, user_id: &str) -> Option<Arc<RwLock<Vec<Message>>>> {
        self.sessions.read().await.get(user_id).cloned()
    }

    async fn get_or_create(&self, user_id: &str) -> Arc<RwLock<Vec<Message>>> {
        if let Some(log) = self.get(user_id).await {
            return log;
        }
        let mut sessions = self.sessions.write().await;
        Arc::clone(sessions.entry(user_id.to_string()).or_default())
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn history(&self, user_id: &str) -> Vec<Message> {
        match self.get(user_id).await {
            Some(log) => log.read().await.clone(),
            None => Vec::new(),
        }
    }

    async fn append(&self, user_id: &str, messages: Vec<Message>) -> usize {
        let log = self.get_or_create(user_id).await;
        let mut log = log.write().await;
        log.extend(messages);
        log.len()
    }

    async fn clear(&self, user_id: &str) -> bool {
        let removed = self.sessions.write().await.remove(user_id).is_some();
        if removed {
            tracing::debug!(user_id, "Cleared conversation history");
        }
        removed
    }

    async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_and_history_keep_order() {
        let store = InMemorySessionStore::new();
        assert!(store.history("alice").await.is_empty());

        let len = store
            .append("alice", vec![Message::user("hi"), Message::assistant("hello")])
            .await;
        assert_eq!(len, 2);
        store
            .append("alice", vec![Message::user("again"), Message::assistant("sure")])
            .await;

        let contents: Vec<_> = store
            .history("alice")
            .await
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["hi", "hello", "again", "sure"]);
        assert_eq!(store.history("alice").await.len(), 4);
        assert_eq!(store.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_clear_returns_to_no_session() {
        let store = InMemorySessionStore::new();
        store.append("alice", vec![Message::user("hi")]).await;
        store.append("bob", vec![Message::user("yo")]).await;

        assert!(store.clear("alice").await);
        assert!(!store.clear("alice").await);
        assert_eq!(store.history("alice").await.len(), 0);
        assert_eq!(store.history("bob").await.len(), 1);
        assert_eq!(store.session_count().await, 1);
    }

    #[test]
    fn test_message_serializes_lowercase_role() {
        let json = serde_json::to_value(Message::assistant("ok")).unwrap();
        assert_eq!(json, serde_json::json!({ "role": "assistant", "content": "ok" }));
    }
}
