//! Queue message schemas exchanged between the gateway and the workers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One role-tagged turn of a conversation, as sent to the completion API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    pub name: String,
    pub email: String,
}

/// Unit of work published by the gateway and consumed by exactly one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub request_id: Uuid,
    pub session_id: Uuid,
    pub prompt: String,
    #[serde(default)]
    pub conversation_history: Vec<ChatTurn>,
    pub user: UserInfo,
}

impl WorkItem {
    /// Conversation history followed by the prompt as the final user turn.
    pub fn model_input(&self) -> Vec<ChatTurn> {
        let mut messages = self.conversation_history.clone();
        messages.push(ChatTurn::user(self.prompt.clone()));
        messages
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Completion result tagged with the request id of the originating [`WorkItem`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultItem {
    pub request_id: Uuid,
    pub session_id: Uuid,
    pub prompt: String,
    pub response: String,
    #[serde(default)]
    pub usage: TokenUsage,
    pub processing_time: f64,
    pub timestamp: f64,
}

/// Current wall-clock time as fractional seconds since the Unix epoch.
pub fn epoch_seconds() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp_micros() as f64 / 1_000_000.0
}
