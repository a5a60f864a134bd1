pub mod openai;

use anyhow::Result;
use async_trait::async_trait;

use crate::core::messages::{ChatTurn, TokenUsage};

pub use openai::OpenAiClient;

/// Messages sent to a completion endpoint are plain conversation turns.
pub type ChatMessage = ChatTurn;

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub finish_reason: Option<String>,
    pub usage: TokenUsage,
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    fn model(&self) -> &str;

    // Run one chat completion over the full role-tagged message list
    async fn complete(&self, messages: &[ChatMessage]) -> Result<Completion>;
}
