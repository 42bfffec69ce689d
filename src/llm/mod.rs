//! Model-stream collaborators.
//!
//! A [`ModelClient`] turns the conversation into a stream of text
//! increments for one response. [`ScriptedModel`] replays canned responses;
//! [`OpenAiClient`] talks to an OpenAI-compatible `/chat/completions`
//! endpoint.

pub mod openai;
pub mod scripted;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub use openai::OpenAiClient;
pub use scripted::{Reply, ScriptedModel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Successive text increments of one model response
pub type TextStream = BoxStream<'static, Result<String>>;

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Model name, for logs
    fn name(&self) -> &str;

    /// Start one response for `messages`
    async fn stream(&self, messages: &[ChatMessage]) -> Result<TextStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serialization() {
        let msg = ChatMessage::assistant("hi");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["content"], "hi");
        assert_eq!(Role::User.to_string(), "user");
    }
}
