//! Provider Clients (spec.md §4.B).
//!
//! Every client kind exposes the identical contract:
//! `chat(messages, temperature, max_output_tokens) -> ChatMessage`, over the
//! uniform error set in `crate::errors::ProviderError`. Implementations
//! differ only in payload shape; the abstraction never leaks.

mod anthropic_like;
mod google_like;
mod huggingface_like;
mod ollama_like;
mod openai_like;
mod openrouter_like;
mod retry;

pub use anthropic_like::AnthropicLikeClient;
pub use google_like::GoogleLikeClient;
pub use huggingface_like::HuggingFaceLikeClient;
pub use ollama_like::OllamaLikeClient;
pub use openai_like::OpenAiCompatibleClient;
pub use openrouter_like::OpenRouterLikeClient;
pub use retry::{retry_with_backoff, RetryPolicy};

use crate::errors::ProviderError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// `spec.md` §3 `ChatMessage`. Immutable in flight.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Validate and drop malformed messages before sending (spec.md §4.B
/// "Validation"). Returns an error only when the *whole* request is invalid
/// (empty list); individual malformed messages are dropped with a warning.
pub fn sanitize_messages(messages: &[ChatMessage]) -> Result<Vec<ChatMessage>, ProviderError> {
    if messages.is_empty() {
        return Err(ProviderError::ProtocolError(
            "messages must not be empty".to_string(),
        ));
    }
    let cleaned: Vec<ChatMessage> = messages
        .iter()
        .filter(|m| {
            let ok = !m.content.trim().is_empty();
            if !ok {
                tracing::warn!("dropping malformed chat message with empty content");
            }
            ok
        })
        .cloned()
        .collect();
    if cleaned.is_empty() {
        return Err(ProviderError::ProtocolError(
            "all messages were malformed (empty content)".to_string(),
        ));
    }
    Ok(cleaned)
}

/// Uniform capability every client kind implements (spec.md §4.B).
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_output_tokens: Option<u32>,
    ) -> Result<ChatMessage, ProviderError>;
}

/// Tagged dispatch over the five client kinds spec.md §4.B lists, plus the
/// teacher's existing Ollama client kept as a sixth, locally-hosted kind
/// (see DESIGN.md).
pub enum ProviderClient {
    OpenRouterLike(OpenRouterLikeClient),
    OpenAiLike(OpenAiCompatibleClient),
    AnthropicLike(AnthropicLikeClient),
    GoogleLike(GoogleLikeClient),
    HuggingFaceLike(HuggingFaceLikeClient),
    OllamaLike(OllamaLikeClient),
}

#[async_trait]
impl ChatClient for ProviderClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_output_tokens: Option<u32>,
    ) -> Result<ChatMessage, ProviderError> {
        match self {
            ProviderClient::OpenRouterLike(c) => c.chat(messages, temperature, max_output_tokens).await,
            ProviderClient::OpenAiLike(c) => c.chat(messages, temperature, max_output_tokens).await,
            ProviderClient::AnthropicLike(c) => c.chat(messages, temperature, max_output_tokens).await,
            ProviderClient::GoogleLike(c) => c.chat(messages, temperature, max_output_tokens).await,
            ProviderClient::HuggingFaceLike(c) => c.chat(messages, temperature, max_output_tokens).await,
            ProviderClient::OllamaLike(c) => c.chat(messages, temperature, max_output_tokens).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_message_list() {
        let err = sanitize_messages(&[]).unwrap_err();
        assert!(matches!(err, ProviderError::ProtocolError(_)));
    }

    #[test]
    fn drops_blank_messages_but_keeps_good_ones() {
        let msgs = vec![
            ChatMessage::user("  "),
            ChatMessage::user("hello"),
        ];
        let cleaned = sanitize_messages(&msgs).unwrap();
        assert_eq!(cleaned.len(), 1);
        assert_eq!(cleaned[0].content, "hello");
    }
}
