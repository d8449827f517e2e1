//! Anthropic-like client (spec.md §4.B).
//!
//! Reuses the OpenAI-compatible transport pointed at a distinct `base_url`
//! with a required protocol-version header; `max_output_tokens` is
//! mandatory for this kind (spec.md §4.B).

use super::{ChatClient, ChatMessage, OpenAiCompatibleClient};
use crate::errors::ProviderError;
use async_trait::async_trait;

const PROTOCOL_VERSION_HEADER: &str = "anthropic-version";
const PROTOCOL_VERSION: &str = "2023-06-01";

pub struct AnthropicLikeClient {
    inner: OpenAiCompatibleClient,
}

impl AnthropicLikeClient {
    pub fn new(base_url: Option<&str>, api_key: Option<String>, model: impl Into<String>) -> Self {
        Self {
            inner: OpenAiCompatibleClient::new(
                base_url.or(Some("https://api.anthropic.com/v1")),
                api_key,
                model,
            ),
        }
    }
}

#[async_trait]
impl ChatClient for AnthropicLikeClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_output_tokens: Option<u32>,
    ) -> Result<ChatMessage, ProviderError> {
        let Some(max_tokens) = max_output_tokens else {
            return Err(ProviderError::ProtocolError(
                "anthropic-like client requires max_output_tokens".to_string(),
            ));
        };
        self.inner
            .post_chat(
                messages,
                temperature,
                Some(max_tokens),
                &[(PROTOCOL_VERSION_HEADER, PROTOCOL_VERSION)],
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn requires_max_output_tokens() {
        let client = AnthropicLikeClient::new(None, None, "claude-test");
        let err = client
            .chat(&[ChatMessage::user("hi")], 0.0, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::ProtocolError(_)));
    }
}
