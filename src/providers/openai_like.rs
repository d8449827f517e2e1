//! OpenAI-compatible client (spec.md §4.B).
//!
//! Grounded on the teacher's `src/openai.rs` transport style (request/
//! response wire shapes), adapted to the uniform `chat()` contract: maps
//! rate/auth SDK errors to the uniform error set; honors an optional
//! `api_base` override.

use super::{ChatClient, ChatMessage, Role};
use crate::errors::ProviderError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

#[derive(Clone)]
pub struct OpenAiCompatibleClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiCompatibleClient {
    pub fn new(base_url: Option<&str>, api_key: Option<String>, model: impl Into<String>) -> Self {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http,
            base_url: base_url
                .unwrap_or("https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model: model.into(),
        }
    }

    pub(crate) async fn post_chat(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_output_tokens: Option<u32>,
        extra_headers: &[(&str, &str)],
    ) -> Result<ChatMessage, ProviderError> {
        let cleaned = super::sanitize_messages(messages)?;
        let url = format!("{}/chat/completions", self.base_url);
        let req = OaiRequest {
            model: self.model.clone(),
            messages: cleaned.iter().map(OaiMessage::from_chat).collect(),
            temperature,
            max_tokens: max_output_tokens,
        };

        let mut rb = self.http.post(url).json(&req);
        if let Some(key) = &self.api_key {
            rb = rb.header("Authorization", format!("Bearer {}", key));
        }
        for (name, value) in extra_headers {
            rb = rb.header(*name, *value);
        }

        let resp = rb
            .send()
            .await
            .map_err(|e| ProviderError::TransientFailure(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(map_http_error(status, &text));
        }

        let payload: OaiChatResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::ProtocolError(format!("malformed response body: {e}")))?;
        let content = payload
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ProviderError::ProtocolError("no choices in response".to_string()))?;
        Ok(ChatMessage::assistant(content))
    }
}

/// Shared across OpenAI-compatible and Anthropic-like transports (spec.md
/// §4.B: Anthropic-like "reuses OpenAI-compatible transport").
pub(crate) fn map_http_error(status: StatusCode, body: &str) -> ProviderError {
    match status.as_u16() {
        401 | 403 => ProviderError::AuthFailed(format!("{status}: {body}")),
        429 => ProviderError::RateLimited(format!("{status}: {body}")),
        408 => ProviderError::TransientFailure(format!("{status}: {body}")),
        s if s >= 500 => ProviderError::TransientFailure(format!("{status}: {body}")),
        _ => ProviderError::ProtocolError(format!("{status}: {body}")),
    }
}

#[async_trait]
impl ChatClient for OpenAiCompatibleClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_output_tokens: Option<u32>,
    ) -> Result<ChatMessage, ProviderError> {
        self.post_chat(messages, temperature, max_output_tokens, &[])
            .await
    }
}

#[derive(Debug, Serialize)]
struct OaiMessage {
    role: &'static str,
    content: String,
}

impl OaiMessage {
    fn from_chat(msg: &ChatMessage) -> Self {
        let role = match msg.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        Self {
            role,
            content: msg.content.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct OaiRequest {
    model: String,
    messages: Vec<OaiMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OaiChatResponse {
    choices: Vec<OaiChoice>,
}

#[derive(Debug, Deserialize)]
struct OaiChoice {
    message: OaiChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct OaiChoiceMessage {
    content: String,
}
