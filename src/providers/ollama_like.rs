//! Ollama-like client — a sixth, locally-hosted provider kind kept from the
//! teacher crate (see DESIGN.md). Not one of spec.md §4.B's five kinds, but
//! nothing in the spec forbids an additional local provider and the teacher
//! already implements one; deleting working code with no Non-goal excluding
//! it would be trimming without grounding.

use super::{ChatClient, ChatMessage, Role};
use crate::errors::ProviderError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

pub struct OllamaLikeClient {
    http: Client,
    base_url: String,
    model: String,
}

impl OllamaLikeClient {
    pub fn new(base_url: Option<&str>, model: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url
                .unwrap_or("http://127.0.0.1:11434")
                .trim_end_matches('/')
                .to_string(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl ChatClient for OllamaLikeClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        _temperature: f32,
        _max_output_tokens: Option<u32>,
    ) -> Result<ChatMessage, ProviderError> {
        let cleaned = super::sanitize_messages(messages)?;
        let url = format!("{}/api/chat", self.base_url);
        let req = OllamaChatRequest {
            model: self.model.clone(),
            messages: cleaned
                .iter()
                .map(|m| OllamaMessage {
                    role: match m.role {
                        Role::System => "system",
                        Role::User => "user",
                        Role::Assistant => "assistant",
                    },
                    content: m.content.clone(),
                })
                .collect(),
            stream: false,
        };

        let resp = self
            .http
            .post(url)
            .json(&req)
            .send()
            .await
            .map_err(|e| ProviderError::TransientFailure(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(super::openai_like::map_http_error(status, &text));
        }

        let payload: OllamaChatResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::ProtocolError(format!("malformed response body: {e}")))?;
        Ok(ChatMessage::assistant(payload.message.content))
    }
}

#[derive(Debug, Clone, Serialize)]
struct OllamaMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaChatResponseMessage,
}
