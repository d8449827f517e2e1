//! OpenRouter-like client (spec.md §4.B).
//!
//! HTTP POST to a single endpoint; includes optional `HTTP-Referer` and
//! `X-Title`; implements its own retry loop (spec.md §4.B "Retry
//! discipline").

use super::retry::{retry_with_backoff, RetryPolicy};
use super::{ChatClient, ChatMessage, Role};
use crate::errors::ProviderError;
use crate::providers::openai_like::map_http_error;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

pub struct OpenRouterLikeClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    http_referer: Option<String>,
    x_title: Option<String>,
    retry_policy: RetryPolicy,
}

impl OpenRouterLikeClient {
    pub fn new(base_url: Option<&str>, api_key: Option<String>, model: impl Into<String>) -> Self {
        Self {
            http: Client::builder()
                .timeout(std::time::Duration::from_secs(300))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: base_url
                .unwrap_or("https://openrouter.ai/api/v1")
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model: model.into(),
            http_referer: None,
            x_title: None,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        self.http_referer = Some(referer.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.x_title = Some(title.into());
        self
    }

    async fn send_once(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_output_tokens: Option<u32>,
    ) -> Result<ChatMessage, ProviderError> {
        let cleaned = super::sanitize_messages(messages)?;
        let url = format!("{}/chat/completions", self.base_url);
        let req = OrRequest {
            model: self.model.clone(),
            messages: cleaned
                .iter()
                .map(|m| OrMessage {
                    role: match m.role {
                        Role::System => "system",
                        Role::User => "user",
                        Role::Assistant => "assistant",
                    },
                    content: m.content.clone(),
                })
                .collect(),
            temperature,
            max_tokens: max_output_tokens,
        };

        let mut rb = self.http.post(url).json(&req);
        if let Some(key) = &self.api_key {
            rb = rb.header("Authorization", format!("Bearer {}", key));
        }
        if let Some(referer) = &self.http_referer {
            rb = rb.header("HTTP-Referer", referer);
        }
        if let Some(title) = &self.x_title {
            rb = rb.header("X-Title", title);
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

        let raw = resp
            .text()
            .await
            .map_err(|e| ProviderError::TransientFailure(e.to_string()))?;
        let payload: OrChatResponse = serde_json::from_str(&raw)
            .map_err(|_| ProviderError::TransientFailure(format!("malformed 200 body: {raw}")))?;
        let content = payload
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ProviderError::ProtocolError("no choices in response".to_string()))?;
        Ok(ChatMessage::assistant(content))
    }
}

#[async_trait]
impl ChatClient for OpenRouterLikeClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_output_tokens: Option<u32>,
    ) -> Result<ChatMessage, ProviderError> {
        retry_with_backoff(self.retry_policy, |_attempt| {
            self.send_once(messages, temperature, max_output_tokens)
        })
        .await
    }
}

#[derive(Debug, Serialize)]
struct OrMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct OrRequest {
    model: String,
    messages: Vec<OrMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OrChatResponse {
    choices: Vec<OrChoice>,
}

#[derive(Debug, Deserialize)]
struct OrChoice {
    message: OrChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct OrChoiceMessage {
    content: String,
}
