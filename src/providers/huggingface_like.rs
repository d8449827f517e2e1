//! HuggingFace-like client (spec.md §4.B).
//!
//! Formats history as `Role: content\n…\nAssistant:`; parameters include
//! `return_full_text=false` and `wait_for_model=true`; an HTTP 200 whose
//! body indicates the model is still loading is treated as a transient,
//! retryable state.

use super::retry::{retry_with_backoff, RetryPolicy};
use super::{ChatClient, ChatMessage, Role};
use crate::errors::ProviderError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

pub struct HuggingFaceLikeClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    retry_policy: RetryPolicy,
}

impl HuggingFaceLikeClient {
    pub fn new(base_url: Option<&str>, api_key: Option<String>, model: impl Into<String>) -> Self {
        Self {
            http: Client::builder()
                .timeout(std::time::Duration::from_secs(300))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: base_url
                .unwrap_or("https://api-inference.huggingface.co/models")
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model: model.into(),
            retry_policy: RetryPolicy::default(),
        }
    }

    /// `"Role: content\n…\nAssistant:"` prompt formatting (spec.md §4.B).
    pub(crate) fn format_prompt(messages: &[ChatMessage]) -> String {
        let mut out = String::new();
        for m in messages {
            let role = match m.role {
                Role::System => "System",
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            out.push_str(role);
            out.push_str(": ");
            out.push_str(&m.content);
            out.push('\n');
        }
        out.push_str("Assistant:");
        out
    }

    async fn send_once(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_output_tokens: Option<u32>,
    ) -> Result<ChatMessage, ProviderError> {
        let cleaned = super::sanitize_messages(messages)?;
        let prompt = Self::format_prompt(&cleaned);

        let url = format!("{}/{}", self.base_url, self.model);
        let req = HfRequest {
            inputs: prompt,
            parameters: HfParameters {
                temperature,
                max_new_tokens: max_output_tokens,
                return_full_text: false,
            },
            options: HfOptions {
                wait_for_model: true,
            },
        };

        let mut rb = self.http.post(url).json(&req);
        if let Some(key) = &self.api_key {
            rb = rb.header("Authorization", format!("Bearer {}", key));
        }
        let resp = rb
            .send()
            .await
            .map_err(|e| ProviderError::TransientFailure(e.to_string()))?;
        let status = resp.status();
        let raw = resp
            .text()
            .await
            .map_err(|e| ProviderError::TransientFailure(e.to_string()))?;

        if !status.is_success() {
            return Err(super::openai_like::map_http_error(status, &raw));
        }

        if is_model_loading_body(&raw) {
            return Err(ProviderError::TransientFailure(format!(
                "model loading: {raw}"
            )));
        }

        let payload: Vec<HfGeneratedText> = serde_json::from_str(&raw)
            .map_err(|_| ProviderError::ProtocolError(format!("malformed response body: {raw}")))?;
        let text = payload
            .into_iter()
            .next()
            .map(|g| g.generated_text)
            .ok_or_else(|| ProviderError::ProtocolError("empty response array".to_string()))?;
        Ok(ChatMessage::assistant(text))
    }
}

/// An HTTP 200 with `{"error": "...is currently loading..."}` is an
/// indistinguishable-from-503 transient state (spec.md §4.B).
fn is_model_loading_body(body: &str) -> bool {
    #[derive(Deserialize)]
    struct HfErrorBody {
        error: Option<String>,
    }
    match serde_json::from_str::<HfErrorBody>(body) {
        Ok(b) => b
            .error
            .map(|e| e.to_lowercase().contains("currently loading"))
            .unwrap_or(false),
        Err(_) => false,
    }
}

#[async_trait]
impl ChatClient for HuggingFaceLikeClient {
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
struct HfParameters {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_new_tokens: Option<u32>,
    return_full_text: bool,
}

#[derive(Debug, Serialize)]
struct HfOptions {
    wait_for_model: bool,
}

#[derive(Debug, Serialize)]
struct HfRequest {
    inputs: String,
    parameters: HfParameters,
    options: HfOptions,
}

#[derive(Debug, Deserialize)]
struct HfGeneratedText {
    generated_text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_role_prefixed_prompt() {
        let messages = vec![
            ChatMessage::system("be terse"),
            ChatMessage::user("hi"),
        ];
        let prompt = HuggingFaceLikeClient::format_prompt(&messages);
        assert_eq!(prompt, "System: be terse\nUser: hi\nAssistant:");
    }

    #[test]
    fn detects_model_loading_body() {
        assert!(is_model_loading_body(
            r#"{"error": "Model xyz is currently loading"}"#
        ));
        assert!(!is_model_loading_body(r#"{"error": "bad request"}"#));
        assert!(!is_model_loading_body(r#"[{"generated_text": "hi"}]"#));
    }
}
