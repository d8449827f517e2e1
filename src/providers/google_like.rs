//! Google-like client (spec.md §4.B).
//!
//! System prompts are split out and supplied out-of-band; a per-call model
//! instance is only conceptually created when a system prompt is present
//! (modeled here as a distinct request shape); a response with zero
//! candidates is `Blocked`.

use super::{ChatClient, ChatMessage, Role};
use crate::errors::ProviderError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

pub struct GoogleLikeClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl GoogleLikeClient {
    pub fn new(base_url: Option<&str>, api_key: Option<String>, model: impl Into<String>) -> Self {
        Self {
            http: Client::builder()
                .timeout(std::time::Duration::from_secs(300))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: base_url
                .unwrap_or("https://generativelanguage.googleapis.com/v1beta")
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model: model.into(),
        }
    }

    /// Split the system prompt out of `messages`, matching the original's
    /// out-of-band `system_instruction`.
    fn split_system(messages: &[ChatMessage]) -> (Option<String>, Vec<&ChatMessage>) {
        let mut system = None;
        let mut rest = Vec::with_capacity(messages.len());
        for m in messages {
            if m.role == Role::System && system.is_none() {
                system = Some(m.content.clone());
            } else {
                rest.push(m);
            }
        }
        (system, rest)
    }
}

#[async_trait]
impl ChatClient for GoogleLikeClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_output_tokens: Option<u32>,
    ) -> Result<ChatMessage, ProviderError> {
        let cleaned = super::sanitize_messages(messages)?;
        let (system_instruction, rest) = Self::split_system(&cleaned);

        let contents: Vec<GContent> = rest
            .iter()
            .map(|m| GContent {
                role: match m.role {
                    Role::Assistant => "model",
                    _ => "user",
                },
                parts: vec![GPart {
                    text: m.content.clone(),
                }],
            })
            .collect();

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url,
            self.model,
            self.api_key.as_deref().unwrap_or("")
        );

        let req = GRequest {
            contents,
            system_instruction: system_instruction.map(|text| GContent {
                role: "system",
                parts: vec![GPart { text }],
            }),
            generation_config: GGenerationConfig {
                temperature,
                max_output_tokens,
            },
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

        let payload: GResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::ProtocolError(format!("malformed response body: {e}")))?;

        if payload.candidates.is_empty() {
            let reason = payload
                .prompt_feedback
                .and_then(|f| f.block_reason)
                .unwrap_or_else(|| "no candidates returned".to_string());
            return Err(ProviderError::Blocked(reason));
        }

        let text = payload.candidates[0]
            .content
            .parts
            .first()
            .map(|p| p.text.clone())
            .unwrap_or_default();
        Ok(ChatMessage::assistant(text))
    }
}

#[derive(Debug, Serialize)]
struct GPart {
    text: String,
}

#[derive(Debug, Serialize)]
struct GContent {
    role: &'static str,
    parts: Vec<GPart>,
}

#[derive(Debug, Serialize)]
struct GGenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens", skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct GRequest {
    contents: Vec<GContent>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GGenerationConfig,
}

#[derive(Debug, Deserialize)]
struct GResponsePart {
    text: String,
}

#[derive(Debug, Deserialize)]
struct GResponseContent {
    parts: Vec<GResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GCandidate {
    content: GResponseContent,
}

#[derive(Debug, Deserialize, Default)]
struct GPromptFeedback {
    #[serde(rename = "blockReason")]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GResponse {
    #[serde(default)]
    candidates: Vec<GCandidate>,
    #[serde(rename = "promptFeedback", default)]
    prompt_feedback: Option<GPromptFeedback>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_system_prompt_out_of_band() {
        let messages = vec![
            ChatMessage::system("be nice"),
            ChatMessage::user("hi"),
        ];
        let (system, rest) = GoogleLikeClient::split_system(&messages);
        assert_eq!(system, Some("be nice".to_string()));
        assert_eq!(rest.len(), 1);
    }
}
