//! UI callback interface (spec.md §6).
//!
//! Modeled as a plain async trait rather than a channel of concrete UI
//! widgets, so an integrator supplies their own front end without this crate
//! depending on any particular toolkit. Mirrors the teacher's separation
//! between the headless engine and its own (excluded) desktop shell.

use async_trait::async_trait;

/// `{ phase, message, issue? }` progress event (spec.md §6 `UpdateProgress`).
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub phase: String,
    pub message: String,
    pub issue: Option<String>,
}

impl ProgressEvent {
    pub fn new(phase: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            phase: phase.into(),
            message: message.into(),
            issue: None,
        }
    }

    pub fn with_issue(mut self, issue: impl Into<String>) -> Self {
        self.issue = Some(issue.into());
        self
    }
}

/// The four dialogs an orchestration run may need from its host UI
/// (spec.md §6). The engine never blocks on the UI except when explicitly
/// awaiting one of these responses.
#[async_trait]
pub trait UiCallbacks: Send + Sync {
    /// `ShowInputPrompt(title, is_password, message) -> text | none`.
    async fn show_input_prompt(&self, title: &str, is_password: bool, message: &str) -> Option<String>;

    /// `RequestCredentialUpdate(agent_desc, error_message, key_name) -> (new_key?, retry_now)`.
    async fn request_credential_update(
        &self,
        agent_desc: &str,
        error_message: &str,
        key_name: &str,
    ) -> (Option<String>, bool);

    async fn update_progress(&self, event: ProgressEvent);

    /// `RequestNetworkRetry(error) -> bool`.
    async fn request_network_retry(&self, error: &str) -> bool;
}

/// A callback implementation that answers every dialog with the
/// conservative "stop and fail" choice. Useful for non-interactive
/// invocations (CI, `check-table`/`check-model` utility entry points) where
/// no human is present to answer a prompt.
pub struct NonInteractiveUi;

#[async_trait]
impl UiCallbacks for NonInteractiveUi {
    async fn show_input_prompt(&self, _title: &str, _is_password: bool, _message: &str) -> Option<String> {
        None
    }

    async fn request_credential_update(
        &self,
        _agent_desc: &str,
        _error_message: &str,
        _key_name: &str,
    ) -> (Option<String>, bool) {
        (None, false)
    }

    async fn update_progress(&self, event: ProgressEvent) {
        tracing::info!(phase = %event.phase, message = %event.message, issue = ?event.issue, "progress");
    }

    async fn request_network_retry(&self, _error: &str) -> bool {
        false
    }
}
