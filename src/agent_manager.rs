//! Agent Manager (spec.md §4.C).
//!
//! Owns exactly one active provider/model binding at a time, resolved on
//! demand from `ProviderConfig` + the `CredentialStore`, and paces every
//! outbound call against `min_call_interval_secs`. Grounded on the teacher's
//! `agent_manager/mod.rs` (the binding-resolution shape, one active client
//! held behind a lock) generalized down from the teacher's multi-project,
//! multi-agent scope to the single binding spec.md §4.C describes — see
//! DESIGN.md.

use crate::config::{ClientKind, Config, ProviderConfig};
use crate::credentials::{resolve_api_key, CredentialStore};
use crate::errors::ProviderError;
use crate::providers::{
    AnthropicLikeClient, ChatClient, ChatMessage, GoogleLikeClient, HuggingFaceLikeClient,
    OllamaLikeClient, OpenAiCompatibleClient, OpenRouterLikeClient,
};
use crate::ui::UiCallbacks;
use anyhow::{anyhow, bail, Context as _, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

struct AgentBinding {
    provider_id: String,
    key_identifier: String,
    model: String,
    client: Arc<dyn ChatClient>,
    /// Instant the most recent call was *started*, not completed — pacing is
    /// enforced before dispatch so a slow call never lets the next one start
    /// early (SPEC_FULL.md §4.C Open Question resolution, DESIGN.md).
    last_call_started: Option<Instant>,
}

/// Resolves and holds the single active provider/model binding, enforcing
/// call pacing and driving the credential-recovery dialog on auth failure.
pub struct AgentManager {
    config: Config,
    store: Mutex<Box<dyn CredentialStore>>,
    binding: Mutex<Option<AgentBinding>>,
}

impl AgentManager {
    pub fn new(config: Config, store: Box<dyn CredentialStore>) -> Self {
        Self {
            config,
            store: Mutex::new(store),
            binding: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Resolves `provider_id` against `Config::providers`, pulls its API key
    /// via the Credential Store / config / environment (spec.md §4.A), and
    /// builds the concrete client. Replaces any previously active binding.
    pub async fn reinitialize(&self, provider_id: &str, model: &str) -> Result<()> {
        let provider = self.find_provider(provider_id)?;
        let store = self.store.lock().await;
        let api_key = resolve_api_key(provider_id, None, store.as_ref(), &provider.key_identifier);
        drop(store);

        let client = build_client(provider, api_key, model)
            .with_context(|| format!("building client for provider '{provider_id}'"))?;

        let mut binding = self.binding.lock().await;
        *binding = Some(AgentBinding {
            provider_id: provider_id.to_string(),
            key_identifier: provider.key_identifier.clone(),
            model: model.to_string(),
            client,
            last_call_started: None,
        });
        Ok(())
    }

    fn find_provider(&self, provider_id: &str) -> Result<&ProviderConfig> {
        self.config
            .providers
            .iter()
            .find(|p| p.id == provider_id)
            .ok_or_else(|| anyhow!("unknown provider '{provider_id}'"))
    }

    /// Dispatches one `chat()` call against the active binding, enforcing
    /// the minimum inter-call interval first (spec.md §4.C `T_min`).
    pub async fn invoke(
        &self,
        system: ChatMessage,
        mut messages: Vec<ChatMessage>,
        temperature: f32,
    ) -> Result<ChatMessage> {
        let client = {
            let mut binding_guard = self.binding.lock().await;
            let binding = binding_guard
                .as_mut()
                .ok_or_else(|| anyhow!("no provider bound; call reinitialize() first"))?;
            self.wait_for_pacing(binding).await;
            binding.client.clone()
        };

        let mut full = Vec::with_capacity(messages.len() + 1);
        full.push(system);
        full.append(&mut messages);

        client
            .chat(&full, temperature, self.config.agent.default_max_output_tokens)
            .await
            .map_err(anyhow::Error::from)
    }

    async fn wait_for_pacing(&self, binding: &mut AgentBinding) {
        let min_interval = Duration::from_secs(self.config.agent.min_call_interval_secs);
        if let Some(last) = binding.last_call_started {
            let elapsed = last.elapsed();
            if elapsed < min_interval {
                tokio::time::sleep(min_interval - elapsed).await;
            }
        }
        binding.last_call_started = Some(Instant::now());
    }

    /// `invoke()` wrapped with the credential-recovery dialog described in
    /// spec.md §4.C: on `AuthFailed`, the stored key is deleted (unless the
    /// failure is the user-cancelled case — see `is_user_cancelled`) and the
    /// UI is asked for a replacement; the call is retried once if the user
    /// supplies one and asks to retry, otherwise the original error is
    /// returned.
    pub async fn invoke_with_recovery(
        &self,
        system: ChatMessage,
        messages: Vec<ChatMessage>,
        temperature: f32,
        ui: &dyn UiCallbacks,
    ) -> Result<ChatMessage> {
        match self.invoke(system.clone(), messages.clone(), temperature).await {
            Ok(reply) => Ok(reply),
            Err(err) => {
                if !is_auth_failure(&err) {
                    return Err(err);
                }
                let (provider_id, key_identifier, model) = {
                    let binding_guard = self.binding.lock().await;
                    let binding = binding_guard
                        .as_ref()
                        .ok_or_else(|| anyhow!("no provider bound"))?;
                    (
                        binding.provider_id.clone(),
                        binding.key_identifier.clone(),
                        binding.model.clone(),
                    )
                };

                let (new_key, retry_now) = ui
                    .request_credential_update(&provider_id, &err.to_string(), &key_identifier)
                    .await;
                // The stale key caused this failure, so it's deleted
                // regardless of how the dialog is answered — except when the
                // failure itself says the user never provided one (SPEC_FULL.md
                // §4.C); there's nothing stale to invalidate in that case. A
                // replacement is stored only when the dialog supplies one.
                {
                    let mut store = self.store.lock().await;
                    if !is_user_cancelled(&err) {
                        store.delete(&key_identifier);
                    }
                    if let Some(key) = &new_key {
                        store.put(&key_identifier, key)?;
                    }
                }

                if !retry_now {
                    bail!(err);
                }
                let Some(new_key) = new_key else {
                    bail!(err);
                };

                let provider = self.find_provider(&provider_id)?;
                let client = build_client(provider, Some(new_key), &model)
                    .with_context(|| format!("rebuilding client for provider '{provider_id}'"))?;
                {
                    let mut binding_guard = self.binding.lock().await;
                    if let Some(binding) = binding_guard.as_mut() {
                        binding.client = client;
                        binding.last_call_started = None;
                    }
                }
                self.invoke(system, messages, temperature).await
            }
        }
    }

    /// Deletes every stored provider key (spec.md §4.A "reset credentials").
    pub async fn clear_all_stored_keys(&self) {
        let mut store = self.store.lock().await;
        for provider in &self.config.providers {
            store.delete(&provider.key_identifier);
        }
    }
}

fn is_auth_failure(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ProviderError>()
        .map(|e| matches!(e, ProviderError::AuthFailed(_)))
        .unwrap_or(false)
}

/// The user-cancelled case (SPEC_FULL.md §4.C): an `AuthFailed` whose message
/// says no key was ever supplied, rather than one a stored key actually
/// caused. Nothing stale to invalidate, so deletion is skipped.
fn is_user_cancelled(err: &anyhow::Error) -> bool {
    err.to_string().contains("not provided by the user")
}

/// Table-driven factory keyed by `ClientKind` (spec.md §4.B).
fn build_client(
    provider: &ProviderConfig,
    api_key: Option<String>,
    model: &str,
) -> Result<Arc<dyn ChatClient>> {
    let base_url = provider.api_base();
    let model = match provider.model_prefix() {
        Some(prefix) => format!("{prefix}{model}"),
        None => model.to_string(),
    };

    Ok(match provider.client_kind {
        ClientKind::OpenrouterLike => {
            Arc::new(OpenRouterLikeClient::new(base_url, api_key, model)) as Arc<dyn ChatClient>
        }
        ClientKind::OpenaiLike => {
            Arc::new(OpenAiCompatibleClient::new(base_url, api_key, model)) as Arc<dyn ChatClient>
        }
        ClientKind::AnthropicLike => {
            Arc::new(AnthropicLikeClient::new(base_url, api_key, model)) as Arc<dyn ChatClient>
        }
        ClientKind::GoogleLike => {
            Arc::new(GoogleLikeClient::new(base_url, api_key, model)) as Arc<dyn ChatClient>
        }
        ClientKind::HuggingfaceLike => {
            Arc::new(HuggingFaceLikeClient::new(base_url, api_key, model)) as Arc<dyn ChatClient>
        }
        ClientKind::OllamaLike => Arc::new(OllamaLikeClient::new(base_url, model)) as Arc<dyn ChatClient>,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentConfig, Config, ProviderConfig};
    use crate::credentials::JsonCredentialStore;
    use crate::errors::ProviderError;
    use crate::ui::NonInteractiveUi;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeClient {
        calls: Arc<AtomicUsize>,
        fail_once_with: Option<ProviderError>,
    }

    #[async_trait]
    impl ChatClient for FakeClient {
        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _temperature: f32,
            _max_output_tokens: Option<u32>,
        ) -> Result<ChatMessage, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                if let Some(ProviderError::AuthFailed(msg)) = &self.fail_once_with {
                    return Err(ProviderError::AuthFailed(msg.clone()));
                }
            }
            Ok(ChatMessage::assistant("ok"))
        }
    }

    fn test_config() -> Config {
        Config {
            providers: vec![ProviderConfig {
                id: "test-provider".to_string(),
                display_name: "Test".to_string(),
                key_identifier: "test-provider".to_string(),
                client_kind: ClientKind::OpenaiLike,
                client_extras: HashMap::new(),
            }],
            agent: AgentConfig {
                min_call_interval_secs: 0,
                ..AgentConfig::default()
            },
            ..Config::default()
        }
    }

    async fn bind_fake(manager: &AgentManager, calls: Arc<AtomicUsize>, fail_once_with: Option<ProviderError>) {
        let fake = Arc::new(FakeClient { calls, fail_once_with }) as Arc<dyn ChatClient>;
        let mut binding = manager.binding.lock().await;
        *binding = Some(AgentBinding {
            provider_id: "test-provider".to_string(),
            key_identifier: "test-provider".to_string(),
            model: "test-model".to_string(),
            client: fake,
            last_call_started: None,
        });
    }

    #[tokio::test]
    async fn invoke_with_no_binding_errors() {
        let manager = AgentManager::new(test_config(), Box::new(JsonCredentialStore::default()));
        let err = manager
            .invoke(ChatMessage::system("sys"), vec![ChatMessage::user("hi")], 0.0)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no provider bound"));
    }

    #[tokio::test]
    async fn invoke_dispatches_to_bound_client() {
        let manager = AgentManager::new(test_config(), Box::new(JsonCredentialStore::default()));
        let calls = Arc::new(AtomicUsize::new(0));
        bind_fake(&manager, calls.clone(), None).await;

        let reply = manager
            .invoke(ChatMessage::system("sys"), vec![ChatMessage::user("hi")], 0.0)
            .await
            .unwrap();
        assert_eq!(reply.content, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pacing_serializes_back_to_back_calls() {
        let mut config = test_config();
        config.agent.min_call_interval_secs = 1;
        let manager = AgentManager::new(config, Box::new(JsonCredentialStore::default()));
        let calls = Arc::new(AtomicUsize::new(0));
        bind_fake(&manager, calls.clone(), None).await;

        let start = Instant::now();
        manager
            .invoke(ChatMessage::system("sys"), vec![ChatMessage::user("hi")], 0.0)
            .await
            .unwrap();
        manager
            .invoke(ChatMessage::system("sys"), vec![ChatMessage::user("hi")], 0.0)
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn auth_failure_deletes_stored_key_and_reports_via_ui() {
        let manager = AgentManager::new(test_config(), Box::new(JsonCredentialStore::default()));
        {
            let mut store = manager.store.lock().await;
            store.put("test-provider", "stale-key").unwrap();
        }
        let calls = Arc::new(AtomicUsize::new(0));
        bind_fake(
            &manager,
            calls.clone(),
            Some(ProviderError::AuthFailed("bad key".to_string())),
        )
        .await;

        let ui = NonInteractiveUi;
        let err = manager
            .invoke_with_recovery(ChatMessage::system("sys"), vec![ChatMessage::user("hi")], 0.0, &ui)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("authentication failed"));

        let store = manager.store.lock().await;
        assert_eq!(store.get("test-provider"), None);
    }

    #[tokio::test]
    async fn user_cancelled_auth_failure_does_not_delete_stored_key() {
        let manager = AgentManager::new(test_config(), Box::new(JsonCredentialStore::default()));
        {
            let mut store = manager.store.lock().await;
            store.put("test-provider", "still-good-key").unwrap();
        }
        let calls = Arc::new(AtomicUsize::new(0));
        bind_fake(
            &manager,
            calls.clone(),
            Some(ProviderError::AuthFailed(
                "API key not provided by the user".to_string(),
            )),
        )
        .await;

        let ui = NonInteractiveUi;
        let err = manager
            .invoke_with_recovery(ChatMessage::system("sys"), vec![ChatMessage::user("hi")], 0.0, &ui)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not provided by the user"));

        let store = manager.store.lock().await;
        assert_eq!(store.get("test-provider"), Some("still-good-key".to_string()));
    }

    #[tokio::test]
    async fn clear_all_stored_keys_removes_every_provider_secret() {
        let manager = AgentManager::new(test_config(), Box::new(JsonCredentialStore::default()));
        {
            let mut store = manager.store.lock().await;
            store.put("test-provider", "k").unwrap();
        }
        manager.clear_all_stored_keys().await;
        let store = manager.store.lock().await;
        assert_eq!(store.get("test-provider"), None);
    }

    #[tokio::test]
    async fn reinitialize_rejects_unknown_provider() {
        let manager = AgentManager::new(test_config(), Box::new(JsonCredentialStore::default()));
        let err = manager.reinitialize("nonexistent", "gpt-4").await.unwrap_err();
        assert!(err.to_string().contains("unknown provider"));
    }
}
