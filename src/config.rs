//! Startup configuration (spec.md §6 "Provider configuration file").
//!
//! Grounded on the teacher's `Config::load()`: read a TOML file from the
//! current directory, fall back to a `Default` if it is absent. Loaded once
//! at startup, never mutated (spec.md §3 `ProviderConfig` invariant).

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// One of the five client kinds spec.md §4.B requires, plus the teacher's
/// existing Ollama client kept as a sixth, locally-hosted kind (see
/// DESIGN.md for the grounding of that addition).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientKind {
    OpenrouterLike,
    OpenaiLike,
    AnthropicLike,
    GoogleLike,
    HuggingfaceLike,
    OllamaLike,
}

/// `spec.md` §3 `ProviderConfig`. Loaded once at startup; never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub display_name: String,
    /// Name of the secret this provider's key is stored under in the
    /// `CredentialStore` (spec.md §4.A).
    pub key_identifier: String,
    pub client_kind: ClientKind,
    /// Free-form extras (`api_base`, `model_prefix`, …). `model_prefix` is
    /// config-only and popped before being forwarded to the client
    /// (spec.md §6).
    #[serde(default)]
    pub client_extras: HashMap<String, String>,
}

impl ProviderConfig {
    pub fn api_base(&self) -> Option<&str> {
        self.client_extras.get("api_base").map(|s| s.as_str())
    }

    /// `model_prefix` is config-only and never forwarded to a client's wire
    /// payload (spec.md §6).
    pub fn model_prefix(&self) -> Option<&str> {
        self.client_extras.get("model_prefix").map(|s| s.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Minimum inter-call delay enforced by the Agent Manager (spec.md §4.C `T_min`).
    #[serde(default = "default_min_call_interval_secs")]
    pub min_call_interval_secs: u64,
    /// `max_outer_iterations` for the Remediation Manager (spec.md §4.J).
    #[serde(default = "default_max_outer_iterations")]
    pub max_outer_iterations: usize,
    /// `N_net`: per-task network retry budget (spec.md §4.J step 2.b).
    #[serde(default = "default_net_retries")]
    pub net_retries: usize,
    /// `max_context_size` for the Context Manager (spec.md §4.G).
    #[serde(default = "default_max_context_size")]
    pub max_context_size: usize,
    /// `history_summary_threshold` for the Context Manager (spec.md §4.G).
    #[serde(default = "default_history_summary_threshold")]
    pub history_summary_threshold: usize,
    /// `max_messages` for chat-history pruning (spec.md §4.K).
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    /// Command Executor default timeout, in seconds (spec.md §4.E).
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Default `max_output_tokens` passed to `ChatClient::chat` when a
    /// caller doesn't override it. `AnthropicLikeClient` requires this field
    /// to be `Some` on every call (spec.md §4.B).
    #[serde(default = "default_max_output_tokens")]
    pub default_max_output_tokens: Option<u32>,
}

fn default_min_call_interval_secs() -> u64 {
    30
}
fn default_max_outer_iterations() -> usize {
    3
}
fn default_net_retries() -> usize {
    3
}
fn default_max_context_size() -> usize {
    24_000
}
fn default_history_summary_threshold() -> usize {
    3
}
fn default_max_messages() -> usize {
    50
}
fn default_command_timeout_secs() -> u64 {
    300
}
fn default_max_output_tokens() -> Option<u32> {
    Some(4096)
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            min_call_interval_secs: default_min_call_interval_secs(),
            max_outer_iterations: default_max_outer_iterations(),
            net_retries: default_net_retries(),
            max_context_size: default_max_context_size(),
            history_summary_threshold: default_history_summary_threshold(),
            max_messages: default_max_messages(),
            command_timeout_secs: default_command_timeout_secs(),
            default_max_output_tokens: default_max_output_tokens(),
        }
    }
}

/// Enable/disable individual remediation fix kinds (spec.md §4.J "Configuration flags").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationFlags {
    #[serde(default = "default_true")]
    pub allow_no_reverse_match: bool,
    #[serde(default = "default_true")]
    pub allow_template_does_not_exist: bool,
    #[serde(default = "default_true")]
    pub allow_fixlogic: bool,
    #[serde(default = "default_true")]
    pub allow_str_representation: bool,
    #[serde(default = "default_true")]
    pub allow_fallback: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RemediationFlags {
    fn default() -> Self {
        Self {
            allow_no_reverse_match: true,
            allow_template_does_not_exist: true,
            allow_fixlogic: true,
            allow_str_representation: true,
            allow_fallback: true,
        }
    }
}

/// Allowlisted command heads for the Command Executor (spec.md §4.E).
fn default_command_allowlist() -> Vec<String> {
    [
        "ls", "dir", "echo", "cat", "pwd", "git", "cargo", "python", "python3", "pytest", "pip",
        "npm", "node", "manage.py",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub remediation: RemediationFlags,
    #[serde(default = "default_command_allowlist")]
    pub command_allowlist: Vec<String>,
}

impl Config {
    /// Reads `codewright.toml` from the current directory; falls back to
    /// `Config::default()` if absent (mirrors the teacher's `Config::load`).
    pub fn load() -> Result<Self> {
        let config_path = Path::new("codewright.toml");
        if config_path.exists() {
            let content = fs::read_to_string(config_path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            providers: vec![ProviderConfig {
                id: "openai".to_string(),
                display_name: "OpenAI".to_string(),
                key_identifier: "openai".to_string(),
                client_kind: ClientKind::OpenaiLike,
                client_extras: HashMap::new(),
            }],
            agent: AgentConfig::default(),
            remediation: RemediationFlags::default(),
            command_allowlist: default_command_allowlist(),
        }
    }
}
