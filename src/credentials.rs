//! Credential Store (spec.md §4.A).
//!
//! The core only depends on the `CredentialStore` trait — an opaque
//! get/put/delete of secrets keyed by name. `JsonCredentialStore` is the one
//! concrete implementation this crate ships (grounded on the teacher's
//! `src/credentials.rs` `Credentials`/`CredentialEntry`/`load`/`save`); other
//! backends are left to integrators.

use crate::errors::CredentialError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Opaque get/put/delete of secrets keyed by name (spec.md §4.A).
///
/// Invariant: secrets are trimmed of surrounding whitespace on every
/// boundary crossing — `get`/`put` both strip.
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn put(&mut self, key: &str, secret: &str) -> Result<(), CredentialError>;
    fn delete(&mut self, key: &str) -> bool;

    /// Writes, reads, deletes a test key; true only if the round-trip matches.
    fn health_check(&mut self) -> bool {
        const PROBE_KEY: &str = "__codewright_health_check__";
        if self.put(PROBE_KEY, "probe").is_err() {
            return false;
        }
        let round_trip_ok = self.get(PROBE_KEY).as_deref() == Some("probe");
        let deleted = self.delete(PROBE_KEY);
        round_trip_ok && deleted
    }
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
struct CredentialEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    secret: Option<String>,
}

/// Persisted format: `~/.codewright/credentials.json`.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct JsonCredentialStore {
    #[serde(flatten)]
    entries: HashMap<String, CredentialEntry>,
    #[serde(skip)]
    file: Option<PathBuf>,
}

impl JsonCredentialStore {
    /// Load from `file`. Returns an empty store if missing or invalid.
    pub fn load(file: &Path) -> Self {
        let mut store = if !file.exists() {
            Self::default()
        } else {
            match std::fs::read_to_string(file) {
                Ok(content) => match serde_json::from_str::<Self>(&content) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("failed to parse credentials file: {}", e);
                        Self::default()
                    }
                },
                Err(e) => {
                    warn!("failed to read credentials file: {}", e);
                    Self::default()
                }
            }
        };
        store.file = Some(file.to_path_buf());
        store
    }

    fn save(&self) -> Result<(), CredentialError> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CredentialError::StorageUnavailable(e.to_string()))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| CredentialError::StorageUnavailable(e.to_string()))?;
        std::fs::write(file, json).map_err(|e| CredentialError::StorageUnavailable(e.to_string()))
    }

    /// Return a copy with all secrets redacted, safe to hand to a caller
    /// that should not see plaintext keys.
    pub fn redacted(&self) -> HashMap<String, String> {
        self.entries
            .keys()
            .map(|k| (k.clone(), "***".to_string()))
            .collect()
    }
}

impl CredentialStore for JsonCredentialStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .get(key)
            .and_then(|e| e.secret.as_deref())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn put(&mut self, key: &str, secret: &str) -> Result<(), CredentialError> {
        let trimmed = secret.trim();
        if trimmed.is_empty() {
            return Err(CredentialError::EmptySecret);
        }
        self.entries.insert(
            key.to_string(),
            CredentialEntry {
                secret: Some(trimmed.to_string()),
            },
        );
        self.save()
    }

    fn delete(&mut self, key: &str) -> bool {
        self.entries.remove(key);
        self.save().is_ok()
    }
}

/// Resolve the effective API key for a provider (spec.md §4.A + SPEC_FULL.md
/// 4.A): explicit configuration > credential store > environment variable
/// `CODEWRIGHT_API_KEY_{PROVIDER_ID}` (hyphens to underscores, uppercased).
pub fn resolve_api_key(
    provider_id: &str,
    config_api_key: Option<&str>,
    store: &dyn CredentialStore,
    key_identifier: &str,
) -> Option<String> {
    if let Some(key) = config_api_key {
        let trimmed = key.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }
    if let Some(key) = store.get(key_identifier) {
        if !key.is_empty() {
            return Some(key);
        }
    }
    let env_name = format!(
        "CODEWRIGHT_API_KEY_{}",
        provider_id.to_uppercase().replace('-', "_")
    );
    std::env::var(&env_name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("credentials.json");

        let mut store = JsonCredentialStore::load(&file);
        store.put("openai", "  sk-123  ").unwrap();
        assert_eq!(store.get("openai"), Some("sk-123".to_string()));

        let reloaded = JsonCredentialStore::load(&file);
        assert_eq!(reloaded.get("openai"), Some("sk-123".to_string()));
        assert_eq!(reloaded.get("missing"), None);
    }

    #[test]
    fn empty_secret_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("credentials.json");
        let mut store = JsonCredentialStore::load(&file);
        assert!(matches!(
            store.put("openai", "   "),
            Err(CredentialError::EmptySecret)
        ));
    }

    #[test]
    fn delete_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("credentials.json");
        let mut store = JsonCredentialStore::load(&file);
        assert!(store.delete("never-existed"));
        store.put("x", "y").unwrap();
        assert!(store.delete("x"));
        assert!(store.delete("x"));
    }

    #[test]
    fn health_check_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("credentials.json");
        let mut store = JsonCredentialStore::load(&file);
        assert!(store.health_check());
        assert_eq!(store.get("__codewright_health_check__"), None);
    }

    #[test]
    fn resolve_priority_config_then_store_then_env() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("credentials.json");
        let mut store = JsonCredentialStore::load(&file);
        store.put("openai-key", "from-store").unwrap();

        assert_eq!(
            resolve_api_key("openai", Some("from-config"), &store, "openai-key"),
            Some("from-config".to_string())
        );
        assert_eq!(
            resolve_api_key("openai", None, &store, "openai-key"),
            Some("from-store".to_string())
        );
        assert_eq!(resolve_api_key("openai", None, &store, "missing-key"), None);
    }
}
