//! Domain error taxonomy (spec.md §7), matched by name throughout the engine.
//!
//! Each component that the spec gives a closed error set gets its own
//! `thiserror` enum rather than a bare `anyhow::Error`, so the Remediation
//! Manager can pattern-match on error kind to decide rollback vs. re-plan vs.
//! give up.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from a provider `chat()` call. Uniform across all client kinds —
/// see `spec.md` §4.B: "the abstraction never leaks."
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("transient failure: {0}")]
    TransientFailure(String),
    #[error("protocol error: {0}")]
    ProtocolError(String),
    #[error("blocked by content policy: {0}")]
    Blocked(String),
}

impl ProviderError {
    /// Whether this error is within the OpenRouter-like/HuggingFace-like
    /// client's own retry budget (spec.md §4.B retry discipline).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited(_) | ProviderError::TransientFailure(_)
        )
    }
}

/// Errors from the Sandboxed Filesystem (spec.md §4.D).
#[derive(Debug, Error)]
pub enum FsError {
    #[error("path escapes project root: {0}")]
    PathEscape(PathBuf),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("patch failed to apply: {0}")]
    PatchApplyFailed(#[from] PatchError),
}

/// Errors from patch application (unified diff and search/replace).
#[derive(Debug, Error)]
pub enum PatchError {
    #[error(
        "search block did not match (best similarity {best_similarity:.2}); closest candidate:\n{excerpt}"
    )]
    NoMatch {
        best_similarity: f64,
        excerpt: String,
    },
    #[error("malformed patch: {0}")]
    Malformed(String),
    #[error("unsafe path in patch: {0}")]
    UnsafePath(String),
}

/// Errors from the Command Executor (spec.md §4.E).
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("command not in the allowed list: {0}")]
    NotAllowed(String),
    #[error("command contains shell metacharacters: {0}")]
    Metacharacter(String),
    #[error("path outside project root: {0}")]
    PathOutsideRoot(String),
    #[error("command blocked and substituted: {original} -> {substitute}")]
    BlockedCommand { original: String, substitute: String },
    #[error("command timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Errors from the Credential Store (spec.md §4.A).
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("cannot store an empty secret")]
    EmptySecret,
}

/// Terminal-for-a-feature error: the remediation budget ran out.
/// State is saved in "continuable" form (spec.md §7 `BudgetExhausted`).
#[derive(Debug, Error)]
#[error("remediation budget exhausted after {iterations} iteration(s)")]
pub struct BudgetExhausted {
    pub iterations: usize,
}
