//! Command Executor (spec.md §4.E).
//!
//! Whitelists a small set of commands and enforces two composed defences:
//! static rejection (metacharacters, allowlist, path escapes) and a dynamic
//! blocklist that transparently substitutes a safe alternative command.
//! Grounded on `test_command_executor.py` for the exact error substrings
//! (`"not in the allowed list"`, `"outside project root"`, `"shell
//! metacharacters"`) and on the teacher's `src/check.rs` +
//! `engine/tools/tool_helpers.rs::validate_shell_command` for the static-
//! rejection mechanics.

use crate::errors::ExecError;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

/// Sentinel exit code returned when a command is killed for running past
/// its timeout (spec.md §4.E).
pub const TIMEOUT_SENTINEL: i32 = 124;

const METACHARACTERS: &[char] = &['|', '&', ';', '>', '<', '$', '(', ')', '`', '\\'];

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A nonzero exit is not an exception; the Error Analyzer is expected to
/// consume `ExecResult`'s three fields regardless of which variant ran
/// (spec.md §4.E).
#[derive(Debug)]
pub enum CommandOutcome {
    Ran(ExecResult),
    /// The requested command matched the dynamic blocklist and was
    /// transparently replaced. Returned as an explicit third outcome rather
    /// than silently indistinguishable from a direct run (SPEC_FULL.md §4.E
    /// Open Question resolution, DESIGN.md).
    Substituted { ran: String, result: ExecResult },
}

impl CommandOutcome {
    pub fn result(&self) -> &ExecResult {
        match self {
            CommandOutcome::Ran(r) => r,
            CommandOutcome::Substituted { result, .. } => result,
        }
    }
}

/// A `(regex, safe_replacement)` pair for the dynamic blocklist (spec.md §4.E).
#[derive(Debug, Clone)]
pub struct BlocklistRule {
    pub pattern: Regex,
    pub safe_replacement: String,
}

pub struct CommandExecutor {
    project_root: PathBuf,
    original_root: PathBuf,
    allowlist: Vec<String>,
    blocklist: Vec<BlocklistRule>,
    timeout: Duration,
}

impl CommandExecutor {
    pub fn new(project_root: impl Into<PathBuf>, allowlist: Vec<String>) -> Self {
        let root = project_root.into();
        Self {
            project_root: root.clone(),
            original_root: root,
            allowlist,
            blocklist: Vec::new(),
            timeout: Duration::from_secs(300),
        }
    }

    pub fn with_blocklist(mut self, blocklist: Vec<BlocklistRule>) -> Self {
        self.blocklist = blocklist;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Runs `command_line` inside the sandbox. `cd` is handled internally
    /// and is the only command that mutates executor state.
    pub async fn execute(&mut self, command_line: &str) -> Result<CommandOutcome, ExecError> {
        if let Some(rule) = self
            .blocklist
            .iter()
            .find(|r| r.pattern.is_match(command_line))
            .cloned()
        {
            tracing::warn!(
                "command '{}' matched blocklist pattern, substituting '{}'",
                command_line,
                rule.safe_replacement
            );
            let result = self.run_checked(&rule.safe_replacement).await?;
            return Ok(CommandOutcome::Substituted {
                ran: rule.safe_replacement,
                result,
            });
        }

        let result = self.run_checked(command_line).await?;
        Ok(CommandOutcome::Ran(result))
    }

    async fn run_checked(&mut self, command_line: &str) -> Result<ExecResult, ExecError> {
        self.reject_metacharacters(command_line)?;
        let parts = split_args(command_line)?;
        let Some(head) = parts.first() else {
            return Err(ExecError::NotAllowed("empty command".to_string()));
        };

        if head == "cd" {
            return self.run_cd(&parts);
        }

        self.reject_not_allowlisted(head)?;
        self.reject_paths_outside_root(&parts)?;

        let start = std::time::Instant::now();
        let mut cmd = Command::new(head);
        cmd.args(&parts[1..]).current_dir(&self.project_root);

        let spawned = cmd
            .output();
        let output = match timeout(self.timeout, spawned).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ExecError::NotAllowed(format!("failed to spawn {head}: {e}")));
            }
            Err(_) => {
                return Ok(ExecResult {
                    exit_code: TIMEOUT_SENTINEL,
                    stdout: String::new(),
                    stderr: format!("command timed out after {:?}", self.timeout),
                    duration: start.elapsed(),
                });
            }
        };

        Ok(ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration: start.elapsed(),
        })
    }

    fn reject_metacharacters(&self, command_line: &str) -> Result<(), ExecError> {
        if command_line.chars().any(|c| METACHARACTERS.contains(&c)) {
            return Err(ExecError::Metacharacter(command_line.to_string()));
        }
        Ok(())
    }

    fn reject_not_allowlisted(&self, head: &str) -> Result<(), ExecError> {
        if !self.allowlist.iter().any(|a| a == head) {
            return Err(ExecError::NotAllowed(head.to_string()));
        }
        Ok(())
    }

    fn reject_paths_outside_root(&self, parts: &[String]) -> Result<(), ExecError> {
        for arg in &parts[1..] {
            if arg.starts_with('-') {
                continue;
            }
            if looks_like_path(arg) {
                let resolved = self.project_root.join(arg);
                let normalized = normalize_lexically(&resolved);
                if !normalized.starts_with(&self.original_root) {
                    return Err(ExecError::PathOutsideRoot(arg.to_string()));
                }
            }
        }
        Ok(())
    }

    fn run_cd(&mut self, parts: &[String]) -> Result<ExecResult, ExecError> {
        let target = parts.get(1).map(|s| s.as_str()).unwrap_or(".");
        let candidate = normalize_lexically(&self.project_root.join(target));
        if !candidate.starts_with(&self.original_root) {
            return Err(ExecError::PathOutsideRoot(target.to_string()));
        }
        self.project_root = candidate;
        Ok(ExecResult {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::default(),
        })
    }
}

fn looks_like_path(arg: &str) -> bool {
    arg.contains('/') || arg.contains('\\') || arg == ".." || arg == "."
}

/// Lexical `..`/`.` normalization without touching the filesystem (the
/// target of a `cd`/path argument may not exist yet).
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

/// Minimal, shell-free splitting with quote support (grounded on the
/// teacher's `check.rs::split_args`).
fn split_args(cmd: &str) -> Result<Vec<String>, ExecError> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut in_single = false;
    let mut in_double = false;

    for ch in cmd.chars() {
        match ch {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            c if c.is_whitespace() && !in_single && !in_double => {
                if !cur.is_empty() {
                    out.push(cur.clone());
                    cur.clear();
                }
            }
            c => cur.push(c),
        }
    }
    if in_single || in_double {
        return Err(ExecError::NotAllowed("unterminated quote".to_string()));
    }
    if !cur.is_empty() {
        out.push(cur);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> (tempfile::TempDir, CommandExecutor) {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("dummy_file.txt"), "hello world").unwrap();
        std::fs::create_dir(tmp.path().join("subdir")).unwrap();
        let allowlist = vec![
            "ls".to_string(),
            "echo".to_string(),
            "cat".to_string(),
        ];
        let exec = CommandExecutor::new(tmp.path(), allowlist);
        (tmp, exec)
    }

    #[tokio::test]
    async fn executes_whitelisted_command() {
        let (_tmp, mut exec) = executor();
        let outcome = exec.execute("ls").await.unwrap();
        let result = outcome.result();
        assert!(result.success());
        assert!(result.stdout.contains("dummy_file.txt"));
    }

    #[tokio::test]
    async fn blocks_command_not_in_whitelist() {
        let (_tmp, mut exec) = executor();
        let err = exec.execute("fdisk").await.unwrap_err();
        assert!(matches!(err, ExecError::NotAllowed(_)));
        assert!(err.to_string().contains("not in the allowed list"));
    }

    #[tokio::test]
    async fn blocks_path_traversal() {
        let (_tmp, exec) = executor();
        let mut exec = CommandExecutor::new(exec.project_root().to_path_buf(), vec!["mkdir".to_string()]);
        let err = exec.execute("mkdir ../evil_dir").await.unwrap_err();
        assert!(matches!(err, ExecError::PathOutsideRoot(_)));
        assert!(err.to_string().contains("outside project root"));
    }

    #[tokio::test]
    async fn blocks_shell_metacharacters() {
        let (_tmp, mut exec) = executor();
        let err = exec.execute("echo hello > output.txt").await.unwrap_err();
        assert!(matches!(err, ExecError::Metacharacter(_)));
        assert!(err.to_string().contains("shell metacharacters"));

        let err = exec.execute("ls | grep dummy").await.unwrap_err();
        assert!(matches!(err, ExecError::Metacharacter(_)));
    }

    #[tokio::test]
    async fn cd_is_sandboxed() {
        let (_tmp, mut exec) = executor();
        let initial_root = exec.project_root().to_path_buf();

        exec.execute("cd subdir").await.unwrap();
        assert_eq!(exec.project_root(), initial_root.join("subdir"));

        exec.execute("cd ..").await.unwrap();
        assert_eq!(exec.project_root(), initial_root);

        let err = exec.execute("cd ..").await.unwrap_err();
        assert!(matches!(err, ExecError::PathOutsideRoot(_)));
        assert_eq!(exec.project_root(), initial_root);
    }

    #[tokio::test]
    async fn dynamic_blocklist_substitutes_safe_alternative() {
        let (_tmp, exec) = executor();
        let mut exec = exec.with_blocklist(vec![BlocklistRule {
            pattern: Regex::new(r"python -c").unwrap(),
            safe_replacement: "echo substituted".to_string(),
        }]);
        let outcome = exec
            .execute("python -c \"import importlib\"")
            .await
            .unwrap();
        match outcome {
            CommandOutcome::Substituted { ran, result } => {
                assert_eq!(ran, "echo substituted");
                assert!(result.success());
            }
            CommandOutcome::Ran(_) => panic!("expected substitution"),
        }
    }
}
