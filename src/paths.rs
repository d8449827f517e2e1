use std::path::PathBuf;
use std::sync::OnceLock;

static CODEWRIGHT_HOME: OnceLock<PathBuf> = OnceLock::new();

/// Returns the Codewright home directory (`~/.codewright/`).
/// Supports `$CODEWRIGHT_HOME` env override. Cached via `OnceLock`.
pub fn codewright_home() -> &'static PathBuf {
    CODEWRIGHT_HOME.get_or_init(|| {
        if let Ok(val) = std::env::var("CODEWRIGHT_HOME") {
            let p = PathBuf::from(val);
            if !p.as_os_str().is_empty() {
                return p;
            }
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".codewright")
    })
}

/// `~/.codewright/logs/`
pub fn logs_dir() -> PathBuf {
    codewright_home().join("logs")
}

/// `~/.codewright/credentials.json`
pub fn credentials_file() -> PathBuf {
    codewright_home().join("credentials.json")
}

/// `<project_root>/.codewright/project_state.json` (spec.md §6 persisted state layout).
pub fn project_state_file(project_root: &std::path::Path) -> PathBuf {
    project_root.join(".codewright").join("project_state.json")
}
