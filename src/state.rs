//! Project State / Memory (spec.md §4.K, §3).
//!
//! `ProjectState` is the root persisted document. Loading is tolerant of
//! schema evolution (`#[serde(default)]` on every field added after the
//! first release) and of outright corruption (`MemoryManager::load_project_state`
//! returns `Ok(None)` rather than panicking — grounded on
//! `test_memory_manager.py::test_load_corrupted_state_file`).

use crate::parsers::ProjectStructureMap;
use crate::providers::ChatMessage;
use regex::Regex;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::OnceLock;

/// `spec.md` §3 `FeatureTask.action`: a closed set of string variants. The
/// wire representation matches the original Python literal strings exactly
/// (SPEC_FULL.md §3), even though `codewright` itself only ever emits these
/// five.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskAction {
    #[serde(rename = "Create file")]
    CreateFile,
    #[serde(rename = "Modify file")]
    ModifyFile,
    #[serde(rename = "Delete file")]
    DeleteFile,
    #[serde(rename = "Run command")]
    RunCommand,
    #[serde(rename = "Prompt user input")]
    PromptUserInput,
}

impl TaskAction {
    pub fn default_test_step(self) -> Option<String> {
        match self {
            TaskAction::PromptUserInput => None,
            _ => Some("echo \"Default test step - Check manually\"".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    #[default]
    Pending,
    InProgress,
    Done,
    Failed,
}

/// `spec.md` §3 `FeatureTask`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureTask {
    pub task_id_str: String,
    pub action: TaskAction,
    pub target: String,
    #[serde(default)]
    pub description: String,
    /// Accepts several historical foreign shapes on load, always normalized
    /// to `Vec<String>` (SPEC_FULL.md §3). `codewright` itself always
    /// serializes a plain `Vec<String>`.
    #[serde(default, deserialize_with = "deserialize_dependencies")]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub test_step: Option<String>,
}

impl FeatureTask {
    pub fn new(task_id_str: impl Into<String>, action: TaskAction, target: impl Into<String>) -> Self {
        let action_value = action;
        Self {
            task_id_str: task_id_str.into(),
            action,
            target: target.into(),
            description: String::new(),
            dependencies: Vec::new(),
            test_step: action_value.default_test_step(),
        }
    }
}

fn task_id_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+(\.\d+)*$").unwrap())
}

/// Normalizes the permissive foreign `dependencies` shapes described in
/// SPEC_FULL.md §3 (`"1.1, 1.2"`, `"depends_on: 2.1, 2.2"`,
/// `"3.1 (Create model), 3.2"`, `"None"`, `null`, a list of numbers, a list
/// with invalid entries) down to a filtered `Vec<String>`.
fn deserialize_dependencies<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Null,
        Str(String),
        List(Vec<serde_json::Value>),
    }

    let raw = Option::<Raw>::deserialize(deserializer)?;
    let raw = match raw {
        None | Some(Raw::Null) => return Ok(Vec::new()),
        Some(r) => r,
    };

    let candidates: Vec<String> = match raw {
        Raw::Null => Vec::new(),
        Raw::Str(s) => {
            let s = s.trim();
            if s.eq_ignore_ascii_case("none") || s.is_empty() {
                Vec::new()
            } else {
                let s = s.strip_prefix("depends_on:").unwrap_or(s);
                s.split(',').map(|part| part.trim().to_string()).collect()
            }
        }
        Raw::List(items) => items
            .into_iter()
            .map(|v| match v {
                serde_json::Value::String(s) => s,
                serde_json::Value::Number(n) => n.to_string(),
                other => other.to_string(),
            })
            .collect(),
    };

    let pattern = task_id_pattern();
    Ok(candidates
        .into_iter()
        .filter_map(|raw_id| {
            // Strip trailing parenthetical annotations like "3.1 (Create model)".
            let id = raw_id
                .split('(')
                .next()
                .unwrap_or(&raw_id)
                .trim()
                .to_string();
            pattern.is_match(&id).then_some(id)
        })
        .collect())
}

/// `spec.md` §3 `ProjectFeature`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectFeature {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: FeatureStatus,
    #[serde(default)]
    pub tasks: Vec<FeatureTask>,
}

impl ProjectFeature {
    pub fn new(id: impl Into<String>, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            status: FeatureStatus::Pending,
            tasks: Vec::new(),
        }
    }

    /// Invariant (i): every `task_id_str` unique within a feature.
    /// Invariant (ii): every dependency references a prior task.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for task in &self.tasks {
            if !seen.insert(task.task_id_str.as_str()) {
                return Err(format!("duplicate task_id_str: {}", task.task_id_str));
            }
        }
        for task in &self.tasks {
            for dep in &task.dependencies {
                if !seen.contains(dep.as_str()) {
                    return Err(format!(
                        "task {} depends on unknown task {}",
                        task.task_id_str, dep
                    ));
                }
            }
        }
        Ok(())
    }
}

/// `spec.md` §3 `ErrorRecord`. Produced only by the Error Analyzer;
/// consumed read-only everywhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    SyntaxError,
    ImportError,
    TemplateError,
    LogicError,
    TestFailure,
    CommandError,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorHints {
    pub candidate_files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub file_path: String,
    pub line: Option<u32>,
    pub summary: String,
    pub raw_message: String,
    #[serde(default)]
    pub hints: Option<ErrorHints>,
    pub command: String,
}

/// `spec.md` §3 `FixLogicTask`. Lifetime: one remediation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixLogicTask {
    pub original_error: ErrorRecord,
    pub description: String,
    pub files_to_fix: Vec<String>,
}

/// `spec.md` §3 `ProjectState` (root). Mutated only by the Agent Manager /
/// Remediation Manager on commit; persisted whole by `MemoryManager`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectState {
    pub project_name: String,
    pub framework: String,
    pub root_path: String,
    #[serde(default)]
    pub features: Vec<ProjectFeature>,
    #[serde(default)]
    pub current_feature_id: Option<String>,
    #[serde(default)]
    pub registered_apps: HashSet<String>,
    #[serde(default)]
    pub code_summaries: HashMap<String, String>,
    #[serde(default)]
    pub project_structure_map: ProjectStructureMap,
    #[serde(default)]
    pub work_history: Vec<String>,
}

impl ProjectState {
    pub fn new(project_name: impl Into<String>, framework: impl Into<String>, root_path: impl Into<String>) -> Self {
        Self {
            project_name: project_name.into(),
            framework: framework.into(),
            root_path: root_path.into(),
            features: Vec::new(),
            current_feature_id: None,
            registered_apps: HashSet::new(),
            code_summaries: HashMap::new(),
            project_structure_map: ProjectStructureMap::default(),
            work_history: Vec::new(),
        }
    }

    pub fn get_feature_by_id(&self, id: &str) -> Option<&ProjectFeature> {
        self.features.iter().find(|f| f.id == id)
    }

    pub fn get_feature_by_id_mut(&mut self, id: &str) -> Option<&mut ProjectFeature> {
        self.features.iter_mut().find(|f| f.id == id)
    }
}

/// Persists `ProjectState` as a single document at
/// `.codewright/project_state.json` under the project root (spec.md §6).
pub struct MemoryManager {
    storage_dir: std::path::PathBuf,
}

impl MemoryManager {
    pub fn new(project_root: &Path) -> Self {
        Self {
            storage_dir: project_root.join(".codewright"),
        }
    }

    fn state_file(&self) -> std::path::PathBuf {
        self.storage_dir.join("project_state.json")
    }

    /// Returns `Ok(None)` when the file is absent or corrupted — never
    /// panics on invalid JSON (grounded on
    /// `test_memory_manager.py::test_load_corrupted_state_file` /
    /// `test_load_non_existent_state`).
    pub fn load_project_state(&self) -> anyhow::Result<Option<ProjectState>> {
        let path = self.state_file();
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        match serde_json::from_str::<ProjectState>(&content) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                tracing::warn!("project_state.json is corrupted or outdated: {}", e);
                Ok(None)
            }
        }
    }

    pub fn save_project_state(&self, state: &ProjectState) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.storage_dir)?;
        let json = serde_json::to_string_pretty(state)?;
        std::fs::write(self.state_file(), json)?;
        Ok(())
    }

    /// History pruning (spec.md §4.K): when the in-flight chat history
    /// exceeds `max_messages`, keep the first (system) message and the last
    /// `max_messages - 1`.
    pub fn prune_history(history: &[ChatMessage], max_messages: usize) -> Vec<ChatMessage> {
        if history.len() <= max_messages || max_messages == 0 {
            return history.to_vec();
        }
        let mut pruned = Vec::with_capacity(max_messages);
        pruned.push(history[0].clone());
        let tail_len = max_messages - 1;
        pruned.extend_from_slice(&history[history.len() - tail_len..]);
        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::Role;

    #[test]
    fn dependency_parsing_handles_foreign_shapes() {
        #[derive(Deserialize)]
        struct Wrapper {
            #[serde(deserialize_with = "deserialize_dependencies")]
            dependencies: Vec<String>,
        }
        let cases: &[(&str, Vec<&str>)] = &[
            (r#"{"dependencies": "1.1, 1.2"}"#, vec!["1.1", "1.2"]),
            (r#"{"dependencies": "depends_on: 2.1, 2.2"}"#, vec!["2.1", "2.2"]),
            (r#"{"dependencies": "3.1 (Create model), 3.2"}"#, vec!["3.1", "3.2"]),
            (r#"{"dependencies": "None"}"#, vec![]),
            (r#"{"dependencies": null}"#, vec![]),
            (r#"{"dependencies": [4.1, "4.2"]}"#, vec!["4.1", "4.2"]),
            (
                r#"{"dependencies": ["5.1", "invalid_id", "5.2"]}"#,
                vec!["5.1", "5.2"],
            ),
        ];
        for (json, expected) in cases {
            let w: Wrapper = serde_json::from_str(json).unwrap();
            assert_eq!(w.dependencies, *expected, "input: {json}");
        }
    }

    #[test]
    fn default_test_step_depends_on_action() {
        assert_eq!(
            TaskAction::CreateFile.default_test_step(),
            Some("echo \"Default test step - Check manually\"".to_string())
        );
        assert_eq!(TaskAction::PromptUserInput.default_test_step(), None);
    }

    #[test]
    fn feature_validate_rejects_duplicate_task_ids() {
        let mut feature = ProjectFeature::new("f1", "Feature", "desc");
        feature
            .tasks
            .push(FeatureTask::new("1.1", TaskAction::CreateFile, "a.py"));
        feature
            .tasks
            .push(FeatureTask::new("1.1", TaskAction::ModifyFile, "b.py"));
        assert!(feature.validate().is_err());
    }

    #[test]
    fn feature_validate_rejects_unknown_dependency() {
        let mut feature = ProjectFeature::new("f1", "Feature", "desc");
        let mut task = FeatureTask::new("1.1", TaskAction::CreateFile, "a.py");
        task.dependencies.push("9.9".to_string());
        feature.tasks.push(task);
        assert!(feature.validate().is_err());
    }

    #[test]
    fn save_and_load_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = MemoryManager::new(tmp.path());
        let mut feature = ProjectFeature::new("F01", "Test Feature", "A feature for testing.");
        feature
            .tasks
            .push(FeatureTask::new("1.1", TaskAction::RunCommand, "echo 'hello'"));
        let state = ProjectState::new("memory_test", "django", tmp.path().to_string_lossy());
        let mut state = state;
        state.features.push(feature);

        manager.save_project_state(&state).unwrap();
        let loaded = manager.load_project_state().unwrap().unwrap();
        assert_eq!(loaded.project_name, "memory_test");
        assert_eq!(loaded.features.len(), 1);
        assert!(matches!(loaded.features[0].tasks[0].action, TaskAction::RunCommand));
    }

    #[test]
    fn load_non_existent_state_returns_none() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = MemoryManager::new(tmp.path());
        assert!(manager.load_project_state().unwrap().is_none());
    }

    #[test]
    fn load_corrupted_state_returns_none_without_panicking() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = MemoryManager::new(tmp.path());
        std::fs::create_dir_all(tmp.path().join(".codewright")).unwrap();
        std::fs::write(
            tmp.path().join(".codewright/project_state.json"),
            "{'invalid_json': True,}",
        )
        .unwrap();
        assert!(manager.load_project_state().unwrap().is_none());
    }

    #[test]
    fn load_outdated_state_defaults_missing_fields() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = MemoryManager::new(tmp.path());
        std::fs::create_dir_all(tmp.path().join(".codewright")).unwrap();
        let outdated = serde_json::json!({
            "project_name": "outdated_project",
            "framework": "flask",
            "root_path": tmp.path().to_string_lossy(),
            "features": [],
        });
        std::fs::write(
            tmp.path().join(".codewright/project_state.json"),
            outdated.to_string(),
        )
        .unwrap();
        let loaded = manager.load_project_state().unwrap().unwrap();
        assert_eq!(loaded.project_name, "outdated_project");
        assert!(loaded.project_structure_map.apps.is_empty());
    }

    #[test]
    fn prune_history_keeps_first_and_tail() {
        let mut history = vec![ChatMessage::new(Role::System, "System Prompt")];
        for i in 0..55 {
            history.push(ChatMessage::new(Role::User, format!("Message {i}")));
        }
        let pruned = MemoryManager::prune_history(&history, 50);
        assert_eq!(pruned.len(), 50);
        assert_eq!(pruned[0].content, "System Prompt");
        assert_eq!(pruned.last().unwrap().content, "Message 54");
        assert_eq!(pruned[1].content, "Message 6");
    }

    #[test]
    fn prune_history_noop_when_short() {
        let history = vec![ChatMessage::new(Role::System, "hi")];
        let pruned = MemoryManager::prune_history(&history, 50);
        assert_eq!(pruned.len(), 1);
    }
}
