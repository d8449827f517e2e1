//! Thin CLI front end (spec.md §6 "Command surface"). Drives one
//! orchestration pass over a project directory from the command line; the
//! library is meant to be embedded behind a richer UI, which is out of
//! scope here. Grounded on the teacher's `main.rs` argument-parsing shape
//! (`clap` derive `Cli`/`Command`), narrowed to the operations this crate's
//! core actually performs.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use codewright::agent_manager::AgentManager;
use codewright::config::Config;
use codewright::context::ContextManager;
use codewright::credentials::JsonCredentialStore;
use codewright::error_analyzer::ErrorAnalyzer;
use codewright::exec::CommandExecutor;
use codewright::logging::{self, LoggingSettings};
use codewright::paths;
use codewright::providers::ChatMessage;
use codewright::remediation::{RemediationManager, RemediationOutcome};
use codewright::sandbox::SandboxedFs;
use codewright::state::{FeatureStatus, MemoryManager, ProjectFeature, ProjectState, TaskAction};
use codewright::ui::{NonInteractiveUi, UiCallbacks};
use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

const FRAMEWORK_RULES: &str = "You are Codewright, an autonomous code-generation agent working \
inside a sandboxed project directory. Only touch files inside the project root. Prefer small, \
targeted edits over wholesale rewrites. When asked for file content, return complete file \
contents, never partial diffs, unless explicitly asked for a patch.";

#[derive(Parser, Debug)]
#[command(name = "codewright", version, about = "Plan a feature request into tasks, dispatch them to an LLM provider, and remediate failures.")]
struct Cli {
    /// Overrides the tracing level (e.g. "debug", "warn").
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Plan `request` into tasks against `project_root`, then dispatch, apply, and remediate.
    Run {
        #[arg(long)]
        project_root: PathBuf,
        #[arg(long)]
        request: String,
        /// Provider id from `codewright.toml`; defaults to the first configured provider.
        #[arg(long)]
        provider: Option<String>,
        #[arg(long, default_value = "default")]
        model: String,
    },
    /// Utility entry point: does `table_name` exist in the project's database? (spec.md §6)
    CheckTable {
        project_root: PathBuf,
        table_name: String,
    },
    /// Utility entry point: does `Model` exist in `app_label`'s models module? (spec.md §6)
    CheckModel {
        project_root: PathBuf,
        app_label: String,
        model_name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::setup_tracing_with_settings(LoggingSettings {
        level: cli.log_level.as_deref(),
        directory: None,
        retention_days: None,
    })?;

    match cli.command {
        Command::Run {
            project_root,
            request,
            provider,
            model,
        } => run(project_root, request, provider, model).await,
        Command::CheckTable { project_root, table_name } => {
            let code = codewright::check::check_table(&project_root, &table_name);
            std::process::exit(code);
        }
        Command::CheckModel {
            project_root,
            app_label,
            model_name,
        } => {
            let code = codewright::check::check_model(&project_root, &app_label, &model_name);
            std::process::exit(code);
        }
    }
}

async fn run(project_root: PathBuf, request: String, provider: Option<String>, model: String) -> Result<()> {
    let project_root = project_root
        .canonicalize()
        .with_context(|| format!("project root '{}' does not exist", project_root.display()))?;

    let config = Config::load()?;
    let provider_id = provider
        .or_else(|| config.providers.first().map(|p| p.id.clone()))
        .ok_or_else(|| anyhow!("no provider configured in codewright.toml"))?;

    let store = JsonCredentialStore::load(&paths::credentials_file());
    let agent_manager = AgentManager::new(config.clone(), Box::new(store));
    agent_manager.reinitialize(&provider_id, &model).await?;

    let memory = MemoryManager::new(&project_root);
    let mut project_state = memory.load_project_state()?.unwrap_or_else(|| {
        let name = project_root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "project".to_string());
        ProjectState::new(name, "django", project_root.to_string_lossy())
    });

    let fs = SandboxedFs::new(&project_root);
    let mut executor = CommandExecutor::new(&project_root, config.command_allowlist.clone())
        .with_timeout(Duration::from_secs(config.agent.command_timeout_secs));
    let ui = NonInteractiveUi;

    let mut context = ContextManager::new(
        FRAMEWORK_RULES,
        project_state.code_summaries.clone(),
        fs.directory_tree_markdown(),
        config.agent.max_context_size,
        config.agent.history_summary_threshold,
    );

    tracing::info!("planning feature request against {}", project_root.display());
    let plan_prompt = format!(
        "Plan the following feature request into a JSON object matching this shape exactly: \
         {{\"id\": string, \"name\": string, \"description\": string, \"tasks\": [{{\"task_id_str\": \
         string, \"action\": \"Create file\"|\"Modify file\"|\"Delete file\"|\"Run command\"|\"Prompt \
         user input\", \"target\": string, \"description\": string, \"dependencies\": [string]}}]}}. \
         Respond with only the JSON object.\n\nFeature request: {request}"
    );
    let reply = agent_manager
        .invoke_with_recovery(
            ChatMessage::system(
                "You are a meticulous software planning assistant. Respond with only a single JSON object, no prose.",
            ),
            vec![ChatMessage::user(plan_prompt)],
            0.3,
            &ui,
        )
        .await?;

    let mut feature: ProjectFeature =
        serde_json::from_str(extract_json_object(&reply.content)).with_context(|| {
            format!("provider returned a plan that isn't the expected JSON shape: {}", reply.content)
        })?;
    feature.validate().map_err(|e| anyhow!(e))?;
    feature.status = FeatureStatus::InProgress;

    let mut failed = false;
    for task in feature.tasks.clone() {
        match task.action {
            TaskAction::CreateFile | TaskAction::ModifyFile => {
                if let Err(e) = generate_and_write_file(&agent_manager, &fs, &task.target, &task.description, &ui).await {
                    tracing::error!("task {} failed: {e}", task.task_id_str);
                    failed = true;
                    break;
                }
                context.set_last_modified_file(task.target.clone());
                context.add_work_history(format!("{}: {}", task.task_id_str, task.description));
                project_state
                    .code_summaries
                    .insert(task.target.clone(), task.description.clone());
            }
            TaskAction::DeleteFile => {
                fs.delete(&task.target)?;
                context.add_work_history(format!("{}: deleted {}", task.task_id_str, task.target));
            }
            TaskAction::RunCommand => {
                let outcome = executor.execute(&task.target).await?;
                let result = outcome.result().clone();
                if result.success() {
                    context.add_work_history(format!("{}: `{}` succeeded", task.task_id_str, task.target));
                    continue;
                }

                tracing::warn!("command task {} failed, entering remediation", task.task_id_str);
                let analyzer = ErrorAnalyzer::new(&project_root);
                let mut remediation = RemediationManager::new(
                    &agent_manager,
                    &mut context,
                    &fs,
                    &mut executor,
                    &ui,
                    config.remediation.clone(),
                    config.agent.max_outer_iterations,
                    config.agent.net_retries as u32,
                );
                match remediation
                    .remediate(&project_state, &analyzer, &task.target, &result.stdout, &result.stderr, result.exit_code)
                    .await?
                {
                    RemediationOutcome::Resolved => {
                        context.add_work_history(format!("{}: remediated and verified", task.task_id_str));
                    }
                    RemediationOutcome::BudgetExhausted { iterations, last_errors } => {
                        tracing::error!(
                            "remediation budget exhausted after {iterations} iteration(s), {} error(s) remain",
                            last_errors.len()
                        );
                        failed = true;
                        break;
                    }
                }
            }
            TaskAction::PromptUserInput => {
                if ui.show_input_prompt(&task.task_id_str, false, &task.description).await.is_none() {
                    tracing::warn!("task {} needs user input; none available non-interactively", task.task_id_str);
                }
            }
        }
    }

    feature.status = if failed { FeatureStatus::Failed } else { FeatureStatus::Done };
    project_state.current_feature_id = Some(feature.id.clone());
    if let Some(existing) = project_state.get_feature_by_id_mut(&feature.id) {
        *existing = feature;
    } else {
        project_state.features.push(feature);
    }
    project_state.work_history = context.work_history().to_vec();
    memory.save_project_state(&project_state)?;

    if failed {
        bail!("feature request failed; state saved as continuable");
    }
    println!("Feature request completed successfully.");
    Ok(())
}

/// Asks the Agent Manager for one file's complete content and writes it
/// atomically (spec.md §4.J step 2.a-d narrowed to a single file).
async fn generate_and_write_file(
    agent_manager: &AgentManager,
    fs: &SandboxedFs,
    target: &str,
    description: &str,
    ui: &NonInteractiveUi,
) -> Result<()> {
    let existing = fs.read(target).unwrap_or_default();
    let prompt = format!(
        "Write the complete contents of `{target}`. Task: {description}\n\nCurrent contents (empty if new):\n{existing}\n\n\
         Respond with only a single <file_content path=\"{target}\"><![CDATA[...]]></file_content> block."
    );
    let reply = agent_manager
        .invoke_with_recovery(
            ChatMessage::system("You are a meticulous code-generation assistant."),
            vec![ChatMessage::user(prompt)],
            0.2,
            ui,
        )
        .await?;

    let content = extract_single_file_content(&reply.content, target)
        .ok_or_else(|| anyhow!("response for '{target}' did not contain the expected file_content block"))?;

    let mut updates = HashMap::new();
    updates.insert(target.to_string(), content);
    let commit = fs.apply_atomic_file_updates(&updates)?;
    fs.discard_backups(&commit);
    Ok(())
}

fn extract_single_file_content(text: &str, path: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r#"(?s)<file_content\s+path="([^"]+)"\s*>\s*<!\[CDATA\[(.*?)\]\]>\s*</file_content>"#).unwrap()
    });
    re.captures_iter(text)
        .find(|cap| &cap[1] == path)
        .or_else(|| re.captures_iter(text).next())
        .map(|cap| cap[2].to_string())
}

/// Trims prose around a JSON object an LLM may have wrapped in a code fence
/// or a leading sentence, taking the outermost `{...}` span.
fn extract_json_object(text: &str) -> &str {
    let start = text.find('{');
    let end = text.rfind('}');
    match (start, end) {
        (Some(s), Some(e)) if e >= s => &text[s..=e],
        _ => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_object_strips_surrounding_prose() {
        let text = "Sure, here is the plan:\n```json\n{\"id\": \"f1\", \"tasks\": []}\n```\nLet me know!";
        assert_eq!(extract_json_object(text), "{\"id\": \"f1\", \"tasks\": []}");
    }

    #[test]
    fn extract_single_file_content_matches_requested_path() {
        let text = r#"<file_content path="app/models.py"><![CDATA[
class Item:
    pass
]]></file_content>"#;
        let content = extract_single_file_content(text, "app/models.py").unwrap();
        assert!(content.contains("class Item"));
    }
}
