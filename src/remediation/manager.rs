//! Remediation Manager (spec.md §4.J).
//!
//! The outer loop: plan → build fix prompt → call the LLM → parse
//! `<file_content>` blocks → atomic commit → verify by rerunning the
//! original command → rollback and re-plan on failure. Grounded on the
//! teacher's `engine/` task-dispatch loop (sequential task execution,
//! atomic-commit-then-verify shape) generalized to the fixed three-step
//! outer loop spec.md §4.J describes.

use crate::agent_manager::AgentManager;
use crate::config::RemediationFlags;
use crate::context::ContextManager;
use crate::error_analyzer::ErrorAnalyzer;
use crate::errors::ProviderError;
use crate::exec::CommandExecutor;
use crate::providers::ChatMessage;
use crate::remediation::planner::plan;
use crate::sandbox::SandboxedFs;
use crate::state::{ErrorRecord, FixLogicTask, ProjectState};
use crate::ui::{ProgressEvent, UiCallbacks};
use anyhow::Result;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

/// Outcome of a full remediation run (spec.md §4.J step 3).
pub enum RemediationOutcome {
    Resolved,
    /// `max_outer_iterations` exhausted, or the planner returned no tasks
    /// for a nonempty error batch. Carries the last-seen error batch so the
    /// caller can persist "in-progress, continuable" state (spec.md §5
    /// cancellation/continuation model).
    BudgetExhausted {
        iterations: usize,
        last_errors: Vec<ErrorRecord>,
    },
}

enum TaskOutcome {
    Verified,
    /// `new_errors` is empty when the task failed before a verification run
    /// even happened (e.g. the LLM omitted a required file); the caller
    /// should keep the previous error batch in that case.
    Failed { new_errors: Vec<ErrorRecord> },
}

pub struct RemediationManager<'a> {
    agent_manager: &'a AgentManager,
    context: &'a mut ContextManager,
    fs: &'a SandboxedFs,
    executor: &'a mut CommandExecutor,
    ui: &'a dyn UiCallbacks,
    flags: RemediationFlags,
    max_outer_iterations: usize,
    net_retries: u32,
}

impl<'a> RemediationManager<'a> {
    pub fn new(
        agent_manager: &'a AgentManager,
        context: &'a mut ContextManager,
        fs: &'a SandboxedFs,
        executor: &'a mut CommandExecutor,
        ui: &'a dyn UiCallbacks,
        flags: RemediationFlags,
        max_outer_iterations: usize,
        net_retries: u32,
    ) -> Self {
        Self {
            agent_manager,
            context,
            fs,
            executor,
            ui,
            flags,
            max_outer_iterations,
            net_retries,
        }
    }

    /// Runs the outer loop starting from an already-failed command's output
    /// (spec.md §4.J). `analyzer` is freshly constructed per call by the
    /// caller (it carries only the immutable `project_root`).
    pub async fn remediate(
        &mut self,
        project_state: &ProjectState,
        analyzer: &ErrorAnalyzer,
        command: &str,
        stdout: &str,
        stderr: &str,
        exit_code: i32,
    ) -> Result<RemediationOutcome> {
        let (mut errors, _tail) = analyzer.analyze(command, stdout, stderr, exit_code);
        if errors.is_empty() {
            return Ok(RemediationOutcome::Resolved);
        }

        let mut iteration = 0usize;
        loop {
            if iteration >= self.max_outer_iterations {
                return Ok(RemediationOutcome::BudgetExhausted {
                    iterations: iteration,
                    last_errors: errors,
                });
            }
            iteration += 1;

            self.ui
                .update_progress(ProgressEvent::new(
                    "remediation",
                    format!("outer iteration {iteration}/{}", self.max_outer_iterations),
                ))
                .await;

            // Step 1: ask the Planner for tasks; empty means declare failure.
            let (tasks, unhandled) = plan(&errors, project_state, &self.flags);
            if tasks.is_empty() {
                return Ok(RemediationOutcome::BudgetExhausted {
                    iterations: iteration,
                    last_errors: unhandled,
                });
            }

            let mut all_verified = true;
            for task in &tasks {
                match self.apply_fix_task(task, command, analyzer).await? {
                    TaskOutcome::Verified => {}
                    TaskOutcome::Failed { new_errors } => {
                        if !new_errors.is_empty() {
                            errors = new_errors;
                        }
                        all_verified = false;
                        break;
                    }
                }
            }

            if all_verified {
                return Ok(RemediationOutcome::Resolved);
            }
        }
    }

    /// Step 2 of the outer loop: build prompt, call the LLM, parse, commit,
    /// verify. Verification failure rolls back and feeds the next planning
    /// pass.
    async fn apply_fix_task(
        &mut self,
        task: &FixLogicTask,
        command: &str,
        analyzer: &ErrorAnalyzer,
    ) -> Result<TaskOutcome> {
        self.ui
            .update_progress(
                ProgressEvent::new("remediation", format!("fixing: {}", task.description))
                    .with_issue(task.original_error.summary.clone()),
            )
            .await;

        let ctx = self.context.get_context_for_prompt(self.agent_manager).await?;
        let prompt = self.build_fix_prompt(task, &ctx);

        let reply = self
            .call_with_net_retries(
                ChatMessage::system(
                    "You are a meticulous code-fixing assistant. Respond only with one \
                     <file_content path=\"...\"><![CDATA[...]]></file_content> block per \
                     requested file, containing that file's complete corrected content.",
                ),
                vec![ChatMessage::user(prompt)],
            )
            .await?;

        let updates = parse_file_content_blocks(&reply.content);
        for required in &task.files_to_fix {
            if !updates.contains_key(required) {
                tracing::warn!("fix response missing required file '{required}'; task failed");
                return Ok(TaskOutcome::Failed { new_errors: Vec::new() });
            }
        }

        let commit = self.fs.apply_atomic_file_updates(&updates)?;

        let outcome = self.executor.execute(command).await?;
        let result = outcome.result();
        if result.success() {
            self.fs.discard_backups(&commit);
            if let Some(last) = task.files_to_fix.first() {
                self.context.set_last_modified_file(last.clone());
            }
            self.context
                .add_work_history(format!("Fixed: {}", task.description));
            Ok(TaskOutcome::Verified)
        } else {
            self.fs.rollback(&commit)?;
            let (new_errors, _tail) = analyzer.analyze(command, &result.stdout, &result.stderr, result.exit_code);
            Ok(TaskOutcome::Failed { new_errors })
        }
    }

    fn build_fix_prompt(&self, task: &FixLogicTask, ctx: &crate::context::PromptContext) -> String {
        let mut prompt = String::new();
        prompt.push_str(&ctx.rules);
        prompt.push_str("\n\n");
        prompt.push_str(&ctx.code_context);
        prompt.push_str("\n\n");
        prompt.push_str(&ctx.history_context);
        prompt.push_str("\n\n");
        prompt.push_str(&ctx.content_availability_note);
        prompt.push_str("\n\n## Diagnosis\n");
        prompt.push_str(&task.description);
        prompt.push_str("\n\n## Original error\n");
        prompt.push_str(&task.original_error.raw_message);
        prompt.push_str("\n\n## Files to fix\n");
        for file in &task.files_to_fix {
            let current = self.fs.read(file).unwrap_or_default();
            prompt.push_str(&format!("--- {file} ---\n{current}\n"));
        }
        prompt
    }

    /// Retries up to `net_retries` on `ProviderError::is_retryable()`;
    /// `AuthFailed` goes through the credential-recovery dialog instead
    /// (spec.md §4.J step 2.b).
    async fn call_with_net_retries(
        &self,
        system: ChatMessage,
        messages: Vec<ChatMessage>,
    ) -> Result<ChatMessage> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self
                .agent_manager
                .invoke_with_recovery(system.clone(), messages.clone(), 0.2, self.ui)
                .await
            {
                Ok(reply) => return Ok(reply),
                Err(err) => {
                    let retryable = err
                        .downcast_ref::<ProviderError>()
                        .map(|e| e.is_retryable())
                        .unwrap_or(false);
                    if retryable && attempt < self.net_retries {
                        tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }
}

/// Extracts `<file_content path="...">` / `<![CDATA[...]]>` / `</file_content>`
/// blocks from an LLM reply (spec.md §4.J step 2.a).
fn parse_file_content_blocks(text: &str) -> HashMap<String, String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(
            r#"(?s)<file_content\s+path="([^"]+)"\s*>\s*<!\[CDATA\[(.*?)\]\]>\s*</file_content>"#,
        )
        .unwrap()
    });
    re.captures_iter(text)
        .map(|cap| (cap[1].to_string(), cap[2].to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multiple_file_content_blocks() {
        let text = r#"
Here are the fixes:
<file_content path="calculator/views.py"><![CDATA[
def index(request):
    return render(request, "calculator/index.html")
]]></file_content>
<file_content path="calculator/urls.py"><![CDATA[
urlpatterns = []
]]></file_content>
"#;
        let blocks = parse_file_content_blocks(text);
        assert_eq!(blocks.len(), 2);
        assert!(blocks["calculator/views.py"].contains("def index"));
        assert!(blocks["calculator/urls.py"].contains("urlpatterns"));
    }

    #[test]
    fn no_blocks_yields_empty_map() {
        let blocks = parse_file_content_blocks("I couldn't find a fix.");
        assert!(blocks.is_empty());
    }
}
