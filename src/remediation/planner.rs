//! Remediation Planner (spec.md §4.I).
//!
//! Pure function `(errors, project_state, flags) -> (tasks, unhandled_errors)`.
//! A pipeline of strategy functions runs in the fixed order spec.md §4.I
//! tables: each strategy claims zero or more error records it recognizes and
//! turns them into one `FixLogicTask`; whatever no strategy claims comes back
//! as `unhandled_errors`. File derivation is naming-convention-based — the
//! planner never touches the filesystem (DESIGN.md "planner stays pure").

use crate::config::RemediationFlags;
use crate::state::{ErrorKind, ErrorRecord, FixLogicTask, ProjectState};

/// Runs the strategy pipeline over `errors` in order, honoring `flags`.
pub fn plan(
    errors: &[ErrorRecord],
    project_state: &ProjectState,
    flags: &RemediationFlags,
) -> (Vec<FixLogicTask>, Vec<ErrorRecord>) {
    let mut remaining: Vec<ErrorRecord> = errors.to_vec();
    let mut tasks = Vec::new();

    if flags.allow_no_reverse_match {
        run_strategy(&mut remaining, &mut tasks, |e| {
            no_reverse_match(e, project_state)
        });
    }
    if flags.allow_template_does_not_exist {
        run_strategy(&mut remaining, &mut tasks, template_does_not_exist);
    }
    if flags.allow_fixlogic {
        run_strategy(&mut remaining, &mut tasks, assertion_error_in_view_test);
    }
    if flags.allow_str_representation {
        run_strategy(&mut remaining, &mut tasks, str_representation);
    }
    if flags.allow_fallback {
        run_strategy(&mut remaining, &mut tasks, fallback);
    }

    (tasks, remaining)
}

/// Drains `remaining`, handing each record to `strategy`; records the
/// strategy claims (returns `Some`) are removed and turned into a task.
fn run_strategy(
    remaining: &mut Vec<ErrorRecord>,
    tasks: &mut Vec<FixLogicTask>,
    strategy: impl Fn(&ErrorRecord) -> Option<FixLogicTask>,
) {
    let mut i = 0;
    while i < remaining.len() {
        if let Some(task) = strategy(&remaining[i]) {
            tasks.push(task);
            remaining.remove(i);
        } else {
            i += 1;
        }
    }
}

/// App name is the template's own containing app directory: for
/// `calculator/templates/calculator/index.html` that's `calculator`
/// (the first path segment), matching Django's per-app `templates/<app>/`
/// convention.
fn app_name_from_path(path: &str) -> Option<&str> {
    path.split('/').next().filter(|s| !s.is_empty())
}

/// `NoReverseMatch: Reverse for 'X' not found` — spec.md §4.I, §8 seed
/// scenario 3. `files_to_fix` = root urlconf + app urlconf + app views + the
/// originating template.
fn no_reverse_match(error: &ErrorRecord, project_state: &ProjectState) -> Option<FixLogicTask> {
    if error.kind != ErrorKind::TemplateError || !error.summary.starts_with("NoReverseMatch:") {
        return None;
    }
    let app = app_name_from_path(&error.file_path)?;
    let files_to_fix = vec![
        format!("{}/urls.py", project_state.project_name),
        format!("{app}/urls.py"),
        format!("{app}/views.py"),
        error.file_path.clone(),
    ];
    Some(FixLogicTask {
        original_error: error.clone(),
        description: format!(
            "URL reversal failed ({}). The view/template references a URL name that isn't \
             registered in either urlconf. Check {app}/views.py's use of the name, {app}/urls.py's \
             `path(...)` registrations, and the root urlconf's include() of {app}'s URLs.",
            error.summary
        ),
        files_to_fix,
    })
}

/// `TemplateDoesNotExist: <path>` — the view that called `render` plus the
/// missing template path.
fn template_does_not_exist(error: &ErrorRecord) -> Option<FixLogicTask> {
    if error.kind != ErrorKind::TemplateError || !error.summary.starts_with("TemplateDoesNotExist:") {
        return None;
    }
    let missing_template = error
        .hints
        .as_ref()
        .and_then(|h| h.candidate_files.first())
        .cloned()
        .unwrap_or_else(|| error.summary.trim_start_matches("TemplateDoesNotExist:").trim().to_string());

    let mut files_to_fix = vec![error.file_path.clone()];
    if !files_to_fix.contains(&missing_template) {
        files_to_fix.push(missing_template.clone());
    }

    Some(FixLogicTask {
        original_error: error.clone(),
        description: format!(
            "{} called render() with a template that doesn't exist on disk: {missing_template}. \
             Create the template (or correct the path the view passes to render()).",
            error.file_path
        ),
        files_to_fix,
    })
}

/// Test file path ends in `test_views.py` and the error is `AssertionError`
/// — sibling `views.py` plus the test file itself (explicit permission to
/// edit the test, per spec.md §4.I).
fn assertion_error_in_view_test(error: &ErrorRecord) -> Option<FixLogicTask> {
    if !error.file_path.ends_with("test_views.py") {
        return None;
    }
    if !matches!(error.kind, ErrorKind::TestFailure | ErrorKind::LogicError)
        || !error.summary.starts_with("AssertionError")
    {
        return None;
    }
    let app_dir = error.file_path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
    let views_path = if app_dir.is_empty() {
        "views.py".to_string()
    } else {
        format!("{app_dir}/views.py")
    };
    Some(FixLogicTask {
        original_error: error.clone(),
        description: format!(
            "Assertion failed in {}: {}. The view's behavior doesn't match what the test \
             expects; fix the view logic, or correct the test's expectation if it's the test \
             that's wrong.",
            error.file_path, error.summary
        ),
        files_to_fix: vec![views_path, error.file_path.clone()],
    })
}

/// A test named `test_str_representation` fails — the app's `models.py` only.
fn str_representation(error: &ErrorRecord) -> Option<FixLogicTask> {
    if !error.raw_message.contains("test_str_representation") {
        return None;
    }
    let app_dir = error.file_path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
    let models_path = if app_dir.is_empty() {
        "models.py".to_string()
    } else {
        format!("{app_dir}/models.py")
    };
    Some(FixLogicTask {
        original_error: error.clone(),
        description: format!(
            "test_str_representation failed: {}. The model's __str__ doesn't return what the \
             test expects; fix {models_path}.",
            error.summary
        ),
        files_to_fix: vec![models_path],
    })
}

/// Any remaining error with a non-empty `file_path` — that file alone.
fn fallback(error: &ErrorRecord) -> Option<FixLogicTask> {
    if error.file_path.is_empty() {
        return None;
    }
    Some(FixLogicTask {
        original_error: error.clone(),
        description: format!("{} failed: {}", error.file_path, error.summary),
        files_to_fix: vec![error.file_path.clone()],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ErrorHints;

    fn state() -> ProjectState {
        ProjectState::new("my_project", "django", "/srv/my_project")
    }

    fn template_error(summary: &str, file_path: &str) -> ErrorRecord {
        ErrorRecord {
            kind: ErrorKind::TemplateError,
            file_path: file_path.to_string(),
            line: Some(5),
            summary: summary.to_string(),
            raw_message: summary.to_string(),
            hints: None,
            command: "python manage.py test".to_string(),
        }
    }

    #[test]
    fn no_reverse_match_emits_exact_files_to_fix_seed_scenario() {
        let error = template_error(
            "NoReverseMatch: Reverse for 'add' not found",
            "calculator/templates/calculator/index.html",
        );
        let (tasks, unhandled) = plan(&[error], &state(), &RemediationFlags::default());
        assert!(unhandled.is_empty());
        assert_eq!(tasks.len(), 1);
        let mut files = tasks[0].files_to_fix.clone();
        files.sort();
        let mut expected = vec![
            "my_project/urls.py".to_string(),
            "calculator/urls.py".to_string(),
            "calculator/views.py".to_string(),
            "calculator/templates/calculator/index.html".to_string(),
        ];
        expected.sort();
        assert_eq!(files, expected);
    }

    #[test]
    fn disabled_strategy_falls_through_to_fallback() {
        let error = template_error(
            "NoReverseMatch: Reverse for 'add' not found",
            "calculator/templates/calculator/index.html",
        );
        let mut flags = RemediationFlags::default();
        flags.allow_no_reverse_match = false;
        let (tasks, unhandled) = plan(&[error], &state(), &flags);
        assert!(unhandled.is_empty());
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].files_to_fix, vec!["calculator/templates/calculator/index.html".to_string()]);
    }

    #[test]
    fn template_does_not_exist_uses_hint_candidate() {
        let mut error = template_error("TemplateDoesNotExist: calculator/missing.html", "calculator/views.py");
        error.hints = Some(ErrorHints {
            candidate_files: vec!["calculator/missing.html".to_string()],
        });
        let (tasks, _) = plan(&[error], &state(), &RemediationFlags::default());
        assert_eq!(tasks.len(), 1);
        assert!(tasks[0].files_to_fix.contains(&"calculator/missing.html".to_string()));
        assert!(tasks[0].files_to_fix.contains(&"calculator/views.py".to_string()));
    }

    #[test]
    fn assertion_error_in_view_test_permits_editing_the_test() {
        let error = ErrorRecord {
            kind: ErrorKind::TestFailure,
            file_path: "calculator/test_views.py".to_string(),
            line: Some(12),
            summary: "AssertionError: 4 != 5".to_string(),
            raw_message: "AssertionError: 4 != 5".to_string(),
            hints: None,
            command: "python manage.py test".to_string(),
        };
        let (tasks, unhandled) = plan(&[error], &state(), &RemediationFlags::default());
        assert!(unhandled.is_empty());
        assert_eq!(
            tasks[0].files_to_fix,
            vec!["calculator/views.py".to_string(), "calculator/test_views.py".to_string()]
        );
    }

    #[test]
    fn str_representation_targets_only_models() {
        let error = ErrorRecord {
            kind: ErrorKind::TestFailure,
            file_path: "calculator/tests.py".to_string(),
            line: Some(9),
            summary: "AssertionError: 'Item' != 'item: Item'".to_string(),
            raw_message: "test_str_representation (calculator.tests.ModelTests) ... FAIL\nAssertionError: 'Item' != 'item: Item'".to_string(),
            hints: None,
            command: "python manage.py test".to_string(),
        };
        let (tasks, _) = plan(&[error], &state(), &RemediationFlags::default());
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].files_to_fix, vec!["calculator/models.py".to_string()]);
    }

    #[test]
    fn fallback_targets_file_path_alone() {
        let error = ErrorRecord {
            kind: ErrorKind::SyntaxError,
            file_path: "calculator/views.py".to_string(),
            line: Some(20),
            summary: "SyntaxError: invalid syntax".to_string(),
            raw_message: "SyntaxError: invalid syntax".to_string(),
            hints: None,
            command: "python manage.py test".to_string(),
        };
        let (tasks, unhandled) = plan(&[error], &state(), &RemediationFlags::default());
        assert!(unhandled.is_empty());
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].files_to_fix, vec!["calculator/views.py".to_string()]);
    }

    #[test]
    fn error_without_file_path_is_unhandled() {
        let error = ErrorRecord {
            kind: ErrorKind::CommandError,
            file_path: String::new(),
            line: None,
            summary: "linker error".to_string(),
            raw_message: "linker error".to_string(),
            hints: None,
            command: "make build".to_string(),
        };
        let (tasks, unhandled) = plan(&[error], &state(), &RemediationFlags::default());
        assert!(tasks.is_empty());
        assert_eq!(unhandled.len(), 1);
    }
}
