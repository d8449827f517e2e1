//! Error Analyzer (spec.md §4.H).
//!
//! Input: `(command, stdout, stderr, exit_code)`. Output: `([ErrorRecord],
//! unstructured_tail)`. Parsing is rule-based: each rule is a regex plus an
//! extractor/classifier that yields one `ErrorRecord` per match. Grounded on
//! `test_error_analyzer.py` for the three required parse cases
//! (NoReverseMatch deepest-template-frame selection, plain SyntaxError,
//! AttributeError deepest-project-frame selection).

use crate::state::{ErrorHints, ErrorKind, ErrorRecord};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

const EXCLUDED_DIRS: &[&str] = &[".git", "venv", ".venv", "env", "__pycache__", "node_modules"];

pub struct ErrorAnalyzer {
    project_root: PathBuf,
}

fn frame_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"File "([^"]+)", line (\d+)"#).unwrap())
}

impl ErrorAnalyzer {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
        }
    }

    /// Rule-based parse. Each rule is tried in order; every match yields one
    /// `ErrorRecord`. When nothing matches and the command still failed, a
    /// single `CommandError` fallback record is produced so callers never
    /// see an empty result for a nonzero exit.
    pub fn analyze(
        &self,
        command: &str,
        stdout: &str,
        stderr: &str,
        exit_code: i32,
    ) -> (Vec<ErrorRecord>, String) {
        if exit_code == 0 {
            return (Vec::new(), String::new());
        }
        let combined = format!("{stdout}\n{stderr}");

        let mut records = Vec::new();
        records.extend(self.parse_no_reverse_match(&combined, command));
        records.extend(self.parse_template_does_not_exist(&combined, command));
        records.extend(self.parse_attribute_error(&combined, command));
        records.extend(self.parse_syntax_error(&combined, command));
        records.extend(self.parse_assertion_error(&combined, command));

        if records.is_empty() {
            records.push(self.fallback_command_error(&combined, command));
            (records, String::new())
        } else {
            (records, String::new())
        }
    }

    /// Relative-to-project-root rendering of a path for display and for
    /// matching against sibling-file heuristics in the Remediation Planner.
    fn relativize(&self, path: &str) -> String {
        let p = Path::new(path);
        p.strip_prefix(&self.project_root)
            .unwrap_or(p)
            .to_string_lossy()
            .replace('\\', "/")
    }

    fn is_user_frame(&self, path: &str) -> bool {
        !path.contains("site-packages")
            && !path.contains("/venv/")
            && !path.contains("\\venv\\")
            && !path.contains("/.venv/")
            && EXCLUDED_DIRS.iter().all(|d| !path.contains(&format!("/{d}/")))
    }

    /// Deepest frame (last match — Python tracebacks list "most recent call
    /// last") whose path passes `predicate`.
    fn deepest_frame_where(
        &self,
        text: &str,
        predicate: impl Fn(&str) -> bool,
    ) -> Option<(String, u32)> {
        let mut found = None;
        for cap in frame_re().captures_iter(text) {
            let path = cap[1].to_string();
            if predicate(&path) {
                let line: u32 = cap[2].parse().unwrap_or(0);
                found = Some((self.relativize(&path), line));
            }
        }
        found
    }

    fn deepest_user_frame(&self, text: &str) -> Option<(String, u32)> {
        self.deepest_frame_where(text, |p| self.is_user_frame(p))
    }

    fn one_line_summary(message: &str) -> String {
        message.lines().next().unwrap_or(message).trim().to_string()
    }

    /// `NoReverseMatch: Reverse for 'X' not found`. The deepest frame whose
    /// path ends in `.html` is the originating template (the traceback
    /// frame where Django's template renderer was invoked); if no such
    /// frame exists, fall back to the deepest user frame.
    fn parse_no_reverse_match(&self, text: &str, command: &str) -> Option<ErrorRecord> {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| Regex::new(r"NoReverseMatch: Reverse for '([^']+)' not found").unwrap());
        let caps = re.captures(text)?;
        let name = &caps[1];

        let (file_path, line) = self
            .deepest_frame_where(text, |p| p.ends_with(".html"))
            .or_else(|| self.deepest_user_frame(text))
            .unwrap_or_default();

        Some(ErrorRecord {
            kind: ErrorKind::TemplateError,
            file_path,
            line: (line != 0).then_some(line),
            summary: format!("NoReverseMatch: Reverse for '{name}' not found"),
            raw_message: text.to_string(),
            hints: None,
            command: command.to_string(),
        })
    }

    /// `TemplateDoesNotExist: app/missing.html`. `file_path` is the deepest
    /// user-owned `.py` frame — the view that called `render()`.
    fn parse_template_does_not_exist(&self, text: &str, command: &str) -> Option<ErrorRecord> {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| Regex::new(r"TemplateDoesNotExist: (\S+)").unwrap());
        let caps = re.captures(text)?;
        let missing_template = caps[1].to_string();

        let (file_path, line) = self
            .deepest_frame_where(text, |p| self.is_user_frame(p) && p.ends_with(".py"))
            .unwrap_or_default();

        Some(ErrorRecord {
            kind: ErrorKind::TemplateError,
            file_path,
            line: (line != 0).then_some(line),
            summary: format!("TemplateDoesNotExist: {missing_template}"),
            raw_message: text.to_string(),
            hints: Some(ErrorHints {
                candidate_files: vec![missing_template],
            }),
            command: command.to_string(),
        })
    }

    /// `AttributeError: module 'app.models' has no attribute 'Foo'` — the
    /// deepest user-owned frame is the site of the bad attribute access.
    fn parse_attribute_error(&self, text: &str, command: &str) -> Option<ErrorRecord> {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| {
            Regex::new(r"AttributeError: module '([^']+)' has no attribute '([^']+)'").unwrap()
        });
        let caps = re.captures(text)?;
        let module = caps[1].to_string();
        let attr = &caps[2];

        let (file_path, line) = self.deepest_user_frame(text).unwrap_or_default();
        let module_file = format!("{}.py", module.replace('.', "/"));

        Some(ErrorRecord {
            kind: ErrorKind::ImportError,
            file_path,
            line: (line != 0).then_some(line),
            summary: format!("AttributeError: module '{module}' has no attribute '{attr}'"),
            raw_message: text.to_string(),
            hints: Some(ErrorHints {
                candidate_files: vec![module_file],
            }),
            command: command.to_string(),
        })
    }

    /// A plain `SyntaxError: <message>` with no traceback frames of its own
    /// (Python reports the offending file/line directly above the message).
    fn parse_syntax_error(&self, text: &str, command: &str) -> Option<ErrorRecord> {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| Regex::new(r"SyntaxError: (.+)").unwrap());
        let caps = re.captures(text)?;
        let message = caps[1].trim().to_string();

        let (file_path, line) = self.deepest_user_frame(text).unwrap_or_default();

        Some(ErrorRecord {
            kind: ErrorKind::SyntaxError,
            file_path,
            line: (line != 0).then_some(line),
            summary: format!("SyntaxError: {}", Self::one_line_summary(&message)),
            raw_message: text.to_string(),
            hints: None,
            command: command.to_string(),
        })
    }

    /// `AssertionError` (typically from a test run). Kind is `TestFailure`
    /// when the frame is a test file, otherwise `LogicError`.
    fn parse_assertion_error(&self, text: &str, command: &str) -> Option<ErrorRecord> {
        if !text.contains("AssertionError") {
            return None;
        }
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| Regex::new(r"AssertionError(?::\s*(.*))?").unwrap());
        let caps = re.captures(text)?;
        let detail = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");

        let (file_path, line) = self.deepest_user_frame(text).unwrap_or_default();
        let kind = if file_path.contains("test") {
            ErrorKind::TestFailure
        } else {
            ErrorKind::LogicError
        };

        Some(ErrorRecord {
            kind,
            file_path,
            line: (line != 0).then_some(line),
            summary: if detail.is_empty() {
                "AssertionError".to_string()
            } else {
                format!("AssertionError: {detail}")
            },
            raw_message: text.to_string(),
            hints: None,
            command: command.to_string(),
        })
    }

    fn fallback_command_error(&self, text: &str, command: &str) -> ErrorRecord {
        let (file_path, line) = self.deepest_user_frame(text).unwrap_or_default();
        let summary = text
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("command failed")
            .trim()
            .to_string();
        ErrorRecord {
            kind: ErrorKind::CommandError,
            file_path,
            line: (line != 0).then_some(line),
            summary,
            raw_message: text.to_string(),
            hints: None,
            command: command.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_reverse_match_selects_deepest_template_frame() {
        let analyzer = ErrorAnalyzer::new("/srv/my_project");
        let traceback = r#"
Traceback (most recent call last):
  File "/srv/my_project/calculator/views.py", line 12, in index
    return render(request, "calculator/index.html", {})
  File "/srv/my_project/calculator/templates/calculator/index.html", line 5, in top-level template code
    {% url 'add' %}
django.urls.exceptions.NoReverseMatch: Reverse for 'add' not found. 'add' is not a valid view function or pattern name.
"#;
        let (records, _) = analyzer.analyze("python manage.py test", "", traceback, 1);
        assert_eq!(records.len(), 1);
        let rec = &records[0];
        assert_eq!(rec.kind, ErrorKind::TemplateError);
        assert_eq!(rec.file_path, "calculator/templates/calculator/index.html");
        assert_eq!(rec.line, Some(5));
        assert!(rec.summary.contains("add"));
    }

    #[test]
    fn plain_syntax_error_resolves_deepest_user_frame() {
        let analyzer = ErrorAnalyzer::new("/srv/my_project");
        let traceback = r#"
  File "/srv/my_project/calculator/views.py", line 20
    def index(:
              ^
SyntaxError: invalid syntax
"#;
        let (records, _) = analyzer.analyze("python manage.py test", "", traceback, 1);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, ErrorKind::SyntaxError);
        assert_eq!(records[0].file_path, "calculator/views.py");
        assert_eq!(records[0].line, Some(20));
    }

    #[test]
    fn attribute_error_selects_deepest_project_frame_over_site_packages() {
        let analyzer = ErrorAnalyzer::new("/srv/my_project");
        let traceback = r#"
Traceback (most recent call last):
  File "/usr/lib/python3.11/site-packages/django/core/handlers/base.py", line 50, in _get_response
    response = wrapped_callback(request, *callback_args, **callback_kwargs)
  File "/srv/my_project/calculator/views.py", line 8, in index
    calculator.models.Foo()
AttributeError: module 'calculator.models' has no attribute 'Foo'
"#;
        let (records, _) = analyzer.analyze("python manage.py test", "", traceback, 1);
        assert_eq!(records.len(), 1);
        let rec = &records[0];
        assert_eq!(rec.kind, ErrorKind::ImportError);
        assert_eq!(rec.file_path, "calculator/views.py");
        assert_eq!(rec.hints.as_ref().unwrap().candidate_files, vec!["calculator/models.py"]);
    }

    #[test]
    fn template_does_not_exist_names_the_calling_view_and_missing_template() {
        let analyzer = ErrorAnalyzer::new("/srv/my_project");
        let traceback = r#"
Traceback (most recent call last):
  File "/srv/my_project/calculator/views.py", line 14, in index
    return render(request, "calculator/missing.html", {})
django.template.exceptions.TemplateDoesNotExist: calculator/missing.html
"#;
        let (records, _) = analyzer.analyze("python manage.py test", "", traceback, 1);
        assert_eq!(records.len(), 1);
        let rec = &records[0];
        assert_eq!(rec.file_path, "calculator/views.py");
        assert_eq!(
            rec.hints.as_ref().unwrap().candidate_files,
            vec!["calculator/missing.html"]
        );
    }

    #[test]
    fn zero_exit_code_yields_no_errors() {
        let analyzer = ErrorAnalyzer::new("/srv/my_project");
        let (records, tail) = analyzer.analyze("pytest", "ok", "", 0);
        assert!(records.is_empty());
        assert!(tail.is_empty());
    }

    #[test]
    fn unrecognized_failure_falls_back_to_command_error() {
        let analyzer = ErrorAnalyzer::new("/srv/my_project");
        let (records, _) = analyzer.analyze("make build", "", "linker error: undefined symbol\n", 2);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, ErrorKind::CommandError);
        assert!(records[0].summary.contains("undefined symbol"));
    }
}
