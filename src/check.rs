//! `check-table` / `check-model` utility entry points (spec.md §6).
//!
//! No Rust runtime can introspect a Django app's ORM state directly, so
//! these reimplement `check_db.py`/`check_model.py`'s own introspection
//! logic as an embedded Python snippet and shell out to the target
//! project's own interpreter — the same way every command this crate
//! dispatches against a project goes through a subprocess rather than a
//! reimplementation of the framework (DESIGN.md).

use std::path::Path;
use std::process::Command;

const CHECK_TABLE_SCRIPT: &str = r#"
import os, sys
import django
from django.db import connection
from django.core.exceptions import ImproperlyConfigured
if not os.environ.get("DJANGO_SETTINGS_MODULE"):
    sys.exit(1)
try:
    django.setup()
except ImproperlyConfigured:
    sys.exit(1)
sys.exit(0 if sys.argv[1] in connection.introspection.table_names() else 1)
"#;

const CHECK_MODEL_SCRIPT: &str = r#"
import os, sys, importlib, inspect
import django
from django.db import models
from django.core.exceptions import ImproperlyConfigured
if not os.environ.get("DJANGO_SETTINGS_MODULE"):
    sys.exit(1)
try:
    django.setup()
except ImproperlyConfigured:
    sys.exit(1)
try:
    mod = importlib.import_module(f"{sys.argv[1]}.models")
except ImportError:
    sys.exit(1)
for name, obj in inspect.getmembers(mod):
    if inspect.isclass(obj) and name == sys.argv[2] and issubclass(obj, models.Model):
        sys.exit(0)
sys.exit(1)
"#;

/// Exit code 0 = found, 1 = not found or error, 2 = wrong usage (spec.md §6).
pub fn check_table(project_root: &Path, table_name: &str) -> i32 {
    if table_name.trim().is_empty() {
        return 2;
    }
    run_script(project_root, CHECK_TABLE_SCRIPT, &[table_name])
}

/// Exit code 0 = found, 1 = not found or error, 2 = wrong usage (spec.md §6).
pub fn check_model(project_root: &Path, app_label: &str, model_name: &str) -> i32 {
    if app_label.trim().is_empty() || model_name.trim().is_empty() {
        return 2;
    }
    run_script(project_root, CHECK_MODEL_SCRIPT, &[app_label, model_name])
}

fn run_script(project_root: &Path, script: &str, args: &[&str]) -> i32 {
    let status = Command::new("python3")
        .arg("-c")
        .arg(script)
        .args(args)
        .current_dir(project_root)
        .status();
    match status {
        Ok(status) => status.code().unwrap_or(1),
        Err(e) => {
            tracing::error!("failed to spawn python3 for check: {e}");
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_table_name_is_usage_error() {
        assert_eq!(check_table(Path::new("."), ""), 2);
        assert_eq!(check_table(Path::new("."), "   "), 2);
    }

    #[test]
    fn empty_model_args_are_usage_errors() {
        assert_eq!(check_model(Path::new("."), "", "Foo"), 2);
        assert_eq!(check_model(Path::new("."), "myapp", ""), 2);
    }
}
