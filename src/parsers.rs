//! Code/Project Parsers — consumed read-only (spec.md §4.F, §6).
//!
//! The engine never produces these types; an external code-intelligence
//! layer (HTML/CSS/JS/Django parsers) does. This module defines the typed
//! shape the engine reads so `ProjectStructureMap` has something concrete to
//! hold, mirroring the teacher's posture toward other consumed-only external
//! capabilities (e.g. `headless_chrome` in `engine/tools/web_fetch.rs`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One parsed fact about a single project file, tagged by the kind of file
/// it came from. The engine reads these fields to decide which files a
/// remediation task should touch; it never constructs new variants itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
pub enum FileStructureInfo {
    Html {
        forms: Vec<HtmlFormInfo>,
        template_tags: Vec<String>,
    },
    Css {
        rules: Vec<String>,
    },
    Js {
        calls: Vec<String>,
    },
    DjangoModel {
        models: Vec<DjangoModel>,
    },
    DjangoView {
        view_names: Vec<String>,
    },
    DjangoUrl {
        url_names: Vec<String>,
        app_name: Option<String>,
    },
    DjangoForm {
        form_names: Vec<String>,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HtmlFormInfo {
    pub action: Option<String>,
    pub method: Option<String>,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DjangoModelField {
    pub name: String,
    pub field_type: String,
    #[serde(default)]
    pub max_length: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DjangoModel {
    pub name: String,
    #[serde(default)]
    pub bases: Vec<String>,
    #[serde(default)]
    pub django_fields: Vec<DjangoModelField>,
    #[serde(default)]
    pub meta_options: HashMap<String, serde_json::Value>,
}

/// `spec.md` §3 `ProjectStructureMap`: typed tree of per-file parsed
/// details, keyed by Django app name then file path. Read-only for the
/// core; rebuilt wholesale by external parsers between remediation passes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProjectStructureMap {
    #[serde(default)]
    pub apps: HashMap<String, HashMap<String, FileStructureInfo>>,
}

impl ProjectStructureMap {
    pub fn file_info(&self, app: &str, path: &str) -> Option<&FileStructureInfo> {
        self.apps.get(app)?.get(path)
    }
}
