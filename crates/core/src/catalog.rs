//! On-disk strategy table of generation models.
//!
//! Each model is a pair of files in the workflow directory:
//!
//! - `{model}.json`: the ComfyUI API-format workflow template.
//! - `{model}.mapping.json`: the [`FieldMapping`] for that template.
//!
//! Files are read on every lookup so an operator can fix a broken template
//! while the relay keeps running; jobs for that model simply stay queued
//! until the files are valid.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::error::CoreError;
use crate::template::{FieldMapping, WorkflowTemplate};

/// Suffix of mapping descriptor files.
pub const MAPPING_SUFFIX: &str = ".mapping.json";

/// Suffix of workflow template files.
pub const TEMPLATE_SUFFIX: &str = ".json";

/// Model keys double as file stems, so keep them to a safe alphabet.
static MODEL_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("valid regex"));

/// A template together with the mapping that drives it.
#[derive(Debug, Clone)]
pub struct ModelProfile {
    pub model: String,
    pub template: WorkflowTemplate,
    pub mapping: FieldMapping,
}

impl ModelProfile {
    /// Mapping targets whose node is missing from the template.
    ///
    /// These degrade to no-ops at apply time; surfacing them up front makes
    /// a stale mapping visible in the logs.
    pub fn dangling_nodes(&self) -> Vec<String> {
        let mut missing: Vec<String> = self
            .mapping
            .referenced_nodes()
            .filter(|node| self.template.node(node).is_none())
            .map(str::to_string)
            .collect();
        missing.sort();
        missing.dedup();
        missing
    }
}

/// Resolves model keys to [`ModelProfile`]s from a directory.
#[derive(Debug, Clone)]
pub struct TemplateCatalog {
    dir: PathBuf,
}

impl TemplateCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load the template and mapping for `model`.
    pub fn resolve(&self, model: &str) -> Result<ModelProfile, CoreError> {
        if !MODEL_NAME_RE.is_match(model) {
            return Err(CoreError::UnknownModel(model.to_string()));
        }

        let template_path = self.dir.join(format!("{model}{TEMPLATE_SUFFIX}"));
        let mapping_path = self.dir.join(format!("{model}{MAPPING_SUFFIX}"));

        if !template_path.is_file() && !mapping_path.is_file() {
            return Err(CoreError::UnknownModel(model.to_string()));
        }

        let template_json = read_json(&template_path)?;
        let template = WorkflowTemplate::from_value(template_json).map_err(|reason| {
            CoreError::TemplateFormat {
                path: template_path.clone(),
                reason,
            }
        })?;

        let mapping: FieldMapping =
            serde_json::from_value(read_json(&mapping_path)?).map_err(|e| {
                CoreError::TemplateFormat {
                    path: mapping_path.clone(),
                    reason: e.to_string(),
                }
            })?;

        let profile = ModelProfile {
            model: model.to_string(),
            template,
            mapping,
        };

        let dangling = profile.dangling_nodes();
        if !dangling.is_empty() {
            tracing::warn!(
                model,
                nodes = ?dangling,
                "Mapping references nodes missing from the template",
            );
        }

        Ok(profile)
    }

    /// Model keys that have a mapping file in the directory, sorted.
    pub fn models(&self) -> Result<Vec<String>, CoreError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|source| CoreError::TemplateIo {
            path: self.dir.clone(),
            source,
        })?;

        let mut models: Vec<String> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                let model = name.strip_suffix(MAPPING_SUFFIX)?;
                MODEL_NAME_RE.is_match(model).then(|| model.to_string())
            })
            .collect();
        models.sort();
        Ok(models)
    }
}

fn read_json(path: &Path) -> Result<serde_json::Value, CoreError> {
    let raw = std::fs::read_to_string(path).map_err(|source| CoreError::TemplateIo {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|e| CoreError::TemplateFormat {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
