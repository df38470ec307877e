//! Declarative placement of job fields into backend workflow templates.
//!
//! A [`WorkflowTemplate`] is a ComfyUI API-format graph: node id → node
//! definition with an `inputs` object. A [`FieldMapping`] says which node
//! inputs receive each logical job field, so a new model only needs a new
//! template file and mapping file.
//!
//! Placement never fails. A target that cannot be honored (unknown node,
//! node without `inputs`, value unavailable) is skipped and logged so the
//! remaining fields still land.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::job::{
    JobRequest, DEFAULT_CFG, DEFAULT_DIMENSION, DEFAULT_NEGATIVE_PROMPT, DEFAULT_STEPS,
};
use crate::types::Seed;

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

/// A backend-specific job graph keyed by node id.
///
/// Loaded templates are never mutated; [`apply_mapping`] always works on a
/// copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowTemplate(Map<String, Value>);

impl WorkflowTemplate {
    /// Wrap a parsed JSON value, which must be an object of nodes.
    pub fn from_value(value: Value) -> Result<Self, String> {
        match value {
            Value::Object(nodes) => Ok(Self(nodes)),
            other => Err(format!(
                "workflow template must be a JSON object, got {}",
                json_kind(&other)
            )),
        }
    }

    /// Look up a node definition by id.
    pub fn node(&self, node_id: &str) -> Option<&Value> {
        self.0.get(node_id)
    }

    /// Read a single node input, if both the node and the input exist.
    pub fn input(&self, node_id: &str, input_name: &str) -> Option<&Value> {
        self.0.get(node_id)?.get("inputs")?.get(input_name)
    }

    /// Number of nodes in the graph.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The template as a plain JSON value (the backend submission body).
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    fn inputs_mut(&mut self, node_id: &str) -> Result<&mut Map<String, Value>, SkipReason> {
        let node = self.0.get_mut(node_id).ok_or(SkipReason::UnknownNode)?;
        node.get_mut("inputs")
            .and_then(Value::as_object_mut)
            .ok_or(SkipReason::NodeWithoutInputs)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ---------------------------------------------------------------------------
// Mappings
// ---------------------------------------------------------------------------

/// Logical job fields a mapping can place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LogicalField {
    #[serde(rename = "prompt")]
    Prompt,
    #[serde(rename = "negativePrompt")]
    NegativePrompt,
    #[serde(rename = "width")]
    Width,
    #[serde(rename = "height")]
    Height,
    #[serde(rename = "steps")]
    Steps,
    #[serde(rename = "seed")]
    Seed,
    #[serde(rename = "cfg")]
    Cfg,
    #[serde(rename = "batch_size")]
    BatchSize,
}

impl LogicalField {
    /// Name as it appears in mapping files and log lines.
    pub fn name(self) -> &'static str {
        match self {
            Self::Prompt => "prompt",
            Self::NegativePrompt => "negativePrompt",
            Self::Width => "width",
            Self::Height => "height",
            Self::Steps => "steps",
            Self::Seed => "seed",
            Self::Cfg => "cfg",
            Self::BatchSize => "batch_size",
        }
    }

    /// The value the job message carried for this field. The seed is always
    /// present because the relay resolves it before placement; `batch_size`
    /// is never carried by a request.
    fn value_from(self, job: &JobRequest, seed: Seed) -> Option<Value> {
        match self {
            Self::Prompt => Some(Value::from(job.prompt.as_str())),
            Self::NegativePrompt => job.negative_prompt.as_deref().map(Value::from),
            Self::Width => job.width.map(Value::from),
            Self::Height => job.height.map(Value::from),
            Self::Steps => job.steps.map(Value::from),
            Self::Seed => Some(Value::from(seed)),
            Self::Cfg => job.cfg.map(Value::from),
            Self::BatchSize => None,
        }
    }

    /// Relay-wide default, used when neither the job nor the mapping target
    /// supplies a value.
    fn fallback(self) -> Option<Value> {
        match self {
            Self::NegativePrompt => Some(Value::from(DEFAULT_NEGATIVE_PROMPT)),
            Self::Width | Self::Height => Some(Value::from(DEFAULT_DIMENSION)),
            Self::Steps => Some(Value::from(DEFAULT_STEPS)),
            Self::Cfg => Some(Value::from(DEFAULT_CFG)),
            Self::Prompt | Self::Seed | Self::BatchSize => None,
        }
    }
}

/// One placement target inside a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingTarget {
    #[serde(alias = "node_id")]
    pub node: String,
    #[serde(alias = "input_name")]
    pub input: String,
    /// Optional targets only overwrite inputs the template already has.
    #[serde(default)]
    pub optional: bool,
    /// Value used when the job does not supply the field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// A mapping entry may name a single target or several.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MappingEntry {
    One(MappingTarget),
    Many(Vec<MappingTarget>),
}

impl MappingEntry {
    pub fn targets(&self) -> &[MappingTarget] {
        match self {
            Self::One(target) => std::slice::from_ref(target),
            Self::Many(targets) => targets,
        }
    }
}

/// Rules binding logical job fields to template node inputs, plus the node
/// whose outputs carry the generated artifact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Node whose `images` output is published. When absent, the first node
    /// reporting images is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_node: Option<String>,
    /// `null` entries are allowed and mean "not mapped".
    #[serde(default)]
    pub fields: BTreeMap<LogicalField, Option<MappingEntry>>,
}

impl FieldMapping {
    /// Every node id referenced by a mapping target.
    pub fn referenced_nodes(&self) -> impl Iterator<Item = &str> {
        self.fields
            .values()
            .flatten()
            .flat_map(|entry| entry.targets())
            .map(|target| target.node.as_str())
    }
}

// ---------------------------------------------------------------------------
// Application
// ---------------------------------------------------------------------------

/// Why a target was not written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SkipReason {
    UnknownNode,
    NodeWithoutInputs,
}

/// Draw a fresh seed for `0`, otherwise pass the requested seed through.
pub fn resolve_seed(requested: Seed) -> Seed {
    if requested == crate::job::RANDOM_SEED {
        rand::random::<u64>()
    } else {
        requested
    }
}

/// Produce a job body from `template` with the job's fields placed per
/// `mapping`. Returns the mutated copy and the seed that was used.
pub fn apply_mapping(
    template: &WorkflowTemplate,
    job: &JobRequest,
    mapping: &FieldMapping,
) -> (WorkflowTemplate, Seed) {
    let seed = resolve_seed(job.seed());
    (apply_mapping_with_seed(template, job, mapping, seed), seed)
}

/// [`apply_mapping`] with an already resolved seed.
pub fn apply_mapping_with_seed(
    template: &WorkflowTemplate,
    job: &JobRequest,
    mapping: &FieldMapping,
    seed: Seed,
) -> WorkflowTemplate {
    let mut working = template.clone();

    for (field, entry) in &mapping.fields {
        let Some(entry) = entry else { continue };
        let job_value = field.value_from(job, seed);

        for target in entry.targets() {
            let Some(value) = job_value
                .clone()
                .or_else(|| target.default.clone())
                .or_else(|| field.fallback())
            else {
                if !target.optional {
                    tracing::warn!(
                        job_id = %job.id,
                        field = field.name(),
                        node = %target.node,
                        input = %target.input,
                        "No value or default for required mapping target, skipping",
                    );
                }
                continue;
            };

            let inputs = match working.inputs_mut(&target.node) {
                Ok(inputs) => inputs,
                Err(reason) => {
                    tracing::warn!(
                        job_id = %job.id,
                        field = field.name(),
                        node = %target.node,
                        input = %target.input,
                        ?reason,
                        "Mapping target not present in template, skipping",
                    );
                    continue;
                }
            };

            if target.optional && !inputs.contains_key(&target.input) {
                tracing::debug!(
                    job_id = %job.id,
                    field = field.name(),
                    node = %target.node,
                    input = %target.input,
                    "Optional input slot absent, skipping",
                );
                continue;
            }

            inputs.insert(target.input.clone(), value);
        }
    }

    working
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
