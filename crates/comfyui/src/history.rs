//! Interpretation of ComfyUI `/history/{prompt_id}` responses.
//!
//! ComfyUI answers `{}` while a prompt is queued or running. Once the run
//! finishes the body is keyed by prompt id:
//!
//! ```json
//! {"<prompt_id>": {
//!     "outputs": {"9": {"images": [{"filename": "relay_00001_.png", "subfolder": "", "type": "output"}]}},
//!     "status": {"status_str": "success", "completed": true, "messages": [...]}
//! }}
//! ```

use serde::Deserialize;
use serde_json::Value;

/// What a single history poll says about a prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryStatus {
    /// Empty body: still queued or executing.
    Pending,
    /// The run finished; carries the raw `outputs` object.
    Completed { outputs: Value },
    /// ComfyUI recorded an execution error.
    Failed { message: String },
}

/// A file produced by an output node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OutputImage {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// ComfyUI storage class (`output`, `temp`, ...).
    #[serde(rename = "type", default = "default_image_type")]
    pub kind: String,
}

fn default_image_type() -> String {
    "output".to_string()
}

impl OutputImage {
    /// Path of the file relative to the ComfyUI output directory.
    pub fn relative_path(&self) -> std::path::PathBuf {
        let mut path = std::path::PathBuf::new();
        if !self.subfolder.is_empty() {
            path.push(&self.subfolder);
        }
        path.push(&self.filename);
        path
    }
}

/// Classify a history body. `Err` carries a reason for structurally
/// invalid bodies.
pub fn interpret_history(prompt_id: &str, body: &Value) -> Result<HistoryStatus, String> {
    let Some(entries) = body.as_object() else {
        return Err("history body is not a JSON object".to_string());
    };
    if entries.is_empty() {
        return Ok(HistoryStatus::Pending);
    }

    let entry = entries
        .get(prompt_id)
        .ok_or_else(|| format!("history has no entry for prompt {prompt_id}"))?;

    let status_str = entry
        .pointer("/status/status_str")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if status_str == "error" {
        return Ok(HistoryStatus::Failed {
            message: execution_error_message(entry)
                .unwrap_or_else(|| "execution failed without a message".to_string()),
        });
    }

    match entry.get("outputs") {
        Some(outputs @ Value::Object(_)) => Ok(HistoryStatus::Completed {
            outputs: outputs.clone(),
        }),
        Some(_) => Err("history entry 'outputs' is not an object".to_string()),
        None => Err("history entry has no 'outputs'".to_string()),
    }
}

/// Images reported by the output node.
///
/// With `output_node` set, that node must exist and list at least one
/// image. Without it, the first node (in id order) with a non-empty
/// `images` list wins.
pub fn output_images(outputs: &Value, output_node: Option<&str>) -> Result<Vec<OutputImage>, String> {
    let Some(nodes) = outputs.as_object() else {
        return Err("outputs is not a JSON object".to_string());
    };

    let images = match output_node {
        Some(node_id) => {
            let node = nodes
                .get(node_id)
                .ok_or_else(|| format!("output node {node_id} missing from outputs"))?;
            parse_images(node).ok_or_else(|| format!("output node {node_id} has no images"))?
        }
        None => {
            let mut ids: Vec<&String> = nodes.keys().collect();
            ids.sort();
            ids.into_iter()
                .find_map(|id| parse_images(&nodes[id.as_str()]))
                .ok_or_else(|| "no output node reported images".to_string())?
        }
    };

    Ok(images)
}

fn parse_images(node: &Value) -> Option<Vec<OutputImage>> {
    let images: Vec<OutputImage> = serde_json::from_value(node.get("images")?.clone()).ok()?;
    (!images.is_empty()).then_some(images)
}

/// Pull `exception_message` out of the `execution_error` status message.
fn execution_error_message(entry: &Value) -> Option<String> {
    entry
        .pointer("/status/messages")?
        .as_array()?
        .iter()
        .filter_map(Value::as_array)
        .find(|msg| msg.first().and_then(Value::as_str) == Some("execution_error"))
        .and_then(|msg| msg.get(1))
        .and_then(|data| data.get("exception_message"))
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
}
