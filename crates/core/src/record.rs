//! Normalized metadata record and blob key layout for finished jobs.
//!
//! Every key is derived from the job id alone, so re-running a job after a
//! redelivery overwrites the same objects instead of creating new ones.

use serde::{Deserialize, Serialize};

use crate::job::JobRequest;
use crate::types::{Seed, Timestamp};

/// Status written into records for jobs that produced an artifact.
pub const STATUS_COMPLETED: &str = "completed";

/// Extension used when the backend output file has none.
pub const DEFAULT_ARTIFACT_EXTENSION: &str = "png";

// ---------------------------------------------------------------------------
// Blob keys
// ---------------------------------------------------------------------------

/// Raw backend outputs.
pub fn output_key(job_id: &str) -> String {
    format!("{job_id}_output.json")
}

/// The generated artifact.
pub fn artifact_key(job_id: &str, extension: &str) -> String {
    format!("{job_id}.{extension}")
}

/// Normalized metadata record.
pub fn final_record_key(job_id: &str) -> String {
    format!("{job_id}_final.json")
}

/// The original request record written by the producer.
pub fn request_key(job_id: &str) -> String {
    format!("{job_id}.json")
}

/// Lower-cased extension of a backend output filename.
pub fn artifact_extension(filename: &str) -> String {
    std::path::Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| DEFAULT_ARTIFACT_EXTENSION.to_string())
}

/// MIME type for an artifact extension.
pub fn content_type_for(extension: &str) -> &'static str {
    match extension {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

// ---------------------------------------------------------------------------
// JobRecord
// ---------------------------------------------------------------------------

/// Metadata persisted as `{id}_final.json` once the artifact is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    pub prompt: String,
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub cfg: f64,
    /// The seed the sampler actually used.
    pub seed: Seed,
    pub model: String,
    pub artifact_key: String,
    pub prompt_id: String,
    pub elapsed_secs: f64,
    pub status: String,
    pub completed_at: Timestamp,
    /// Pixel dimensions read from the artifact header, when decodable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_height: Option<u32>,
}

impl JobRecord {
    /// Build a completed record for `job`.
    pub fn completed(
        job: &JobRequest,
        seed: Seed,
        artifact_key: String,
        prompt_id: String,
        elapsed: std::time::Duration,
        completed_at: Timestamp,
    ) -> Self {
        Self {
            id: job.id.clone(),
            prompt: job.prompt.clone(),
            negative_prompt: job.negative_prompt().to_string(),
            width: job.width(),
            height: job.height(),
            steps: job.steps(),
            cfg: job.cfg(),
            seed,
            model: job.model().to_string(),
            artifact_key,
            prompt_id,
            elapsed_secs: elapsed.as_secs_f64(),
            status: STATUS_COMPLETED.to_string(),
            completed_at,
            artifact_width: None,
            artifact_height: None,
        }
    }

    /// Attach the decoded artifact dimensions.
    pub fn with_artifact_dimensions(mut self, (width, height): (u32, u32)) -> Self {
        self.artifact_width = Some(width);
        self.artifact_height = Some(height);
        self
    }
}

/// Write `seed` into a stored request record, preserving every other field.
///
/// Returns `None` when the record is not a JSON object.
pub fn patch_request_seed(record: &[u8], seed: Seed) -> Option<Vec<u8>> {
    let mut value: serde_json::Value = serde_json::from_slice(record).ok()?;
    value
        .as_object_mut()?
        .insert("seed".to_string(), serde_json::Value::from(seed));
    serde_json::to_vec(&value).ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;

    use super::*;

    #[test]
    fn keys_derive_from_job_id() {
        assert_eq!(output_key("abc"), "abc_output.json");
        assert_eq!(artifact_key("abc", "png"), "abc.png");
        assert_eq!(final_record_key("abc"), "abc_final.json");
        assert_eq!(request_key("abc"), "abc.json");
    }

    #[test]
    fn extension_is_lowercased_with_png_fallback() {
        assert_eq!(artifact_extension("ComfyUI_00001_.PNG"), "png");
        assert_eq!(artifact_extension("clip.webp"), "webp");
        assert_eq!(artifact_extension("no_extension"), "png");
    }

    #[test]
    fn content_types() {
        assert_eq!(content_type_for("png"), "image/png");
        assert_eq!(content_type_for("jpeg"), "image/jpeg");
        assert_eq!(content_type_for("bin"), "application/octet-stream");
    }

    #[test]
    fn record_serializes_camel_case() {
        let job = JobRequest::from_message(r#"{"id":"abc","prompt":"a cat"}"#).unwrap();
        let at = chrono::Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        let record = JobRecord::completed(
            &job,
            99,
            "abc.png".into(),
            "p-1".into(),
            Duration::from_millis(2500),
            at,
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["seed"], 99);
        assert_eq!(json["artifactKey"], "abc.png");
        assert_eq!(json["negativePrompt"], crate::job::DEFAULT_NEGATIVE_PROMPT);
        assert_eq!(json["elapsedSecs"], 2.5);
        assert_eq!(json["status"], "completed");
        assert_eq!(json["completedAt"], "2025-01-02T03:04:05Z");
        assert!(json.get("artifactWidth").is_none());
    }

    #[test]
    fn patch_keeps_other_fields() {
        let original = br#"{"id":"abc","prompt":"a cat","seed":0,"width":512}"#;
        let patched = patch_request_seed(original, 1234).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&patched).unwrap();
        assert_eq!(value["seed"], 1234);
        assert_eq!(value["prompt"], "a cat");
        assert_eq!(value["width"], 512);
    }

    #[test]
    fn patch_rejects_non_objects() {
        assert!(patch_request_seed(b"[1,2]", 5).is_none());
        assert!(patch_request_seed(b"not json", 5).is_none());
    }
}
