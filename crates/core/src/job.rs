//! Generation job requests as they arrive on the queue.
//!
//! A queue message body is a JSON object such as
//! `{"id": "abc", "prompt": "a cat", "seed": 0, "model": "hidream"}`.
//! Everything except `id` and `prompt` is optional and falls back to the
//! defaults below. Unknown fields are ignored so producers can add
//! bookkeeping without breaking the relay.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::Seed;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Negative prompt used when the request does not carry one.
pub const DEFAULT_NEGATIVE_PROMPT: &str =
    "blurry, low quality, distorted, ugly, bad anatomy, deformed, poorly drawn";

/// Default image edge length in pixels.
pub const DEFAULT_DIMENSION: u32 = 512;

/// Default number of sampler steps.
pub const DEFAULT_STEPS: u32 = 50;

/// Default classifier-free guidance scale.
pub const DEFAULT_CFG: f64 = 5.0;

/// Template key used when the request does not name a model.
pub const DEFAULT_MODEL: &str = "hidream";

/// Sentinel seed asking the relay to draw a random one.
pub const RANDOM_SEED: Seed = 0;

// ---------------------------------------------------------------------------
// JobRequest
// ---------------------------------------------------------------------------

/// One unit of generation work, parsed from a queue message body.
///
/// Optional fields keep whether the producer sent them (`null` counts as
/// not sent), so a model's mapping defaults can take precedence over the
/// relay-wide defaults. The accessors apply the relay-wide defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub id: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<Seed>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cfg: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl JobRequest {
    /// Parse and validate a raw queue message body.
    pub fn from_message(body: &str) -> Result<Self, CoreError> {
        let job: Self = serde_json::from_str(body)
            .map_err(|e| CoreError::InvalidJob(format!("unparseable message body: {e}")))?;
        job.validate()?;
        Ok(job)
    }

    pub fn negative_prompt(&self) -> &str {
        self.negative_prompt.as_deref().unwrap_or(DEFAULT_NEGATIVE_PROMPT)
    }

    pub fn width(&self) -> u32 {
        self.width.unwrap_or(DEFAULT_DIMENSION)
    }

    pub fn height(&self) -> u32 {
        self.height.unwrap_or(DEFAULT_DIMENSION)
    }

    pub fn steps(&self) -> u32 {
        self.steps.unwrap_or(DEFAULT_STEPS)
    }

    /// Requested seed; [`RANDOM_SEED`] when absent.
    pub fn seed(&self) -> Seed {
        self.seed.unwrap_or(RANDOM_SEED)
    }

    pub fn cfg(&self) -> f64 {
        self.cfg.unwrap_or(DEFAULT_CFG)
    }

    /// Template key for this job.
    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    /// Whether the relay must draw the seed for this job.
    pub fn wants_random_seed(&self) -> bool {
        self.seed() == RANDOM_SEED
    }

    fn validate(&self) -> Result<(), CoreError> {
        if self.id.trim().is_empty() {
            return Err(CoreError::InvalidJob("id must not be empty".into()));
        }
        if self.width == Some(0) || self.height == Some(0) {
            return Err(CoreError::InvalidJob(format!(
                "dimensions must be positive, got {}x{}",
                self.width(),
                self.height()
            )));
        }
        if self.steps == Some(0) {
            return Err(CoreError::InvalidJob("steps must be positive".into()));
        }
        if !self.cfg().is_finite() {
            return Err(CoreError::InvalidJob("cfg must be a finite number".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
