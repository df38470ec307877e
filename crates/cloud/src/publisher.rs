//! Ordered publication of a finished job.
//!
//! Steps, each gated on the previous one:
//!
//! 1. raw backend outputs → `{id}_output.json`
//! 2. artifact file → `{id}.{ext}`
//! 3. normalized [`JobRecord`] → `{id}_final.json`
//! 4. for relay-drawn seeds only, patch `seed` into `{id}.json`
//!
//! Steps 1–3 decide success. Step 4 is best effort: the record already
//! carries the seed, so a failed back-fill is logged and ignored.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use relay_comfyui::Outputs;
use relay_core::job::JobRequest;
use relay_core::record::{self, JobRecord};
use relay_core::types::Seed;

use crate::storage::{BlobStore, StorageError};

/// Step of the publication sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStage {
    Output,
    Artifact,
    Record,
    Reconcile,
}

impl PublishStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Output => "output",
            Self::Artifact => "artifact",
            Self::Record => "record",
            Self::Reconcile => "reconcile",
        }
    }
}

impl std::fmt::Display for PublishStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The backend reported a file that cannot be read locally.
    #[error("Cannot read artifact {path}: {source}")]
    ArtifactRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot encode {stage} document: {source}")]
    Encode {
        stage: PublishStage,
        #[source]
        source: serde_json::Error,
    },

    #[error("Storing {stage} failed: {source}")]
    Store {
        stage: PublishStage,
        #[source]
        source: StorageError,
    },
}

impl PublishError {
    pub fn stage(&self) -> PublishStage {
        match self {
            Self::ArtifactRead { .. } => PublishStage::Artifact,
            Self::Encode { stage, .. } | Self::Store { stage, .. } => *stage,
        }
    }
}

/// Keys written for a published job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub output_key: String,
    pub artifact_key: String,
    pub record_key: String,
    /// Whether `{id}.json` now carries the drawn seed.
    pub seed_reconciled: bool,
}

/// Writes job results to a [`BlobStore`].
pub struct ResultPublisher {
    store: Arc<dyn BlobStore>,
    output_dir: PathBuf,
}

impl ResultPublisher {
    /// `output_dir` is the ComfyUI output directory artifacts are read from.
    pub fn new(store: Arc<dyn BlobStore>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub async fn publish(
        &self,
        job: &JobRequest,
        outputs: &Outputs,
        seed: Seed,
        elapsed: Duration,
    ) -> Result<PublishReceipt, PublishError> {
        // 1. Raw outputs
        let output_key = record::output_key(&job.id);
        let raw = serde_json::to_vec_pretty(&outputs.raw).map_err(|source| PublishError::Encode {
            stage: PublishStage::Output,
            source,
        })?;
        self.put(PublishStage::Output, &output_key, raw, "application/json")
            .await?;

        // 2. Artifact
        let image = outputs.primary_image();
        let path = self.output_dir.join(image.relative_path());
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|source| PublishError::ArtifactRead {
                path: path.clone(),
                source,
            })?;
        let dimensions = image_dimensions(&bytes);
        let extension = record::artifact_extension(&image.filename);
        let artifact_key = record::artifact_key(&job.id, &extension);
        self.put(
            PublishStage::Artifact,
            &artifact_key,
            bytes,
            record::content_type_for(&extension),
        )
        .await?;

        // 3. Normalized record
        let record_key = record::final_record_key(&job.id);
        let mut job_record = JobRecord::completed(
            job,
            seed,
            artifact_key.clone(),
            outputs.prompt_id.clone(),
            elapsed,
            chrono::Utc::now(),
        );
        if let Some(dimensions) = dimensions {
            job_record = job_record.with_artifact_dimensions(dimensions);
        }
        let body = serde_json::to_vec_pretty(&job_record).map_err(|source| PublishError::Encode {
            stage: PublishStage::Record,
            source,
        })?;
        self.put(PublishStage::Record, &record_key, body, "application/json")
            .await?;

        // 4. Seed back-fill
        let seed_reconciled = job.wants_random_seed() && self.reconcile_seed(&job.id, seed).await;

        tracing::info!(
            job_id = %job.id,
            artifact_key = %artifact_key,
            seed,
            seed_reconciled,
            "Job results published",
        );

        Ok(PublishReceipt {
            output_key,
            artifact_key,
            record_key,
            seed_reconciled,
        })
    }

    async fn put(
        &self,
        stage: PublishStage,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), PublishError> {
        self.store
            .put(key, body, content_type)
            .await
            .map_err(|source| PublishError::Store { stage, source })
    }

    /// Patch the drawn seed into the producer's request record. Never fails
    /// the job; returns whether the record was updated.
    async fn reconcile_seed(&self, job_id: &str, seed: Seed) -> bool {
        let key = record::request_key(job_id);

        let existing = match self.store.get(&key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                tracing::warn!(job_id, key = %key, "Request record missing, seed not back-filled");
                return false;
            }
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Cannot read request record, seed not back-filled");
                return false;
            }
        };

        let Some(patched) = record::patch_request_seed(&existing, seed) else {
            tracing::warn!(job_id, key = %key, "Request record is not a JSON object, seed not back-filled");
            return false;
        };

        match self.store.put(&key, patched, "application/json").await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    job_id,
                    stage = PublishStage::Reconcile.as_str(),
                    error = %e,
                    "Seed back-fill failed",
                );
                false
            }
        }
    }
}

/// Width and height from the image header, if the format is recognized.
fn image_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}
