//! Submit-then-poll dispatch of workflow jobs.
//!
//! Per job the dispatcher walks `Built → Submitted → Polling` and ends in
//! one of `Completed`, `Failed` or `TimedOut`. Submission never retries on
//! its own: a failed submit goes straight back to the orchestrator, which
//! leaves the queue message for redelivery.
//!
//! Polling uses a single backoff curve for transport errors and "not ready
//! yet" answers alike. From the outside a restarting backend and a busy one
//! look the same, and one curve keeps either from being hot-looped.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use relay_core::backoff::PollBackoff;
use relay_core::template::WorkflowTemplate;

use crate::api::{ComfyUIApi, ComfyUIApiError};
use crate::history::{interpret_history, output_images, HistoryStatus, OutputImage};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Lifecycle of a dispatched job, used for structured logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Built,
    Submitted,
    Polling,
    Completed,
    Failed,
    TimedOut,
}

impl JobPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Built => "built",
            Self::Submitted => "submitted",
            Self::Polling => "polling",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

/// Handle to a prompt accepted by the backend.
#[derive(Debug, Clone)]
pub struct JobHandle {
    /// Backend-assigned prompt identifier.
    pub prompt_id: String,
    /// Client id sent with the submission.
    pub client_id: String,
    pub submitted_at: Instant,
}

/// A completed and structurally validated run.
#[derive(Debug, Clone)]
pub struct Outputs {
    pub prompt_id: String,
    /// The raw `outputs` object, persisted verbatim.
    pub raw: serde_json::Value,
    /// Images of the output node; never empty.
    pub images: Vec<OutputImage>,
    /// History polls it took to observe completion.
    pub attempts: u32,
}

impl Outputs {
    /// The artifact to publish.
    pub fn primary_image(&self) -> &OutputImage {
        &self.images[0]
    }
}

/// Ephemeral per-job poll bookkeeping; dropped once the job resolves.
#[derive(Debug, Clone)]
pub struct PollState {
    pub prompt_id: String,
    pub started_at: Instant,
    pub attempt: u32,
    pub current_delay: Duration,
}

impl PollState {
    fn new(prompt_id: &str, backoff: &PollBackoff) -> Self {
        Self {
            prompt_id: prompt_id.to_string(),
            started_at: Instant::now(),
            attempt: 0,
            current_delay: backoff.initial_delay.min(backoff.max_delay),
        }
    }
}

/// Failures of a single dispatch.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// `POST /prompt` failed at the transport or HTTP level.
    #[error("Workflow submission failed: {0}")]
    Submit(#[source] ComfyUIApiError),

    /// The backend accepted the request but returned no `prompt_id`.
    #[error("Submission response carried no prompt_id (node_errors: {node_errors})")]
    MissingPromptId { node_errors: serde_json::Value },

    /// The run finished but the history entry is not usable.
    #[error("Malformed completion for prompt {prompt_id}: {reason}")]
    MalformedResponse { prompt_id: String, reason: String },

    /// ComfyUI reported an execution error.
    #[error("Execution of prompt {prompt_id} failed: {message}")]
    ExecutionFailed { prompt_id: String, message: String },

    /// The poll budget ran out.
    #[error("Prompt {prompt_id} did not complete after {attempts} polls")]
    Timeout { prompt_id: String, attempts: u32 },
}

impl DispatchError {
    /// Terminal phase this error leaves the job in.
    pub fn phase(&self) -> JobPhase {
        match self {
            Self::Submit(_) | Self::MissingPromptId { .. } => JobPhase::Built,
            Self::MalformedResponse { .. } | Self::ExecutionFailed { .. } => JobPhase::Failed,
            Self::Timeout { .. } => JobPhase::TimedOut,
        }
    }
}

// ---------------------------------------------------------------------------
// Backend seam
// ---------------------------------------------------------------------------

/// A generation backend with a submit-then-poll interface.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Queue a workflow on the backend.
    async fn submit(&self, workflow: &WorkflowTemplate) -> Result<JobHandle, DispatchError>;

    /// Wait for a submitted job to finish and return its validated outputs.
    ///
    /// `output_node` names the node whose images are the artifact; `None`
    /// accepts the first node reporting images.
    async fn await_completion(
        &self,
        handle: &JobHandle,
        output_node: Option<&str>,
    ) -> Result<Outputs, DispatchError>;
}

// ---------------------------------------------------------------------------
// ComfyUI implementation
// ---------------------------------------------------------------------------

/// [`GenerationBackend`] backed by a local ComfyUI instance.
pub struct ComfyUIDispatcher {
    api: ComfyUIApi,
    backoff: PollBackoff,
}

impl ComfyUIDispatcher {
    pub fn new(api: ComfyUIApi) -> Self {
        Self::with_backoff(api, PollBackoff::default())
    }

    pub fn with_backoff(api: ComfyUIApi, backoff: PollBackoff) -> Self {
        Self { api, backoff }
    }

    pub fn api(&self) -> &ComfyUIApi {
        &self.api
    }
}

#[async_trait]
impl GenerationBackend for ComfyUIDispatcher {
    async fn submit(&self, workflow: &WorkflowTemplate) -> Result<JobHandle, DispatchError> {
        let client_id = uuid::Uuid::new_v4().to_string();

        let response = self
            .api
            .submit_workflow(workflow, &client_id)
            .await
            .map_err(DispatchError::Submit)?;

        let Some(prompt_id) = response.prompt_id.filter(|id| !id.is_empty()) else {
            return Err(DispatchError::MissingPromptId {
                node_errors: response.node_errors,
            });
        };

        tracing::info!(
            prompt_id = %prompt_id,
            queue_position = response.number,
            phase = JobPhase::Submitted.as_str(),
            "Workflow submitted to ComfyUI",
        );

        Ok(JobHandle {
            prompt_id,
            client_id,
            submitted_at: Instant::now(),
        })
    }

    async fn await_completion(
        &self,
        handle: &JobHandle,
        output_node: Option<&str>,
    ) -> Result<Outputs, DispatchError> {
        let mut state = PollState::new(&handle.prompt_id, &self.backoff);

        loop {
            state.attempt += 1;

            match self.api.get_history(&state.prompt_id).await {
                Ok(body) => match interpret_history(&state.prompt_id, &body) {
                    Ok(HistoryStatus::Pending) => {
                        tracing::debug!(
                            prompt_id = %state.prompt_id,
                            attempt = state.attempt,
                            phase = JobPhase::Polling.as_str(),
                            "Prompt not finished yet",
                        );
                    }
                    Ok(HistoryStatus::Completed { outputs }) => {
                        let images = output_images(&outputs, output_node).map_err(|reason| {
                            DispatchError::MalformedResponse {
                                prompt_id: state.prompt_id.clone(),
                                reason,
                            }
                        })?;

                        tracing::info!(
                            prompt_id = %state.prompt_id,
                            attempts = state.attempt,
                            elapsed_ms = state.started_at.elapsed().as_millis() as u64,
                            images = images.len(),
                            phase = JobPhase::Completed.as_str(),
                            "Prompt completed",
                        );

                        return Ok(Outputs {
                            prompt_id: state.prompt_id,
                            raw: outputs,
                            images,
                            attempts: state.attempt,
                        });
                    }
                    Ok(HistoryStatus::Failed { message }) => {
                        return Err(DispatchError::ExecutionFailed {
                            prompt_id: state.prompt_id,
                            message,
                        });
                    }
                    Err(reason) => {
                        return Err(DispatchError::MalformedResponse {
                            prompt_id: state.prompt_id,
                            reason,
                        });
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        prompt_id = %state.prompt_id,
                        attempt = state.attempt,
                        error = %e,
                        "History poll failed",
                    );
                }
            }

            if state.attempt >= self.backoff.max_attempts {
                tracing::warn!(
                    prompt_id = %state.prompt_id,
                    attempts = state.attempt,
                    phase = JobPhase::TimedOut.as_str(),
                    "Giving up on prompt",
                );
                return Err(DispatchError::Timeout {
                    prompt_id: state.prompt_id,
                    attempts: state.attempt,
                });
            }

            tokio::time::sleep(state.current_delay).await;
            state.current_delay = self.backoff.next_delay(state.current_delay);
        }
    }
}
