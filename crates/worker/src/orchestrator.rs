//! The dispatch loop.
//!
//! Each cycle takes at most one message from the fast queue, then at most
//! one from the slow queue, and pushes each through
//! parse → template → submit → poll → publish → delete. A message is
//! deleted only when every step before deletion succeeded; on any other
//! path it stays in the queue and redelivery is the retry.
//!
//! The idle interval between cycles doubles (once per cycle) when a
//! transient step fails and returns to base after a cycle in which work
//! was done and nothing was left behind.

use std::sync::Arc;
use std::time::{Duration, Instant};

use relay_cloud::publisher::PublishError;
use relay_cloud::queue::QueueError;
use relay_cloud::{JobQueue, QueueKind, QueueMessage, ResultPublisher};
use relay_comfyui::{DispatchError, GenerationBackend};
use relay_core::backoff::AdaptivePollInterval;
use relay_core::catalog::TemplateCatalog;
use relay_core::error::CoreError;
use relay_core::job::JobRequest;
use relay_core::template::apply_mapping;
use relay_core::types::Seed;
use tokio_util::sync::CancellationToken;

use crate::ingest::IngestionTrigger;

/// The ingestion trigger fires on every cycle number divisible by this.
pub const TRIGGER_EVERY: u64 = 10;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Pipeline step at which a message was left in its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Receive,
    Parse,
    Template,
    Dispatch,
    Publish,
    Delete,
}

impl PipelineStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Receive => "receive",
            Self::Parse => "parse",
            Self::Template => "template",
            Self::Dispatch => "dispatch",
            Self::Publish => "publish",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Receive(QueueError),

    /// The message body is not a valid job request.
    #[error(transparent)]
    InvalidMessage(CoreError),

    /// Unknown model or unusable template/mapping files.
    #[error(transparent)]
    Configuration(CoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Delete(QueueError),
}

impl PipelineError {
    pub fn stage(&self) -> PipelineStage {
        match self {
            Self::Receive(_) => PipelineStage::Receive,
            Self::InvalidMessage(_) => PipelineStage::Parse,
            Self::Configuration(_) => PipelineStage::Template,
            Self::Dispatch(_) => PipelineStage::Dispatch,
            Self::Publish(_) => PipelineStage::Publish,
            Self::Delete(_) => PipelineStage::Delete,
        }
    }

    /// Whether this failure grows the idle interval. Bad messages and bad
    /// configuration do not get better by waiting longer.
    pub fn escalates(&self) -> bool {
        !matches!(self, Self::InvalidMessage(_) | Self::Configuration(_))
    }
}

/// What happened on one queue during a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueOutcome {
    /// No message was available.
    Empty,
    /// Published and deleted.
    Completed { job_id: String, seed: Seed },
    /// Left in the queue for redelivery.
    Left {
        job_id: Option<String>,
        stage: PipelineStage,
        escalates: bool,
    },
}

/// Summary of one dispatch cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle: u64,
    pub outcomes: Vec<(QueueKind, QueueOutcome)>,
    /// Idle interval to sleep before the next cycle.
    pub interval: Duration,
    /// Whether the ingestion trigger was invoked (regardless of result).
    pub triggered: bool,
}

impl CycleReport {
    pub fn outcome(&self, queue: QueueKind) -> Option<&QueueOutcome> {
        self.outcomes
            .iter()
            .find(|(kind, _)| *kind == queue)
            .map(|(_, outcome)| outcome)
    }

    pub fn completed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, QueueOutcome::Completed { .. }))
            .count()
    }

    pub fn left(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, QueueOutcome::Left { .. }))
            .count()
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

/// Drives jobs from the queues through the backend into storage.
pub struct QueueConsumer {
    queue: Arc<dyn JobQueue>,
    catalog: TemplateCatalog,
    backend: Arc<dyn GenerationBackend>,
    publisher: ResultPublisher,
    trigger: Option<Arc<dyn IngestionTrigger>>,
    interval: AdaptivePollInterval,
    cycle: u64,
}

impl QueueConsumer {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        catalog: TemplateCatalog,
        backend: Arc<dyn GenerationBackend>,
        publisher: ResultPublisher,
        base_interval: Duration,
    ) -> Self {
        Self {
            queue,
            catalog,
            backend,
            publisher,
            trigger: None,
            interval: AdaptivePollInterval::new(base_interval),
            cycle: 0,
        }
    }

    pub fn with_trigger(mut self, trigger: Arc<dyn IngestionTrigger>) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn interval(&self) -> &AdaptivePollInterval {
        &self.interval
    }

    /// Number of cycles run so far.
    pub fn cycles(&self) -> u64 {
        self.cycle
    }

    /// Run one dispatch cycle over both queues.
    pub async fn run_cycle(&mut self) -> CycleReport {
        self.cycle += 1;
        self.interval.begin_cycle();

        let mut outcomes = Vec::with_capacity(QueueKind::ALL.len());
        for kind in QueueKind::ALL {
            let outcome = self.process_queue(kind).await;
            if let QueueOutcome::Left { escalates: true, .. } = outcome {
                if self.interval.escalate() {
                    tracing::info!(
                        interval_ms = self.interval.current().as_millis() as u64,
                        "Idle interval increased",
                    );
                }
            }
            outcomes.push((kind, outcome));
        }

        let completed = outcomes
            .iter()
            .any(|(_, o)| matches!(o, QueueOutcome::Completed { .. }));
        let left = outcomes
            .iter()
            .any(|(_, o)| matches!(o, QueueOutcome::Left { .. }));
        if completed && !left {
            self.interval.reset();
        }

        let triggered = self.cycle % TRIGGER_EVERY == 0 && self.fire_trigger().await;

        CycleReport {
            cycle: self.cycle,
            outcomes,
            interval: self.interval.current(),
            triggered,
        }
    }

    /// Loop over [`run_cycle`](Self::run_cycle) until `cancel` fires.
    ///
    /// Cancellation is observed between cycles only. A job already in
    /// flight runs to its outcome, bounded by the backend and storage
    /// timeouts, so its message is acknowledged or left deliberately.
    pub async fn run(&mut self, cancel: CancellationToken) {
        tracing::info!(
            base_interval_ms = self.interval.base().as_millis() as u64,
            workflow_dir = %self.catalog.dir().display(),
            "Dispatch loop started",
        );

        while !cancel.is_cancelled() {
            let report = self.run_cycle().await;

            if report.completed() > 0 || report.left() > 0 {
                tracing::debug!(
                    cycle = report.cycle,
                    completed = report.completed(),
                    left = report.left(),
                    interval_ms = report.interval.as_millis() as u64,
                    "Cycle finished",
                );
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(report.interval) => {}
            }
        }

        tracing::info!(cycles = self.cycle, "Dispatch loop stopped");
    }

    // ---- private helpers ----

    async fn process_queue(&self, kind: QueueKind) -> QueueOutcome {
        let message = match self.queue.receive(kind).await {
            Ok(Some(message)) => message,
            Ok(None) => return QueueOutcome::Empty,
            Err(e) => return left(kind, None, PipelineError::Receive(e)),
        };

        let job = match JobRequest::from_message(&message.body) {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(
                    queue = kind.as_str(),
                    message_id = ?message.message_id,
                    body = %message.body,
                    "Unparseable job message",
                );
                return left(kind, None, PipelineError::InvalidMessage(e));
            }
        };

        tracing::info!(
            queue = kind.as_str(),
            job_id = %job.id,
            model = %job.model(),
            "Job received",
        );

        match self.execute(&job).await {
            Ok(seed) => self.acknowledge(&message, job, seed).await,
            Err(e) => left(kind, Some(job.id), e),
        }
    }

    /// Template, dispatch and publish one job. Returns the seed used.
    async fn execute(&self, job: &JobRequest) -> Result<Seed, PipelineError> {
        let started = Instant::now();

        let profile = self
            .catalog
            .resolve(job.model())
            .map_err(PipelineError::Configuration)?;
        let (workflow, seed) = apply_mapping(&profile.template, job, &profile.mapping);

        let handle = self.backend.submit(&workflow).await?;
        let outputs = self
            .backend
            .await_completion(&handle, profile.mapping.output_node.as_deref())
            .await?;

        self.publisher
            .publish(job, &outputs, seed, started.elapsed())
            .await?;
        Ok(seed)
    }

    async fn acknowledge(&self, message: &QueueMessage, job: JobRequest, seed: Seed) -> QueueOutcome {
        if let Err(e) = self.queue.delete(message).await {
            return left(message.queue, Some(job.id), PipelineError::Delete(e));
        }

        tracing::info!(queue = message.queue.as_str(), job_id = %job.id, seed, "Job completed");
        QueueOutcome::Completed { job_id: job.id, seed }
    }

    async fn fire_trigger(&self) -> bool {
        let Some(trigger) = &self.trigger else {
            return false;
        };

        if let Err(e) = trigger.trigger(self.cycle).await {
            tracing::warn!(cycle = self.cycle, error = %e, "Ingestion trigger failed");
        }
        true
    }
}

/// Log a failure and describe the message as left in its queue.
fn left(queue: QueueKind, job_id: Option<String>, error: PipelineError) -> QueueOutcome {
    let stage = error.stage();
    let escalates = error.escalates();

    if escalates {
        tracing::warn!(
            queue = queue.as_str(),
            job_id = job_id.as_deref().unwrap_or("-"),
            stage = stage.as_str(),
            error = %error,
            "Job left in queue",
        );
    } else {
        tracing::error!(
            queue = queue.as_str(),
            job_id = job_id.as_deref().unwrap_or("-"),
            stage = stage.as_str(),
            error = %error,
            "Job left in queue, not retrying sooner",
        );
    }

    QueueOutcome::Left {
        job_id,
        stage,
        escalates,
    }
}
