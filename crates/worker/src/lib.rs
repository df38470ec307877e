//! Queue-driven ComfyUI worker.
//!
//! Wires the lease, queues, template catalog, backend dispatcher and result
//! publisher into the [`orchestrator::QueueConsumer`] loop.

pub mod cli;
pub mod config;
pub mod ingest;
pub mod orchestrator;

pub use config::{ConfigError, WorkerConfig};
pub use ingest::{HttpIngestionTrigger, IngestionTrigger, TriggerError};
pub use orchestrator::{CycleReport, PipelineError, PipelineStage, QueueConsumer, QueueOutcome};
