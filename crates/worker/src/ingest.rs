//! Downstream ingestion trigger.
//!
//! Every tenth dispatch cycle the worker nudges the system that indexes
//! published results. The nudge is fire-and-forget: its outcome is logged
//! and never affects message acknowledgement.

use std::time::Duration;

use async_trait::async_trait;

/// HTTP request timeout for one trigger call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Value of the `source` field in trigger payloads.
const TRIGGER_SOURCE: &str = "comfy-relay";

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    /// The underlying HTTP request failed (network, DNS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The endpoint returned a non-2xx status code.
    #[error("Ingestion endpoint returned HTTP {0}")]
    HttpStatus(u16),
}

#[async_trait]
pub trait IngestionTrigger: Send + Sync {
    /// Ask downstream ingestion to run. `cycle` is the dispatch cycle number.
    async fn trigger(&self, cycle: u64) -> Result<(), TriggerError>;
}

/// Posts `{"source": "comfy-relay", "cycle": N}` to a webhook.
pub struct HttpIngestionTrigger {
    client: reqwest::Client,
    url: String,
}

impl HttpIngestionTrigger {
    pub fn new(url: impl Into<String>) -> Result<Self, TriggerError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl IngestionTrigger for HttpIngestionTrigger {
    async fn trigger(&self, cycle: u64) -> Result<(), TriggerError> {
        let payload = serde_json::json!({
            "source": TRIGGER_SOURCE,
            "cycle": cycle,
        });

        let response = self.client.post(&self.url).json(&payload).send().await?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(cycle, url = %self.url, "Ingestion triggered");
            Ok(())
        } else {
            Err(TriggerError::HttpStatus(status.as_u16()))
        }
    }
}
