//! Job queues.
//!
//! Two queues feed the worker: `fast` is drained first on every cycle, then
//! `slow`. Messages are received one at a time and deleted only after the
//! whole pipeline succeeded; everything else relies on redelivery.

use std::sync::Arc;

use async_trait::async_trait;
use aws_smithy_types::error::display::DisplayErrorContext;

use crate::lease::LeaseHandle;

/// Queue priority class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Fast,
    Slow,
}

impl QueueKind {
    /// Drain order within a cycle.
    pub const ALL: [QueueKind; 2] = [QueueKind::Fast, QueueKind::Slow];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Slow => "slow",
        }
    }
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A received, not yet acknowledged message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub queue: QueueKind,
    pub message_id: Option<String>,
    /// Token needed to delete the message.
    pub receipt_handle: String,
    pub body: String,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Receive from {queue} queue failed: {reason}")]
    Receive { queue: QueueKind, reason: String },

    #[error("Delete from {queue} queue failed: {reason}")]
    Delete { queue: QueueKind, reason: String },

    #[error("Send to {queue} queue failed: {reason}")]
    Send { queue: QueueKind, reason: String },
}

/// The queue operations the worker needs.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Receive at most one message. `Ok(None)` means the queue is empty.
    async fn receive(&self, queue: QueueKind) -> Result<Option<QueueMessage>, QueueError>;

    /// Acknowledge a message so it is not redelivered.
    async fn delete(&self, message: &QueueMessage) -> Result<(), QueueError>;

    /// Enqueue a raw body; returns the new message id.
    async fn send(&self, queue: QueueKind, body: &str) -> Result<String, QueueError>;
}

// ---------------------------------------------------------------------------
// SQS
// ---------------------------------------------------------------------------

/// Message group used when sending to a FIFO queue.
pub const FIFO_MESSAGE_GROUP: &str = "comfy-relay";

/// [`JobQueue`] over SQS, using whatever lease is current per call.
pub struct SqsJobQueue {
    lease: Arc<LeaseHandle>,
    wait_time_secs: i32,
}

impl SqsJobQueue {
    /// Short polling: an empty queue answers immediately and the adaptive
    /// interval paces the loop.
    pub fn new(lease: Arc<LeaseHandle>) -> Self {
        Self {
            lease,
            wait_time_secs: 0,
        }
    }

    /// Enable long polling, capped at the SQS maximum of 20 s.
    pub fn with_wait_time(mut self, secs: i32) -> Self {
        self.wait_time_secs = secs.clamp(0, 20);
        self
    }
}

pub fn is_fifo_queue(queue_url: &str) -> bool {
    queue_url.ends_with(".fifo")
}

#[async_trait]
impl JobQueue for SqsJobQueue {
    async fn receive(&self, queue: QueueKind) -> Result<Option<QueueMessage>, QueueError> {
        let lease = self.lease.snapshot().await;

        let output = lease
            .sqs()
            .receive_message()
            .queue_url(lease.queue_url(queue))
            .max_number_of_messages(1)
            .wait_time_seconds(self.wait_time_secs)
            .send()
            .await
            .map_err(|e| QueueError::Receive {
                queue,
                reason: DisplayErrorContext(&e).to_string(),
            })?;

        let Some(message) = output.messages().first() else {
            return Ok(None);
        };

        let Some(receipt_handle) = message.receipt_handle() else {
            return Err(QueueError::Receive {
                queue,
                reason: "message carried no receipt handle".into(),
            });
        };

        Ok(Some(QueueMessage {
            queue,
            message_id: message.message_id().map(str::to_string),
            receipt_handle: receipt_handle.to_string(),
            body: message.body().unwrap_or_default().to_string(),
        }))
    }

    async fn delete(&self, message: &QueueMessage) -> Result<(), QueueError> {
        let lease = self.lease.snapshot().await;

        lease
            .sqs()
            .delete_message()
            .queue_url(lease.queue_url(message.queue))
            .receipt_handle(&message.receipt_handle)
            .send()
            .await
            .map_err(|e| QueueError::Delete {
                queue: message.queue,
                reason: DisplayErrorContext(&e).to_string(),
            })?;
        Ok(())
    }

    async fn send(&self, queue: QueueKind, body: &str) -> Result<String, QueueError> {
        let lease = self.lease.snapshot().await;
        let queue_url = lease.queue_url(queue);

        let mut request = lease
            .sqs()
            .send_message()
            .queue_url(queue_url)
            .message_body(body);
        if is_fifo_queue(queue_url) {
            request = request
                .message_group_id(FIFO_MESSAGE_GROUP)
                .message_deduplication_id(uuid::Uuid::new_v4().to_string());
        }

        let output = request.send().await.map_err(|e| QueueError::Send {
            queue,
            reason: DisplayErrorContext(&e).to_string(),
        })?;

        Ok(output.message_id().unwrap_or_default().to_string())
    }
}
