//! Cloud side of the relay: credentials, queues and blob storage.
//!
//! - [`secrets`]: secret-file-then-environment key lookup.
//! - [`lease`]: the current [`CredentialLease`] and its refresh task.
//! - [`aws`]: STS role assumption and SSM parameter resolution.
//! - [`queue`]: the fast/slow job queues ([`JobQueue`], SQS backed).
//! - [`storage`]: result storage ([`BlobStore`], S3 backed).
//! - [`publisher`]: ordered publication of a finished job.

pub mod aws;
pub mod lease;
pub mod publisher;
pub mod queue;
pub mod secrets;
pub mod storage;

pub use lease::{CredentialLease, LeaseError, LeaseHandle, LeaseManager, LeaseProvider, RefreshSchedule};
pub use publisher::{PublishError, PublishReceipt, ResultPublisher};
pub use queue::{JobQueue, QueueError, QueueKind, QueueMessage, SqsJobQueue};
pub use storage::{BlobStore, S3BlobStore};
