//! Credential lease lifecycle.
//!
//! A [`CredentialLease`] bundles short-lived credentials with the
//! configuration resolved under them (bucket, queue URLs) and the S3/SQS
//! clients built from them. Exactly one lease is current at a time. It
//! lives in a [`LeaseHandle`]; readers take an `Arc` snapshot and keep
//! using it for the whole operation, while the refresh task swaps in a
//! fully built replacement behind the lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::SdkConfig;
use relay_core::types::Timestamp;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::queue::QueueKind;
use crate::secrets::CredentialError;

/// Time between successful refreshes.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(59 * 60);

/// Time before retrying a failed refresh.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5 * 60);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures while acquiring a lease. No lease is installed on any of them.
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    /// Base credentials could not be resolved.
    #[error(transparent)]
    Credentials(#[from] CredentialError),

    /// STS `GetCallerIdentity` failed or returned no account.
    #[error("Identity lookup failed: {0}")]
    Identity(String),

    /// STS `AssumeRole` failed or returned no credentials.
    #[error("Cannot assume role {role_arn}: {reason}")]
    AssumeRole { role_arn: String, reason: String },

    /// SSM `GetParameters` failed.
    #[error("Parameter lookup failed: {0}")]
    Parameters(String),

    /// A required parameter is absent or empty.
    #[error("Parameter {0} is missing")]
    MissingParameter(String),

    /// A queue name could not be turned into a URL.
    #[error("Cannot resolve queue {queue}: {reason}")]
    QueueResolution { queue: String, reason: String },
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// Configuration values resolved under a lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseResources {
    pub bucket: String,
    pub fast_queue_url: String,
    pub slow_queue_url: String,
}

impl LeaseResources {
    pub fn queue_url(&self, kind: QueueKind) -> &str {
        match kind {
            QueueKind::Fast => &self.fast_queue_url,
            QueueKind::Slow => &self.slow_queue_url,
        }
    }
}

/// Credentials, resolved configuration and the clients built from them.
#[derive(Debug, Clone)]
pub struct CredentialLease {
    /// When the credentials stop working, if the issuer said.
    pub expires_at: Option<Timestamp>,
    pub acquired_at: Timestamp,
    pub resources: LeaseResources,
    s3: aws_sdk_s3::Client,
    sqs: aws_sdk_sqs::Client,
}

impl CredentialLease {
    /// Build a lease from an SDK config already carrying the lease
    /// credentials.
    pub fn new(
        config: &SdkConfig,
        resources: LeaseResources,
        expires_at: Option<Timestamp>,
    ) -> Self {
        Self {
            expires_at,
            acquired_at: chrono::Utc::now(),
            resources,
            s3: aws_sdk_s3::Client::new(config),
            sqs: aws_sdk_sqs::Client::new(config),
        }
    }

    pub fn s3(&self) -> &aws_sdk_s3::Client {
        &self.s3
    }

    pub fn sqs(&self) -> &aws_sdk_sqs::Client {
        &self.sqs
    }

    pub fn bucket(&self) -> &str {
        &self.resources.bucket
    }

    pub fn queue_url(&self, kind: QueueKind) -> &str {
        self.resources.queue_url(kind)
    }
}

/// Holder of the current lease.
#[derive(Debug)]
pub struct LeaseHandle {
    current: RwLock<Arc<CredentialLease>>,
    generation: AtomicU64,
}

impl LeaseHandle {
    pub fn new(lease: CredentialLease) -> Self {
        Self {
            current: RwLock::new(Arc::new(lease)),
            generation: AtomicU64::new(1),
        }
    }

    /// The current lease. Hold the returned `Arc` for the duration of one
    /// operation so clients and configuration come from the same lease.
    pub async fn snapshot(&self) -> Arc<CredentialLease> {
        Arc::clone(&*self.current.read().await)
    }

    /// Replace the current lease.
    pub async fn install(&self, lease: CredentialLease) {
        let lease = Arc::new(lease);
        *self.current.write().await = lease;
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of leases installed so far, starting at 1.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Provider seam
// ---------------------------------------------------------------------------

/// Source of fresh leases.
#[async_trait]
pub trait LeaseProvider: Send + Sync {
    /// Acquire a complete lease. Partial results are never returned.
    async fn acquire(&self) -> Result<CredentialLease, LeaseError>;
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Refresh cadence.
#[derive(Debug, Clone, Copy)]
pub struct RefreshSchedule {
    /// Delay after a successful acquisition.
    pub interval: Duration,
    /// Delay after a failed acquisition.
    pub retry: Duration,
}

impl Default for RefreshSchedule {
    fn default() -> Self {
        Self {
            interval: DEFAULT_REFRESH_INTERVAL,
            retry: DEFAULT_RETRY_INTERVAL,
        }
    }
}

/// Owns the [`LeaseHandle`] and keeps it fresh.
#[derive(Clone)]
pub struct LeaseManager {
    provider: Arc<dyn LeaseProvider>,
    handle: Arc<LeaseHandle>,
    schedule: RefreshSchedule,
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("generation", &self.handle.generation())
            .field("schedule", &self.schedule)
            .finish_non_exhaustive()
    }
}

impl LeaseManager {
    /// Acquire the initial lease. An error here is meant to be fatal to the
    /// caller; there is no lease to fall back on yet.
    pub async fn start(
        provider: Arc<dyn LeaseProvider>,
        schedule: RefreshSchedule,
    ) -> Result<Self, LeaseError> {
        let lease = provider.acquire().await?;

        tracing::info!(
            bucket = %lease.bucket(),
            expires_at = ?lease.expires_at,
            "Initial credential lease acquired",
        );

        Ok(Self {
            provider,
            handle: Arc::new(LeaseHandle::new(lease)),
            schedule,
        })
    }

    pub fn handle(&self) -> Arc<LeaseHandle> {
        Arc::clone(&self.handle)
    }

    pub fn schedule(&self) -> RefreshSchedule {
        self.schedule
    }

    /// Acquire and install one new lease. On error the current lease is
    /// left untouched.
    pub async fn refresh(&self) -> Result<(), LeaseError> {
        let lease = self.provider.acquire().await?;
        let expires_at = lease.expires_at;
        self.handle.install(lease).await;

        tracing::info!(
            generation = self.handle.generation(),
            expires_at = ?expires_at,
            "Credential lease refreshed",
        );
        Ok(())
    }

    /// Refresh loop: every `interval` after a success, every `retry` after
    /// a failure, until `cancel` fires.
    pub async fn run_refresh(&self, cancel: CancellationToken) {
        tracing::info!(
            interval_secs = self.schedule.interval.as_secs(),
            retry_secs = self.schedule.retry.as_secs(),
            "Lease refresh task started",
        );

        let mut delay = self.schedule.interval;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Lease refresh task stopping");
                    break;
                }
                _ = tokio::time::sleep(delay) => {
                    delay = match self.refresh().await {
                        Ok(()) => self.schedule.interval,
                        Err(e) => {
                            tracing::error!(
                                error = %e,
                                retry_secs = self.schedule.retry.as_secs(),
                                "Lease refresh failed, keeping current lease",
                            );
                            self.schedule.retry
                        }
                    };
                }
            }
        }
    }

    /// Spawn [`run_refresh`](Self::run_refresh) on the runtime.
    pub fn spawn_refresh(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move { manager.run_refresh(cancel).await })
    }
}
