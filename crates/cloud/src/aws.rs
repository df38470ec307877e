//! Lease acquisition against AWS.
//!
//! 1. Base credentials from the secret file or environment.
//! 2. `sts:GetCallerIdentity` for the account id.
//! 3. `sts:AssumeRole` on `arn:aws:iam::{account}:role/{role_name}`.
//! 4. `ssm:GetParameters` (decrypted) for bucket and queue identifiers,
//!    using the assumed-role credentials.
//! 5. `sqs:GetQueueUrl` for queue identifiers given as names.
//!
//! Any failure aborts the acquisition; nothing is returned half-built.

use std::collections::HashMap;
use std::time::SystemTime;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_credential_types::provider::SharedCredentialsProvider;
use aws_credential_types::Credentials;
use aws_smithy_types::error::display::DisplayErrorContext;
use relay_core::types::Timestamp;

use crate::lease::{CredentialLease, LeaseError, LeaseProvider, LeaseResources};
use crate::secrets::SecretSource;

/// Lifetime requested for assumed-role sessions.
pub const SESSION_DURATION_SECS: i32 = 3600;

/// Provider name attached to assumed-role credentials.
const LEASE_PROVIDER_NAME: &str = "relay-assumed-role";

/// SSM parameter names holding the lease configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterNames {
    pub bucket: String,
    pub fast_queue: String,
    pub slow_queue: String,
}

impl Default for ParameterNames {
    fn default() -> Self {
        Self {
            bucket: "/comfy-relay/bucket".into(),
            fast_queue: "/comfy-relay/fast-queue".into(),
            slow_queue: "/comfy-relay/slow-queue".into(),
        }
    }
}

/// [`LeaseProvider`] assuming an IAM role and reading SSM parameters.
#[derive(Debug, Clone)]
pub struct AwsLeaseProvider {
    secrets: SecretSource,
    role_name: String,
    region: String,
    parameters: ParameterNames,
}

impl AwsLeaseProvider {
    pub fn new(
        secrets: SecretSource,
        role_name: impl Into<String>,
        region: impl Into<String>,
        parameters: ParameterNames,
    ) -> Self {
        Self {
            secrets,
            role_name: role_name.into(),
            region: region.into(),
            parameters,
        }
    }

    async fn base_config(&self) -> Result<SdkConfig, LeaseError> {
        let base = self.secrets.base_credentials()?;
        Ok(aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(self.region.clone()))
            .credentials_provider(base)
            .load()
            .await)
    }

    /// Assume the role and return the lease credentials with their expiry.
    async fn assume_role(
        &self,
        base_config: &SdkConfig,
    ) -> Result<(Credentials, Option<Timestamp>), LeaseError> {
        let sts = aws_sdk_sts::Client::new(base_config);

        let identity = sts
            .get_caller_identity()
            .send()
            .await
            .map_err(|e| LeaseError::Identity(DisplayErrorContext(&e).to_string()))?;
        let account = identity
            .account()
            .ok_or_else(|| LeaseError::Identity("response carried no account id".into()))?;

        let role_arn = role_arn(account, &self.role_name);
        let session_name = format!("comfy-relay-{}", uuid::Uuid::new_v4().simple());

        let assumed = sts
            .assume_role()
            .role_arn(&role_arn)
            .role_session_name(session_name)
            .duration_seconds(SESSION_DURATION_SECS)
            .send()
            .await
            .map_err(|e| LeaseError::AssumeRole {
                role_arn: role_arn.clone(),
                reason: DisplayErrorContext(&e).to_string(),
            })?;

        let creds = assumed.credentials().ok_or_else(|| LeaseError::AssumeRole {
            role_arn: role_arn.clone(),
            reason: "response carried no credentials".into(),
        })?;

        let expiration = *creds.expiration();
        let expires_at = chrono::DateTime::from_timestamp(expiration.secs(), expiration.subsec_nanos());

        let credentials = Credentials::new(
            creds.access_key_id(),
            creds.secret_access_key(),
            Some(creds.session_token().to_string()),
            SystemTime::try_from(expiration).ok(),
            LEASE_PROVIDER_NAME,
        );

        tracing::debug!(role_arn = %role_arn, expires_at = ?expires_at, "Assumed role");
        Ok((credentials, expires_at))
    }

    /// Read the three parameters in one call.
    async fn read_parameters(
        &self,
        lease_config: &SdkConfig,
    ) -> Result<(String, String, String), LeaseError> {
        let ssm = aws_sdk_ssm::Client::new(lease_config);

        let output = ssm
            .get_parameters()
            .names(&self.parameters.bucket)
            .names(&self.parameters.fast_queue)
            .names(&self.parameters.slow_queue)
            .with_decryption(true)
            .send()
            .await
            .map_err(|e| LeaseError::Parameters(DisplayErrorContext(&e).to_string()))?;

        let values: HashMap<&str, &str> = output
            .parameters()
            .iter()
            .filter_map(|p| Some((p.name()?, p.value()?)))
            .collect();

        let take = |name: &str| -> Result<String, LeaseError> {
            values
                .get(name)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .ok_or_else(|| LeaseError::MissingParameter(name.to_string()))
        };

        Ok((
            take(&self.parameters.bucket)?,
            take(&self.parameters.fast_queue)?,
            take(&self.parameters.slow_queue)?,
        ))
    }
}

#[async_trait]
impl LeaseProvider for AwsLeaseProvider {
    async fn acquire(&self) -> Result<CredentialLease, LeaseError> {
        let base_config = self.base_config().await?;
        let (credentials, expires_at) = self.assume_role(&base_config).await?;

        let lease_config = base_config
            .to_builder()
            .credentials_provider(SharedCredentialsProvider::new(credentials))
            .build();

        let (bucket, fast_queue, slow_queue) = self.read_parameters(&lease_config).await?;

        let sqs = aws_sdk_sqs::Client::new(&lease_config);
        let fast_queue_url = resolve_queue_url(&sqs, &fast_queue).await?;
        let slow_queue_url = resolve_queue_url(&sqs, &slow_queue).await?;

        Ok(CredentialLease::new(
            &lease_config,
            LeaseResources {
                bucket,
                fast_queue_url,
                slow_queue_url,
            },
            expires_at,
        ))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn role_arn(account: &str, role_name: &str) -> String {
    format!("arn:aws:iam::{account}:role/{role_name}")
}

/// Whether a queue identifier is already a URL.
pub fn is_queue_url(identifier: &str) -> bool {
    identifier.starts_with("https://")
}

async fn resolve_queue_url(sqs: &aws_sdk_sqs::Client, identifier: &str) -> Result<String, LeaseError> {
    if is_queue_url(identifier) {
        return Ok(identifier.to_string());
    }

    let output = sqs
        .get_queue_url()
        .queue_name(identifier)
        .send()
        .await
        .map_err(|e| LeaseError::QueueResolution {
            queue: identifier.to_string(),
            reason: DisplayErrorContext(&e).to_string(),
        })?;

    output
        .queue_url()
        .map(str::to_string)
        .ok_or_else(|| LeaseError::QueueResolution {
            queue: identifier.to_string(),
            reason: "response carried no queue URL".into(),
        })
}
