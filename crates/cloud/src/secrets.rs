//! Secret-file-then-environment key lookup.
//!
//! Deployments mount a dotenv-format secret file (default
//! `/run/secrets/comfy-relay`, overridable with `RELAY_SECRET_FILE`). Keys in
//! the file win; the process environment is the fallback. A missing file is
//! not an error, a malformed one is.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use aws_credential_types::Credentials;

/// Environment variable naming the secret file.
pub const SECRET_FILE_ENV: &str = "RELAY_SECRET_FILE";

/// Secret file used when [`SECRET_FILE_ENV`] is unset.
pub const DEFAULT_SECRET_FILE: &str = "/run/secrets/comfy-relay";

const ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
const SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
const SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";

/// Provider name attached to base credentials.
const BASE_PROVIDER_NAME: &str = "relay-base";

/// Errors while resolving secrets or base credentials.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Cannot read secret file {path}: {reason}")]
    SecretFile { path: PathBuf, reason: String },

    #[error("No base credentials: {ACCESS_KEY_ID} and {SECRET_ACCESS_KEY} must both be set in the secret file or the environment")]
    MissingBaseCredentials,
}

/// Key/value pairs from the secret file, with environment fallback.
#[derive(Debug, Clone, Default)]
pub struct SecretSource {
    path: Option<PathBuf>,
    values: HashMap<String, String>,
}

impl SecretSource {
    /// Load the secret file named by `RELAY_SECRET_FILE` (or the default).
    pub fn from_env_location() -> Result<Self, CredentialError> {
        let path = std::env::var(SECRET_FILE_ENV).unwrap_or_else(|_| DEFAULT_SECRET_FILE.into());
        Self::load(path)
    }

    /// Load a dotenv-format file. A file that does not exist yields an
    /// environment-only source.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CredentialError> {
        let path = path.as_ref().to_path_buf();

        let iter = match dotenvy::from_path_iter(&path) {
            Ok(iter) => iter,
            Err(dotenvy::Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No secret file, using environment only");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(CredentialError::SecretFile {
                    path,
                    reason: e.to_string(),
                })
            }
        };

        let mut values = HashMap::new();
        for item in iter {
            let (key, value) = item.map_err(|e| CredentialError::SecretFile {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            values.insert(key, value);
        }

        tracing::info!(path = %path.display(), keys = values.len(), "Loaded secret file");
        Ok(Self {
            path: Some(path),
            values,
        })
    }

    /// Build a source from explicit pairs (no file).
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            path: None,
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Path of the loaded secret file, if one was found.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Look up `key` in the file, then the environment. Blank values count
    /// as unset.
    pub fn get(&self, key: &str) -> Option<String> {
        self.file_value(key).or_else(|| env_value(key))
    }

    /// Resolve the long-lived base credentials used to assume the role.
    ///
    /// The key pair is taken from a single place: the secret file when it
    /// holds both halves, otherwise the environment. Mixing one half from
    /// each would produce credentials nobody issued.
    pub fn base_credentials(&self) -> Result<Credentials, CredentialError> {
        if let (Some(key), Some(secret)) = (
            self.file_value(ACCESS_KEY_ID),
            self.file_value(SECRET_ACCESS_KEY),
        ) {
            return Ok(Credentials::new(
                key,
                secret,
                self.file_value(SESSION_TOKEN),
                None,
                BASE_PROVIDER_NAME,
            ));
        }

        if let (Some(key), Some(secret)) = (env_value(ACCESS_KEY_ID), env_value(SECRET_ACCESS_KEY)) {
            return Ok(Credentials::new(
                key,
                secret,
                env_value(SESSION_TOKEN),
                None,
                BASE_PROVIDER_NAME,
            ));
        }

        Err(CredentialError::MissingBaseCredentials)
    }

    fn file_value(&self, key: &str) -> Option<String> {
        self.values
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
