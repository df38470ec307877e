use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use relay_cloud::aws::ParameterNames;
use relay_cloud::secrets::SecretSource;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("{key}={value:?} is invalid: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub comfyui_host: String,
    pub comfyui_port: u16,
    /// Directory ComfyUI writes its output files to.
    pub comfyui_output_dir: PathBuf,
    /// Directory holding `{model}.json` / `{model}.mapping.json`.
    pub workflow_dir: PathBuf,
    /// Base of the adaptive idle interval.
    pub poll_interval: Duration,
    pub submit_timeout: Duration,
    pub history_timeout: Duration,
    /// IAM role assumed for every lease.
    pub role_name: String,
    pub region: String,
    pub parameters: ParameterNames,
    /// Ingestion webhook; `None` disables the trigger.
    pub ingest_trigger_url: Option<String>,
}

impl WorkerConfig {
    /// Load configuration, secret file first, then environment.
    ///
    /// | Key                    | Default                    |
    /// |------------------------|----------------------------|
    /// | `COMFYUI_HOST`         | `127.0.0.1`                |
    /// | `COMFYUI_PORT`         | `8188`                     |
    /// | `COMFYUI_OUTPUT_DIR`   | `./output`                 |
    /// | `WORKFLOW_DIR`         | `./workflows`              |
    /// | `POLL_INTERVAL_SECS`   | `1`                        |
    /// | `SUBMIT_TIMEOUT_SECS`  | `30`                       |
    /// | `HISTORY_TIMEOUT_SECS` | `10`                       |
    /// | `AWS_ROLE_NAME`        | required                   |
    /// | `AWS_REGION`           | `us-east-1`                |
    /// | `PARAM_BUCKET`         | `/comfy-relay/bucket`      |
    /// | `PARAM_FAST_QUEUE`     | `/comfy-relay/fast-queue`  |
    /// | `PARAM_SLOW_QUEUE`     | `/comfy-relay/slow-queue`  |
    /// | `INGEST_TRIGGER_URL`   | unset                      |
    pub fn load(secrets: &SecretSource) -> Result<Self, ConfigError> {
        let defaults = ParameterNames::default();

        Ok(Self {
            comfyui_host: string_or(secrets, "COMFYUI_HOST", "127.0.0.1"),
            comfyui_port: parse_or(secrets, "COMFYUI_PORT", 8188)?,
            comfyui_output_dir: string_or(secrets, "COMFYUI_OUTPUT_DIR", "./output").into(),
            workflow_dir: string_or(secrets, "WORKFLOW_DIR", "./workflows").into(),
            poll_interval: Duration::from_secs(parse_or(secrets, "POLL_INTERVAL_SECS", 1)?),
            submit_timeout: Duration::from_secs(parse_or(secrets, "SUBMIT_TIMEOUT_SECS", 30)?),
            history_timeout: Duration::from_secs(parse_or(secrets, "HISTORY_TIMEOUT_SECS", 10)?),
            role_name: secrets
                .get("AWS_ROLE_NAME")
                .ok_or(ConfigError::Missing("AWS_ROLE_NAME"))?,
            region: string_or(secrets, "AWS_REGION", "us-east-1"),
            parameters: ParameterNames {
                bucket: string_or(secrets, "PARAM_BUCKET", &defaults.bucket),
                fast_queue: string_or(secrets, "PARAM_FAST_QUEUE", &defaults.fast_queue),
                slow_queue: string_or(secrets, "PARAM_SLOW_QUEUE", &defaults.slow_queue),
            },
            ingest_trigger_url: secrets.get("INGEST_TRIGGER_URL"),
        })
    }

    /// Base URL of the ComfyUI HTTP API.
    pub fn comfyui_url(&self) -> String {
        format!("http://{}:{}", self.comfyui_host, self.comfyui_port)
    }
}

fn string_or(secrets: &SecretSource, key: &str, default: &str) -> String {
    secrets.get(key).unwrap_or_else(|| default.to_string())
}

fn parse_or<T>(secrets: &SecretSource, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match secrets.get(key) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value,
        }),
    }
}
