//! `relay-worker` -- moves generation jobs from SQS through ComfyUI to S3.
//!
//! Configuration comes from the secret file (`RELAY_SECRET_FILE`, default
//! `/run/secrets/comfy-relay`) and then the environment; see
//! [`WorkerConfig::load`] for the keys.
//!
//! Exit status is 0 on a clean run and 1 when configuration, the initial
//! credential lease or anything else at the top level fails.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use relay_cloud::aws::AwsLeaseProvider;
use relay_cloud::secrets::SecretSource;
use relay_cloud::{
    JobQueue, LeaseManager, QueueKind, RefreshSchedule, ResultPublisher, S3BlobStore, SqsJobQueue,
};
use relay_comfyui::api::ComfyUIApi;
use relay_comfyui::ComfyUIDispatcher;
use relay_core::catalog::TemplateCatalog;
use relay_worker::cli::Command;
use relay_worker::{HttpIngestionTrigger, QueueConsumer, WorkerConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long to wait for the refresh task after cancellation.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "relay_worker=info,relay_cloud=info,relay_comfyui=info,relay_core=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("relay-worker failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let command = Command::parse(std::env::args().skip(1))?;

    let secrets = SecretSource::from_env_location()?;
    let config = WorkerConfig::load(&secrets).context("Invalid configuration")?;

    tracing::info!(
        comfyui_url = %config.comfyui_url(),
        workflow_dir = %config.workflow_dir.display(),
        region = %config.region,
        role = %config.role_name,
        "Starting relay-worker",
    );

    let provider = Arc::new(AwsLeaseProvider::new(
        secrets,
        &config.role_name,
        &config.region,
        config.parameters.clone(),
    ));
    let leases = LeaseManager::start(provider, RefreshSchedule::default())
        .await
        .context("Cannot acquire initial credential lease")?;

    let queue = Arc::new(SqsJobQueue::new(leases.handle()));

    match command {
        Command::Send(body) => {
            let message_id = queue.send(QueueKind::Fast, &body).await?;
            tracing::info!(message_id = %message_id, "Message sent to fast queue");
        }
        Command::ReceiveOnce => {
            let mut consumer = build_consumer(&config, &leases, queue).await?;
            let report = consumer.run_cycle().await;
            tracing::info!(
                completed = report.completed(),
                left = report.left(),
                outcomes = ?report.outcomes,
                "Single cycle finished",
            );
        }
        Command::Run => {
            let mut consumer = build_consumer(&config, &leases, queue).await?;

            let cancel = CancellationToken::new();
            let refresh_handle = leases.spawn_refresh(cancel.clone());

            let signal_cancel = cancel.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                signal_cancel.cancel();
            });

            consumer.run(cancel.clone()).await;

            cancel.cancel();
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, refresh_handle).await;
            tracing::info!("Shutdown complete");
        }
    }

    Ok(())
}

async fn build_consumer(
    config: &WorkerConfig,
    leases: &LeaseManager,
    queue: Arc<SqsJobQueue>,
) -> anyhow::Result<QueueConsumer> {
    let api = ComfyUIApi::new(config.comfyui_url())
        .with_timeouts(config.submit_timeout, config.history_timeout);

    // Reachability only; ComfyUI may still be loading models.
    match api.system_stats().await {
        Ok(stats) => tracing::info!(
            version = stats.pointer("/system/comfyui_version").and_then(|v| v.as_str()),
            "ComfyUI reachable",
        ),
        Err(e) => tracing::warn!(error = %e, "ComfyUI not reachable yet"),
    }

    let catalog = TemplateCatalog::new(&config.workflow_dir);
    match catalog.models() {
        Ok(models) if !models.is_empty() => tracing::info!(models = ?models, "Workflow templates found"),
        Ok(_) => tracing::warn!(dir = %catalog.dir().display(), "No workflow mappings found"),
        Err(e) => tracing::warn!(error = %e, "Cannot list workflow templates"),
    }

    let publisher = ResultPublisher::new(
        Arc::new(S3BlobStore::new(leases.handle())),
        &config.comfyui_output_dir,
    );

    let mut consumer = QueueConsumer::new(
        queue,
        catalog,
        Arc::new(ComfyUIDispatcher::new(api)),
        publisher,
        config.poll_interval,
    );

    if let Some(url) = &config.ingest_trigger_url {
        consumer = consumer.with_trigger(Arc::new(HttpIngestionTrigger::new(url.as_str())?));
        tracing::info!(url = %url, "Ingestion trigger enabled");
    }

    Ok(consumer)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), shutting down");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        }
    }
}
