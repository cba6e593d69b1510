use std::sync::Arc;

use anyhow::{Context, Result};
use relay_consumer::{shutdown_signal, WorkerFactory};
use relay_worker::{
    init_telemetry, log_processor, router, AdminState, InputSource, LineClient, LineSource,
    TelemetryConfig, WorkerAppConfig,
};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Keep the guard alive for the lifetime of the application
    let _telemetry_guard = init_telemetry(TelemetryConfig::from_env());

    let config = WorkerAppConfig::from_env().context("Invalid worker configuration")?;

    tracing::info!(
        worker_id = %config.worker_id,
        topic = %config.topic,
        concurrency = config.concurrency,
        input = ?config.input,
        "relay-worker starting..."
    );

    let source = Arc::new(match &config.input {
        InputSource::Stdin => LineSource::stdin(),
        InputSource::File(path) => LineSource::open(path)
            .await
            .with_context(|| format!("Failed to open input {}", path.display()))?,
    });

    let client = Arc::new(LineClient::new(source.clone()));
    let worker = Arc::new(WorkerFactory::new(client).create(config.topic_config()));

    if let Some(addr) = config.admin_addr {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind admin listener on {addr}"))?;
        let app = router(AdminState::new(config.worker_id.clone(), worker.clone()));

        tracing::info!(address = %addr, "Admin server listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "Admin server error");
            }
        });
    }

    let exhausted = source.clone();
    let shutdown = async move {
        tokio::select! {
            _ = shutdown_signal() => {}
            _ = exhausted.exhausted() => {
                tracing::info!("Input exhausted, shutting down");
            }
        }
    };

    let summary = worker
        .run_until(log_processor(), config.run_settings(), shutdown)
        .await
        .context("Worker failed")?;

    let acks = source.ack_counts();
    tracing::info!(
        succeeded = summary.stats.succeeded,
        failed = summary.stats.failed,
        panicked = summary.stats.panicked,
        timed_out = summary.stats.timed_out,
        consumed = acks.consumed,
        redelivered = acks.redelivered,
        drained = summary.drained,
        "Worker shutdown complete"
    );
    Ok(())
}
