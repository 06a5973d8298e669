use std::sync::Arc;

use config::shared::PipelineConfig;
use etl::destination::redshift::RedshiftDestination;
use etl::pipeline::Pipeline;
use etl::source::client::PgSourceClient;
use etl::storage::s3::S3ObjectStore;
use tracing::{info, warn};

/// Runs one replication pass with the provided configuration.
///
/// Connects the source, the object store, and the warehouse, then replicates every
/// table. A shutdown signal stops the run between tables: the table in flight
/// finishes its export, upload, and swap first, so an interrupted run leaves no
/// open upload sessions or half-swapped tables behind.
pub async fn start_pipeline_with_config(config: PipelineConfig) -> anyhow::Result<()> {
    config.validate()?;

    info!(
        source_schema = %config.source_schema,
        warehouse_schema = %config.warehouse.schema,
        bucket = %config.storage.bucket,
        "starting replication run"
    );

    let config = Arc::new(config);

    let source = PgSourceClient::connect(&config.source, &config.source_schema).await?;
    let storage = S3ObjectStore::new(&config.storage).await?;
    let destination = RedshiftDestination::connect(&config.warehouse, &config.storage).await?;

    let pipeline = Pipeline::new(config, source, storage, destination);

    // Listen for signals on the side; the pipeline itself is awaited, so a signal
    // never cancels a table mid-flight.
    let shutdown_tx = pipeline.shutdown_tx();
    let shutdown_handle = tokio::spawn(async move {
        shutdown_signal().await;
        warn!("shutdown signal received, stopping after the current table");

        if let Err(e) = shutdown_tx.send(true) {
            warn!(error = %e, "failed to send shutdown request");
        }
    });

    let result = pipeline.replicate_all().await;

    // The run is over either way; stop listening for signals.
    shutdown_handle.abort();
    let _ = shutdown_handle.await;

    result?;
    info!("replication run completed");

    Ok(())
}

/// Resolves when the process receives SIGINT or, on Unix, SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
