//! Replication pipeline binary.
//!
//! Loads configuration, initializes tracing, and runs one replication pass over
//! every table of the configured source schema.

use config::load::load_config;
use config::shared::PipelineConfig;
use tracing_subscriber::EnvFilter;

mod core;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config::<PipelineConfig>()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(core::start_pipeline_with_config(config))
}
