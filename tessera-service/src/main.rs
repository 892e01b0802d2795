//! TESSERA entry point
//!
//! Loads configuration (path from the first argument or `TESSERA_CONFIG`),
//! installs tracing, starts the runtime with in-process backends and runs
//! until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use tessera_core::TesseraResult;
use tessera_service::{
    init_tracing, RuntimeBackends, RuntimeConfig, TesseraRuntime, TracingMetricsSink,
};

#[tokio::main]
async fn main() -> TesseraResult<()> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("TESSERA_CONFIG").ok())
        .map(PathBuf::from);
    let config = RuntimeConfig::load(path.as_deref())?;
    init_tracing(&config.logging)?;

    let runtime = TesseraRuntime::start(
        config,
        RuntimeBackends::in_memory(),
        Arc::new(TracingMetricsSink),
    )?;

    let health = runtime.health().await;
    tracing::info!(status = ?health.status, checks = health.checks.len(), "Initial health check");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    } else {
        tracing::info!("Shutdown signal received");
    }

    runtime.shutdown().await;
    Ok(())
}
