//! Security maintenance binary
//!
//! Runs key rotation and audit retention on a schedule until interrupted.

use anyhow::Context;
use security_engine::{Config, SecurityEngine};
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());
    if std::env::var("SECURITY_LOG_FORMAT").map(|f| f == "json").unwrap_or(false) {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!("Starting security maintenance");

    // Load configuration
    let config = match std::env::var("SECURITY_CONFIG") {
        Ok(path) => Config::from_file(&path).with_context(|| format!("loading {}", path))?,
        Err(_) => Config::from_env().context("loading configuration from environment")?,
    };

    let engine = SecurityEngine::from_config(config).context("building security engine")?;
    let jobs = Arc::new(engine.maintenance());
    let interval = jobs.interval();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(jobs.run(interval, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down security maintenance");

    shutdown_tx.send(true)?;
    handle.await?;
    Ok(())
}
