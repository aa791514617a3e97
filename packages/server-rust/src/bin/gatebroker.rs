//! `gatebroker` service binary.
//!
//! Opens the configured storage, migrates the schema, and serves the broker
//! HTTP API until SIGINT.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use gatebroker_core::SystemClock;
use gatebroker_server::broker::Broker;
use gatebroker_server::config::{BrokerConfig, LogFormat};
use gatebroker_server::network::NetworkModule;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = BrokerConfig::parse();
    init_tracing(config.log_format);
    config.validate()?;

    let backend = config.open_storage().await?;
    let broker = Broker::open(backend, Arc::new(SystemClock), config.broker_settings())
        .await
        .context("broker failed to open; refusing to serve")?;
    config.apply_capacities(&broker).await?;

    let mut network = NetworkModule::new(config.network_config(), broker);
    let port = network.start().await?;
    info!(port, storage = ?config.storage, "gatebroker started");

    network.serve(shutdown_signal()).await?;
    info!("gatebroker stopped");
    Ok(())
}
