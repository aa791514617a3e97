//! Command-line and environment configuration for the `gatebroker` binary.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use gatebroker_core::RecordTypeOptions;
use tracing::info;

use crate::broker::{Broker, BrokerSettings};
use crate::network::NetworkConfig;
use crate::storage::{MemoryBackend, StorageBackend};

/// Storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StorageKind {
    /// In-process store; state is lost on exit.
    Memory,
    /// Shared `PostgreSQL` store (requires the `postgres` feature).
    Postgres,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Broker service configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "gatebroker", version, about = "Versioned record broker with change-log tailing and leases")]
pub struct BrokerConfig {
    /// Bind address.
    #[arg(long, env = "GATEBROKER_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Listen port.
    #[arg(long, env = "GATEBROKER_PORT", default_value_t = 5443)]
    pub port: u16,

    /// Allowed CORS origins, comma separated.
    #[arg(long, env = "GATEBROKER_CORS_ORIGINS", value_delimiter = ',', default_value = "*")]
    pub cors_origins: Vec<String>,

    /// Storage backend.
    #[arg(long, env = "GATEBROKER_STORAGE", value_enum, default_value_t = StorageKind::Memory)]
    pub storage: StorageKind,

    /// `PostgreSQL` connection URL, required with `--storage postgres`.
    #[arg(long, env = "GATEBROKER_DATABASE_URL")]
    pub database_url: Option<String>,

    /// Maximum pooled database connections.
    #[arg(long, env = "GATEBROKER_POOL_SIZE", default_value_t = 10)]
    pub pool_size: u32,

    /// Deadline for each storage operation, in milliseconds.
    #[arg(long, env = "GATEBROKER_OPERATION_TIMEOUT_MS", default_value_t = 10_000)]
    pub operation_timeout_ms: u64,

    /// HTTP request timeout, in milliseconds.
    #[arg(long, env = "GATEBROKER_REQUEST_TIMEOUT_MS", default_value_t = 30_000)]
    pub request_timeout_ms: u64,

    /// Tail poll interval when no local commit is signalled, in milliseconds.
    #[arg(long, env = "GATEBROKER_TAIL_POLL_INTERVAL_MS", default_value_t = 1_000)]
    pub tail_poll_interval_ms: u64,

    /// Change entries fetched per tail poll.
    #[arg(long, env = "GATEBROKER_TAIL_BATCH_SIZE", default_value_t = 256)]
    pub tail_batch_size: usize,

    /// Per-type capacity applied at startup, as `type=N`. Repeatable or
    /// comma separated.
    #[arg(
        long = "capacity",
        env = "GATEBROKER_CAPACITIES",
        value_delimiter = ',',
        value_parser = parse_capacity
    )]
    pub capacities: Vec<RecordTypeOptions>,

    /// Log output format. Levels come from `RUST_LOG`.
    #[arg(long, env = "GATEBROKER_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

fn parse_capacity(raw: &str) -> Result<RecordTypeOptions, String> {
    let (record_type, capacity) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected type=N, got {raw:?}"))?;
    let record_type = record_type.trim();
    if record_type.is_empty() {
        return Err(format!("missing record type in {raw:?}"));
    }
    let capacity = capacity
        .trim()
        .parse::<u64>()
        .map_err(|e| format!("invalid capacity in {raw:?}: {e}"))?;
    Ok(RecordTypeOptions {
        record_type: record_type.to_string(),
        capacity: Some(capacity),
    })
}

impl BrokerConfig {
    #[must_use]
    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            operation_timeout: Duration::from_millis(self.operation_timeout_ms),
            tail_poll_interval: Duration::from_millis(self.tail_poll_interval_ms),
            tail_batch_size: self.tail_batch_size,
        }
    }

    #[must_use]
    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            host: self.host.clone(),
            port: self.port,
            cors_origins: self.cors_origins.clone(),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            ..NetworkConfig::default()
        }
    }

    /// Checks cross-field constraints clap cannot express.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.storage == StorageKind::Postgres && self.database_url.is_none() {
            anyhow::bail!("--database-url is required with --storage postgres");
        }
        if self.tail_batch_size == 0 {
            anyhow::bail!("--tail-batch-size must be positive");
        }
        if self.operation_timeout_ms == 0 {
            anyhow::bail!("--operation-timeout-ms must be positive");
        }
        Ok(())
    }

    /// Stores the `--capacity` options, evicting immediately where a type is
    /// already over its new bound.
    ///
    /// # Errors
    ///
    /// Propagates the first storage failure.
    pub async fn apply_capacities(&self, broker: &Broker) -> anyhow::Result<()> {
        for options in &self.capacities {
            let evicted = broker.set_options(options.clone()).await?;
            info!(
                record_type = %options.record_type,
                capacity = ?options.capacity,
                evicted = evicted.len(),
                "capacity configured"
            );
        }
        Ok(())
    }

    /// Builds the configured storage backend.
    ///
    /// # Errors
    ///
    /// Fails when the database is unreachable, the URL is missing, or
    /// `postgres` was selected in a build without that feature.
    pub async fn open_storage(&self) -> anyhow::Result<Arc<dyn StorageBackend>> {
        match self.storage {
            StorageKind::Memory => Ok(Arc::new(MemoryBackend::new())),
            #[cfg(feature = "postgres")]
            StorageKind::Postgres => {
                use anyhow::Context;

                let url = self
                    .database_url
                    .as_deref()
                    .context("--database-url is required with --storage postgres")?;
                let backend = crate::storage::PostgresBackend::connect(
                    url,
                    self.pool_size,
                    Duration::from_millis(self.operation_timeout_ms),
                )
                .await?;
                Ok(Arc::new(backend))
            }
            #[cfg(not(feature = "postgres"))]
            StorageKind::Postgres => {
                anyhow::bail!("this build does not include the `postgres` feature")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let config = BrokerConfig::try_parse_from(["gatebroker"]).unwrap();
        assert_eq!(config.storage, StorageKind::Memory);
        assert_eq!(config.port, 5443);
        assert_eq!(config.cors_origins, vec!["*"]);
        config.validate().unwrap();

        let settings = config.broker_settings();
        assert_eq!(settings.operation_timeout, Duration::from_secs(10));
        assert_eq!(settings.tail_batch_size, 256);
    }

    #[test]
    fn postgres_requires_url() {
        let config =
            BrokerConfig::try_parse_from(["gatebroker", "--storage", "postgres"]).unwrap();
        assert!(config.validate().is_err());

        let config = BrokerConfig::try_parse_from([
            "gatebroker",
            "--storage",
            "postgres",
            "--database-url",
            "postgres://localhost/broker",
            "--log-format",
            "json",
        ])
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn network_config_carries_listener_settings() {
        let config = BrokerConfig::try_parse_from([
            "gatebroker",
            "--port",
            "8080",
            "--cors-origins",
            "https://a.example.com,https://b.example.com",
        ])
        .unwrap();
        let network = config.network_config();
        assert_eq!(network.port, 8080);
        assert_eq!(network.cors_origins.len(), 2);
    }

    #[test]
    fn capacities_parse_from_flags() {
        let config = BrokerConfig::try_parse_from([
            "gatebroker",
            "--capacity",
            "widget=2",
            "--capacity",
            "session=100,route=5",
        ])
        .unwrap();
        let parsed: Vec<(&str, Option<u64>)> = config
            .capacities
            .iter()
            .map(|o| (o.record_type.as_str(), o.capacity))
            .collect();
        assert_eq!(
            parsed,
            vec![("widget", Some(2)), ("session", Some(100)), ("route", Some(5))]
        );

        for bad in ["widget", "=3", "widget=-1", "widget=many"] {
            assert!(
                BrokerConfig::try_parse_from(["gatebroker", "--capacity", bad]).is_err(),
                "{bad}"
            );
        }
    }

    #[tokio::test]
    async fn capacities_are_applied_to_the_broker() {
        let config =
            BrokerConfig::try_parse_from(["gatebroker", "--capacity", "widget=2"]).unwrap();
        let broker = Broker::open(
            config.open_storage().await.unwrap(),
            Arc::new(gatebroker_core::SystemClock),
            config.broker_settings(),
        )
        .await
        .unwrap();

        config.apply_capacities(&broker).await.unwrap();
        assert_eq!(broker.get_options("widget").await.unwrap().capacity, Some(2));
    }

    #[tokio::test]
    async fn memory_storage_opens_without_io() {
        let config = BrokerConfig::try_parse_from(["gatebroker"]).unwrap();
        assert_eq!(config.open_storage().await.unwrap().kind(), "memory");
    }
}
