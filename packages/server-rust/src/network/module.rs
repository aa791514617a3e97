//! HTTP service lifecycle.
//!
//! `new()` wires the broker in, `start()` binds the listener, and `serve()`
//! accepts requests until the shutdown future resolves, then drains.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::NetworkConfig;
use super::handlers::{
    acquire_lease_handler, changes_handler, delete_handler, get_handler, get_options_handler,
    health_handler, liveness_handler, put_handler, query_handler, readiness_handler,
    release_lease_handler, server_handler, set_options_handler, AppState,
};
use super::middleware::build_http_layers;
use super::routes;
use super::shutdown::ShutdownController;
use crate::broker::Broker;

/// Owns the listener and routes for one broker.
pub struct NetworkModule {
    config: NetworkConfig,
    broker: Broker,
    listener: Option<TcpListener>,
    shutdown: Arc<ShutdownController>,
}

impl NetworkModule {
    /// Creates the module without binding a port.
    #[must_use]
    pub fn new(config: NetworkConfig, broker: Broker) -> Self {
        Self {
            config,
            broker,
            listener: None,
            shutdown: Arc::new(ShutdownController::new()),
        }
    }

    /// Shared health/drain controller.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Assembles the router with every route and middleware layer.
    pub fn build_router(&self) -> Router {
        let state = AppState {
            broker: self.broker.clone(),
            shutdown: Arc::clone(&self.shutdown),
            start_time: Instant::now(),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .route(routes::QUERY, post(query_handler))
            .route(routes::RECORDS, post(put_handler))
            .route(routes::RECORDS_GET, post(get_handler))
            .route(routes::RECORDS_DELETE, post(delete_handler))
            .route(routes::CHANGES, get(changes_handler))
            .route(routes::OPTIONS, post(set_options_handler))
            .route(routes::OPTIONS_GET, post(get_options_handler))
            .route(routes::LEASES_ACQUIRE, post(acquire_lease_handler))
            .route(routes::LEASES_RELEASE, post(release_lease_handler))
            .route(routes::SERVER, get(server_handler))
            .layer(build_http_layers(&self.config))
            .with_state(state)
    }

    /// Binds the listener and returns the actual port (useful with port 0).
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!(host = %self.config.host, port, "listener bound");
        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves until `shutdown` resolves, then drains in-flight calls.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called or the server fails.
    pub async fn serve(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let router = self.build_router();
        let Some(listener) = self.listener else {
            anyhow::bail!("start() must be called before serve()");
        };
        let controller = self.shutdown;

        controller.set_ready();
        info!("serving broker API");

        let draining = Arc::clone(&controller);
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown.await;
                draining.trigger_shutdown();
            })
            .await?;

        if controller.wait_for_drain(self.config.drain_timeout).await {
            info!("in-flight requests drained");
        } else {
            warn!(
                remaining = controller.in_flight_count(),
                "drain timeout expired"
            );
        }
        Ok(())
    }
}
