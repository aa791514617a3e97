//! Health, liveness, and readiness probes.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use super::AppState;
use crate::network::HealthState;

/// Health details as JSON. Always 200; the `state` field carries the verdict.
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "state": state.shutdown.health_state().as_str(),
        "backend": state.broker.backend_kind(),
        "server_incarnation_id": state.broker.server_incarnation_id(),
        "in_flight": state.shutdown.in_flight_count(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// Liveness: the process is up. Never checks storage.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Readiness: 200 only while `Ready`, 503 while starting or draining.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.shutdown.health_state() == HealthState::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use gatebroker_core::SystemClock;

    use super::*;
    use crate::broker::{Broker, BrokerSettings};
    use crate::network::ShutdownController;
    use crate::storage::MemoryBackend;

    async fn test_state() -> AppState {
        let broker = Broker::open(
            Arc::new(MemoryBackend::new()),
            Arc::new(SystemClock),
            BrokerSettings::default(),
        )
        .await
        .unwrap();
        AppState {
            broker,
            shutdown: Arc::new(ShutdownController::new()),
            start_time: Instant::now(),
        }
    }

    #[tokio::test]
    async fn health_reports_state_and_backend() {
        let state = test_state().await;
        state.shutdown.set_ready();
        let incarnation = state.broker.server_incarnation_id();

        let json = health_handler(State(state)).await.0;
        assert_eq!(json["state"], "ready");
        assert_eq!(json["backend"], "memory");
        assert_eq!(json["server_incarnation_id"], incarnation);
        assert_eq!(json["in_flight"], 0);
    }

    #[tokio::test]
    async fn health_counts_in_flight_calls() {
        let state = test_state().await;
        let _guard = state.shutdown.in_flight_guard();
        let json = health_handler(State(state)).await.0;
        assert_eq!(json["in_flight"], 1);
        assert_eq!(json["state"], "starting");
    }

    #[tokio::test]
    async fn liveness_is_always_ok() {
        assert_eq!(liveness_handler().await, StatusCode::OK);
    }

    #[tokio::test]
    async fn readiness_follows_lifecycle() {
        let state = test_state().await;
        assert_eq!(
            readiness_handler(State(state.clone())).await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        state.shutdown.set_ready();
        assert_eq!(readiness_handler(State(state.clone())).await, StatusCode::OK);

        state.shutdown.trigger_shutdown();
        assert_eq!(
            readiness_handler(State(state)).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
