//! Axum handlers and the state they share.
//!
//! Broker endpoints speak named `MsgPack` in both directions. Failures are
//! rendered as an [`ErrorBody`] with an HTTP status derived from the error
//! code, so remote callers can rebuild the exact [`BrokerError`].

pub mod api;
pub mod health;

pub use api::{
    acquire_lease_handler, changes_handler, delete_handler, get_handler, get_options_handler,
    put_handler, query_handler, release_lease_handler, server_handler, set_options_handler,
};
pub use health::{health_handler, liveness_handler, readiness_handler};

use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use gatebroker_core::{BrokerError, ErrorBody, ErrorCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::routes::MSGPACK;
use super::ShutdownController;
use crate::broker::Broker;

/// Shared application state, cloned into every handler.
#[derive(Clone)]
pub struct AppState {
    pub broker: Broker,
    /// Health state and in-flight tracking.
    pub shutdown: Arc<ShutdownController>,
    /// Process start time, for uptime.
    pub start_time: Instant,
}

/// A [`BrokerError`] rendered as an HTTP response.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ApiError(#[from] pub BrokerError);

/// HTTP status for each error code.
#[must_use]
pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::AlreadyHeld => StatusCode::LOCKED,
        ErrorCode::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Internal | ErrorCode::SchemaMismatch => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorCode::Unimplemented => StatusCode::NOT_IMPLEMENTED,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(self.0.code());
        let body: ErrorBody = self.0.to_body();
        let bytes = rmp_serde::to_vec_named(&body).unwrap_or_default();
        (status, [(CONTENT_TYPE, MSGPACK)], bytes).into_response()
    }
}

/// Decodes a `MsgPack` request body.
///
/// # Errors
///
/// `INVALID_ARGUMENT` when the body does not decode into `T`.
pub fn decode_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    rmp_serde::from_slice(body).map_err(|e| {
        ApiError(BrokerError::InvalidArgument(format!(
            "malformed request body: {e}"
        )))
    })
}

/// Encodes a successful `MsgPack` response.
///
/// # Errors
///
/// `INTERNAL` if the value cannot be serialized.
pub fn msgpack<T: Serialize>(value: &T) -> Result<Response, ApiError> {
    let bytes = rmp_serde::to_vec_named(value).map_err(|e| {
        ApiError(BrokerError::Internal(format!("failed to encode response: {e}")))
    })?;
    Ok(([(CONTENT_TYPE, MSGPACK)], bytes).into_response())
}
