//! Broker endpoints.

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::response::Response;
use gatebroker_core::{
    AcquireLeaseRequest, GetRequest, OptionsRequest, PutRequest, QueryRequest,
    RecordTypeOptions, ReleaseLeaseRequest, ReleaseLeaseResponse,
};
use serde::Deserialize;

use super::{decode_body, msgpack, ApiError, AppState};

/// `POST /query`
pub async fn query_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let _guard = state.shutdown.in_flight_guard();
    let request: QueryRequest = decode_body(&body)?;
    msgpack(&state.broker.query(&request).await?)
}

/// `POST /records`
pub async fn put_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let _guard = state.shutdown.in_flight_guard();
    let request: PutRequest = decode_body(&body)?;
    msgpack(&state.broker.put(request).await?)
}

/// `POST /records/get`
pub async fn get_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let _guard = state.shutdown.in_flight_guard();
    let request: GetRequest = decode_body(&body)?;
    let record = state
        .broker
        .get(&request.record_type, &request.id, request.include_deleted)
        .await?;
    msgpack(&record)
}

/// `POST /records/delete`
pub async fn delete_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let _guard = state.shutdown.in_flight_guard();
    let request: GetRequest = decode_body(&body)?;
    msgpack(&state.broker.delete(&request.record_type, &request.id).await?)
}

#[derive(Debug, Deserialize)]
pub struct ChangesParams {
    #[serde(default)]
    pub after: u64,
    /// Zero means the server's batch size.
    #[serde(default)]
    pub limit: usize,
}

/// `GET /changes?after=N&limit=M`
pub async fn changes_handler(
    State(state): State<AppState>,
    Query(params): Query<ChangesParams>,
) -> Result<Response, ApiError> {
    let _guard = state.shutdown.in_flight_guard();
    msgpack(&state.broker.changes_after(params.after, params.limit).await?)
}

/// `POST /options`: returns the change entries of records evicted by the
/// new capacity.
pub async fn set_options_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let _guard = state.shutdown.in_flight_guard();
    let options: RecordTypeOptions = decode_body(&body)?;
    msgpack(&state.broker.set_options(options).await?)
}

/// `POST /options/get`
pub async fn get_options_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let _guard = state.shutdown.in_flight_guard();
    let request: OptionsRequest = decode_body(&body)?;
    msgpack(&state.broker.get_options(&request.record_type).await?)
}

/// `POST /leases/acquire`
pub async fn acquire_lease_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let _guard = state.shutdown.in_flight_guard();
    let request: AcquireLeaseRequest = decode_body(&body)?;
    let lease = state
        .broker
        .acquire_lease(
            &request.name,
            &request.holder_id,
            Duration::from_millis(request.duration_ms),
        )
        .await?;
    msgpack(&lease)
}

/// `POST /leases/release`
pub async fn release_lease_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let _guard = state.shutdown.in_flight_guard();
    let request: ReleaseLeaseRequest = decode_body(&body)?;
    let released = state
        .broker
        .release_lease(&request.name, &request.holder_id)
        .await?;
    msgpack(&ReleaseLeaseResponse { released })
}

/// `GET /server`
pub async fn server_handler(State(state): State<AppState>) -> Result<Response, ApiError> {
    msgpack(&state.broker.server_info().await?)
}
