use std::sync::Arc;

use async_trait::async_trait;
use gatebroker_core::{
    AcquireLeaseRequest, BrokerError, ChangeEntry, ErrorBody, GetRequest, Lease, OptionsRequest,
    PutRequest, Querier, QueryRequest, QueryResponse, Record, RecordTypeOptions,
    ReleaseLeaseRequest, ReleaseLeaseResponse, ServerInfo,
};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;

use crate::network::routes;
use crate::tail::{ChangeSource, ChangeStream, TailSettings};

/// Networked querier forwarding to a central broker over HTTP.
///
/// Bodies are named `MsgPack`. Error responses carry an [`ErrorBody`], so the
/// caller sees the same [`BrokerError`] the server produced.
#[derive(Debug, Clone)]
pub struct ClientQuerier {
    http: reqwest::Client,
    base_url: String,
}

fn transport_err(err: &reqwest::Error) -> BrokerError {
    if err.is_connect() || err.is_timeout() {
        BrokerError::Unavailable(format!("broker unreachable: {err}"))
    } else {
        BrokerError::Internal(format!("broker request failed: {err}"))
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, BrokerError> {
    let status = response.status();
    let body = response.bytes().await.map_err(|e| transport_err(&e))?;

    if status.is_success() {
        return rmp_serde::from_slice(&body)
            .map_err(|e| BrokerError::Internal(format!("undecodable broker response: {e}")));
    }
    match rmp_serde::from_slice::<ErrorBody>(&body) {
        Ok(error) => Err(BrokerError::from_body(error)),
        Err(_) => Err(bare_status_err(status)),
    }
}

/// Error for a failed response without an [`ErrorBody`], such as a timeout
/// produced by middleware or a proxy in front of the broker.
fn bare_status_err(status: StatusCode) -> BrokerError {
    match status {
        StatusCode::REQUEST_TIMEOUT
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT
        | StatusCode::BAD_GATEWAY => BrokerError::Unavailable(format!("broker returned {status}")),
        _ => BrokerError::Internal(format!("broker returned {status}")),
    }
}

impl ClientQuerier {
    /// Targets the broker at `base_url`, e.g. `http://databroker:8080`.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Uses a preconfigured HTTP client (timeouts, TLS roots).
    #[must_use]
    pub fn with_client(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn post<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp, BrokerError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let bytes = rmp_serde::to_vec_named(body)
            .map_err(|e| BrokerError::Internal(format!("failed to encode request: {e}")))?;
        let response = self
            .http
            .post(self.url(path))
            .header(CONTENT_TYPE, routes::MSGPACK)
            .body(bytes)
            .send()
            .await
            .map_err(|e| transport_err(&e))?;
        decode(response).await
    }

    async fn get<Resp: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<Resp, BrokerError> {
        let response = self
            .http
            .get(self.url(path))
            .query(params)
            .send()
            .await
            .map_err(|e| transport_err(&e))?;
        decode(response).await
    }

    /// # Errors
    ///
    /// Any [`BrokerError`] returned by the server, or a transport failure.
    pub async fn put(&self, request: &PutRequest) -> Result<Record, BrokerError> {
        self.post(routes::RECORDS, request).await
    }

    /// # Errors
    ///
    /// Any [`BrokerError`] returned by the server, or a transport failure.
    pub async fn get_record(&self, request: &GetRequest) -> Result<Record, BrokerError> {
        self.post(routes::RECORDS_GET, request).await
    }

    /// # Errors
    ///
    /// Any [`BrokerError`] returned by the server, or a transport failure.
    pub async fn delete(&self, request: &GetRequest) -> Result<Record, BrokerError> {
        self.post(routes::RECORDS_DELETE, request).await
    }

    /// # Errors
    ///
    /// Any [`BrokerError`] returned by the server, or a transport failure.
    pub async fn changes_after(
        &self,
        after: u64,
        limit: usize,
    ) -> Result<Vec<ChangeEntry>, BrokerError> {
        self.get(
            routes::CHANGES,
            &[("after", after.to_string()), ("limit", limit.to_string())],
        )
        .await
    }

    /// Subscribes to the remote change log after `from_version`.
    ///
    /// Remote commits are not signalled, so the task polls every
    /// `settings.poll_interval` once caught up. Must be called within a tokio
    /// runtime.
    #[must_use]
    pub fn tail(&self, from_version: u64, settings: TailSettings) -> ChangeStream {
        let (_, commits) = watch::channel(from_version);
        ChangeStream::spawn(Arc::new(self.clone()), commits, from_version, settings)
    }

    /// Stores per-type options. Returns the change entries of records evicted
    /// by the new capacity.
    ///
    /// # Errors
    ///
    /// Any [`BrokerError`] returned by the server, or a transport failure.
    pub async fn set_options(
        &self,
        options: &RecordTypeOptions,
    ) -> Result<Vec<ChangeEntry>, BrokerError> {
        self.post(routes::OPTIONS, options).await
    }

    /// # Errors
    ///
    /// Any [`BrokerError`] returned by the server, or a transport failure.
    pub async fn get_options(&self, record_type: &str) -> Result<RecordTypeOptions, BrokerError> {
        let request = OptionsRequest {
            record_type: record_type.to_string(),
        };
        self.post(routes::OPTIONS_GET, &request).await
    }

    /// # Errors
    ///
    /// Any [`BrokerError`] returned by the server, or a transport failure.
    pub async fn acquire_lease(&self, request: &AcquireLeaseRequest) -> Result<Lease, BrokerError> {
        self.post(routes::LEASES_ACQUIRE, request).await
    }

    /// # Errors
    ///
    /// Any [`BrokerError`] returned by the server, or a transport failure.
    pub async fn release_lease(&self, request: &ReleaseLeaseRequest) -> Result<bool, BrokerError> {
        let response: ReleaseLeaseResponse = self.post(routes::LEASES_RELEASE, request).await?;
        Ok(response.released)
    }

    /// # Errors
    ///
    /// Any [`BrokerError`] returned by the server, or a transport failure.
    pub async fn server_info(&self) -> Result<ServerInfo, BrokerError> {
        self.get(routes::SERVER, &[]).await
    }
}

#[async_trait]
impl Querier for ClientQuerier {
    async fn query(&self, request: &QueryRequest) -> Result<QueryResponse, BrokerError> {
        self.post(routes::QUERY, request).await
    }
}

#[async_trait]
impl ChangeSource for ClientQuerier {
    async fn fetch_changes(
        &self,
        after: u64,
        limit: usize,
    ) -> Result<Vec<ChangeEntry>, BrokerError> {
        self.changes_after(after, limit).await
    }
}

#[cfg(test)]
mod tests {
    use gatebroker_core::ErrorCode;

    use super::*;

    #[test]
    fn trailing_slash_is_normalized() {
        let client = ClientQuerier::new("http://broker:8080/");
        assert_eq!(client.url(routes::QUERY), "http://broker:8080/query");
    }

    #[test]
    fn bodiless_timeouts_are_retryable() {
        for status in [StatusCode::REQUEST_TIMEOUT, StatusCode::GATEWAY_TIMEOUT] {
            let err = bare_status_err(status);
            assert_eq!(err.code(), ErrorCode::Unavailable);
            assert!(err.is_retryable());
        }
        assert_eq!(
            bare_status_err(StatusCode::INTERNAL_SERVER_ERROR).code(),
            ErrorCode::Internal
        );
    }

    #[tokio::test]
    async fn middleware_timeout_decodes_as_unavailable() {
        use axum::routing::get;

        let app = axum::Router::new().route(
            "/server",
            get(|| async { axum::http::StatusCode::REQUEST_TIMEOUT }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let client = ClientQuerier::new(format!("http://127.0.0.1:{port}"));
        let err = client.server_info().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unavailable);
    }

    #[tokio::test]
    async fn unreachable_broker_is_unavailable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = ClientQuerier::new(format!("http://127.0.0.1:{port}"));
        let err = client.query(&QueryRequest::all("route")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unavailable);
    }
}
