use async_trait::async_trait;

use crate::error::BrokerError;
use crate::messages::{QueryRequest, QueryResponse};

/// Read-only query interface over broker records.
///
/// Implementations: the broker itself (in-process), a static fixture, an
/// HTTP client forwarding to a central broker, and a tracing decorator.
///
/// Used as `Arc<dyn Querier>`.
#[async_trait]
pub trait Querier: Send + Sync {
    /// Returns one page of matching records and the total match count.
    async fn query(&self, request: &QueryRequest) -> Result<QueryResponse, BrokerError>;
}

/// Querier used when none is configured. Always fails with `UNIMPLEMENTED`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NilQuerier;

#[async_trait]
impl Querier for NilQuerier {
    async fn query(&self, request: &QueryRequest) -> Result<QueryResponse, BrokerError> {
        Err(BrokerError::Unimplemented(format!(
            "no querier configured for {} query",
            request.record_type
        )))
    }
}
