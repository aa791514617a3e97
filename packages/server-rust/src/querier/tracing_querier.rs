use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use gatebroker_core::{BrokerError, Querier, QueryRequest, QueryResponse};
use parking_lot::Mutex;
use tracing::debug;

/// Decorator recording every query issued through it, in issue order.
///
/// Results and errors from the wrapped querier are passed through untouched.
pub struct TracingQuerier {
    inner: Arc<dyn Querier>,
    traces: Mutex<Vec<QueryRequest>>,
}

impl TracingQuerier {
    #[must_use]
    pub fn new(inner: Arc<dyn Querier>) -> Self {
        Self {
            inner,
            traces: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of the recorded requests.
    #[must_use]
    pub fn traces(&self) -> Vec<QueryRequest> {
        self.traces.lock().clone()
    }

    /// Clears and returns the recorded requests.
    pub fn take_traces(&self) -> Vec<QueryRequest> {
        std::mem::take(&mut *self.traces.lock())
    }
}

impl std::fmt::Debug for TracingQuerier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracingQuerier")
            .field("traces", &self.traces.lock().len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Querier for TracingQuerier {
    async fn query(&self, request: &QueryRequest) -> Result<QueryResponse, BrokerError> {
        self.traces.lock().push(request.clone());

        let started = Instant::now();
        let result = self.inner.query(request).await;
        debug!(
            record_type = %request.record_type,
            elapsed_us = started.elapsed().as_micros(),
            ok = result.is_ok(),
            "query"
        );
        result
    }
}
