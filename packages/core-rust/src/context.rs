use std::fmt;
use std::sync::Arc;

use crate::traits::{NilQuerier, Querier};

/// Per-request context carrying identity, tracing, and the querier in use.
///
/// Passed explicitly through the layers that need read access to broker
/// records, so none of them has to be wired to a concrete querier.
#[derive(Clone, Default)]
pub struct RequestContext {
    /// Identifier of the node handling this request.
    pub node_id: String,
    /// Distributed trace identifier for observability.
    pub trace_id: String,
    querier: Option<Arc<dyn Querier>>,
}

impl RequestContext {
    /// Creates a context with no querier attached.
    #[must_use]
    pub fn new(node_id: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            trace_id: trace_id.into(),
            querier: None,
        }
    }

    /// Returns a copy of this context that resolves queries through `querier`.
    #[must_use]
    pub fn with_querier(&self, querier: Arc<dyn Querier>) -> Self {
        Self {
            querier: Some(querier),
            ..self.clone()
        }
    }

    /// Returns the attached querier, or [`NilQuerier`] when none is set.
    #[must_use]
    pub fn querier(&self) -> Arc<dyn Querier> {
        match &self.querier {
            Some(q) => Arc::clone(q),
            None => Arc::new(NilQuerier),
        }
    }

    /// Whether a querier has been attached.
    #[must_use]
    pub fn has_querier(&self) -> bool {
        self.querier.is_some()
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("node_id", &self.node_id)
            .field("trace_id", &self.trace_id)
            .field("has_querier", &self.has_querier())
            .finish()
    }
}
