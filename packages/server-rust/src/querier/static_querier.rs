use async_trait::async_trait;
use gatebroker_core::{
    BrokerError, ClockSource, Querier, QueryRequest, QueryResponse, Record, SystemClock, Value,
};
use uuid::Uuid;

use crate::query;

/// In-memory querier over a fixed record set.
///
/// Used for tests and for callers that resolve queries against literal
/// fixtures instead of a broker.
#[derive(Debug, Clone, Default)]
pub struct StaticQuerier {
    records: Vec<Record>,
}

impl StaticQuerier {
    /// Serves exactly `records`.
    #[must_use]
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    /// Builds records from `(type, payload)` pairs.
    ///
    /// Each record's id is the payload's string `id` field when present,
    /// otherwise a fresh UUID. Versions are random and timestamps are now.
    ///
    /// # Errors
    ///
    /// Returns `INTERNAL` if a payload cannot be encoded.
    pub fn from_payloads<T, I>(items: I) -> Result<Self, BrokerError>
    where
        T: Into<String>,
        I: IntoIterator<Item = (T, Value)>,
    {
        Self::from_payloads_at(items, &SystemClock)
    }

    /// Like [`Self::from_payloads`] with an explicit clock.
    ///
    /// # Errors
    ///
    /// Returns `INTERNAL` if a payload cannot be encoded.
    pub fn from_payloads_at<T, I>(items: I, clock: &dyn ClockSource) -> Result<Self, BrokerError>
    where
        T: Into<String>,
        I: IntoIterator<Item = (T, Value)>,
    {
        let now = clock.now_millis();
        let records = items
            .into_iter()
            .map(|(record_type, payload)| {
                let id = payload
                    .get_path(&["id"])
                    .and_then(Value::as_str)
                    .map_or_else(|| Uuid::new_v4().to_string(), str::to_string);
                Ok(Record {
                    record_type: record_type.into(),
                    id,
                    version: rand::random(),
                    data: payload.encode()?,
                    modified_at: now,
                    deleted_at: None,
                })
            })
            .collect::<Result<Vec<_>, BrokerError>>()?;
        Ok(Self { records })
    }

    /// The records this querier serves.
    #[must_use]
    pub fn records(&self) -> &[Record] {
        &self.records
    }
}

#[async_trait]
impl Querier for StaticQuerier {
    async fn query(&self, request: &QueryRequest) -> Result<QueryResponse, BrokerError> {
        query::execute(self.records.iter().cloned(), request)
    }
}
