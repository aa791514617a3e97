//! Filter/query engine.
//!
//! A [`QueryPlan`] is compiled from a [`QueryRequest`] before any I/O, so
//! malformed filters and pagination fail with `INVALID_ARGUMENT` up front.
//! Execution filters by type and deletion state, applies the boolean filter
//! and the free-text term, orders by ascending id, and paginates.

pub mod filter;
pub mod paginate;
pub mod text;

use gatebroker_core::{BrokerError, QueryRequest, QueryResponse, Record};

pub use filter::CompiledFilter;
pub use paginate::Page;
pub use text::TextQuery;

/// A validated, executable query.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    record_type: String,
    filter: CompiledFilter,
    text: Option<TextQuery>,
    page: Page,
}

impl QueryPlan {
    /// Validates and compiles a request.
    ///
    /// # Errors
    ///
    /// Returns `INVALID_ARGUMENT` for an empty type, a malformed filter, or a
    /// negative offset.
    pub fn compile(request: &QueryRequest) -> Result<Self, BrokerError> {
        if request.record_type.is_empty() {
            return Err(BrokerError::InvalidArgument(
                "query type must not be empty".to_string(),
            ));
        }
        Ok(Self {
            record_type: request.record_type.clone(),
            filter: CompiledFilter::compile(request.filter.as_ref())?,
            text: TextQuery::new(&request.query),
            page: Page::new(request.offset, request.limit)?,
        })
    }

    /// Whether a live record of the queried type satisfies filter and text.
    ///
    /// Records whose payload cannot be decoded only match constraints that
    /// do not look inside the payload.
    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        if record.record_type != self.record_type || record.is_deleted() {
            return false;
        }
        let payload = if self.filter.needs_payload() || self.text.is_some() {
            record.payload().ok()
        } else {
            None
        };
        self.filter.matches(record, payload.as_ref())
            && self
                .text
                .as_ref()
                .is_none_or(|text| text.matches(record, payload.as_ref()))
    }

    /// Runs the plan over candidate records.
    #[must_use]
    pub fn execute<I>(&self, records: I) -> QueryResponse
    where
        I: IntoIterator<Item = Record>,
    {
        let mut matched: Vec<Record> = records.into_iter().filter(|r| self.matches(r)).collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        let (records, total_count) = self.page.apply(matched);
        QueryResponse {
            records,
            total_count,
        }
    }
}

/// Compiles and runs `request` over `records` in one step.
///
/// # Errors
///
/// See [`QueryPlan::compile`].
pub fn execute<I>(records: I, request: &QueryRequest) -> Result<QueryResponse, BrokerError>
where
    I: IntoIterator<Item = Record>,
{
    Ok(QueryPlan::compile(request)?.execute(records))
}

#[cfg(test)]
mod tests {
    use gatebroker_core::Value;

    use super::*;

    fn route(id: &str, host: &str, deleted: bool) -> Record {
        Record {
            record_type: "route".to_string(),
            id: id.to_string(),
            version: 1,
            data: Value::map([("host", Value::from(host))]).encode().unwrap(),
            modified_at: 0,
            deleted_at: deleted.then_some(5),
        }
    }

    fn fixture() -> Vec<Record> {
        vec![
            route("c", "c.example.com", false),
            route("a", "a.example.com", false),
            route("b", "b.internal", false),
            route("d", "d.example.com", true),
            Record {
                record_type: "session".to_string(),
                ..route("e", "e.example.com", false)
            },
        ]
    }

    #[test]
    fn orders_by_id_and_excludes_deleted_and_other_types() {
        let res = execute(fixture(), &QueryRequest::all("route")).unwrap();
        let ids: Vec<&str> = res.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(res.total_count, 3);
    }

    #[test]
    fn text_and_filter_combine() {
        let request = QueryRequest::all("route")
            .with_text("EXAMPLE")
            .with_filter(Value::map([(
                "$not",
                Value::map([("host", Value::from("a.example.com"))]),
            )]));
        let res = execute(fixture(), &request).unwrap();
        assert_eq!(res.total_count, 1);
        assert_eq!(res.records[0].id, "c");
    }

    #[test]
    fn total_count_ignores_paging() {
        let res = execute(fixture(), &QueryRequest::all("route").with_page(1, 1)).unwrap();
        assert_eq!(res.total_count, 3);
        assert_eq!(res.records.len(), 1);
        assert_eq!(res.records[0].id, "b");
    }

    #[test]
    fn undecodable_payload_only_matches_id_constraints() {
        let broken = Record {
            data: vec![0xc1],
            ..route("x", "", false)
        };
        let by_id = QueryRequest::all("route").with_filter(Value::map([("$id", Value::from("x"))]));
        assert_eq!(execute(vec![broken.clone()], &by_id).unwrap().total_count, 1);

        let by_field =
            QueryRequest::all("route").with_filter(Value::map([("host", Value::from(""))]));
        assert_eq!(execute(vec![broken.clone()], &by_field).unwrap().total_count, 0);

        assert_eq!(
            execute(vec![broken], &QueryRequest::all("route").with_text("x"))
                .unwrap()
                .total_count,
            1
        );
    }

    #[test]
    fn validation_happens_before_execution() {
        assert!(QueryPlan::compile(&QueryRequest::all("")).is_err());
        assert!(QueryPlan::compile(&QueryRequest::all("route").with_page(-2, 1)).is_err());
        let bad = QueryRequest::all("route").with_filter(Value::Array(Vec::new()));
        assert!(QueryPlan::compile(&bad).is_err());
    }
}
