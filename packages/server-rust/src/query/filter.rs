//! Evaluation of compiled filter expressions against records.

use gatebroker_core::filter::ID_FIELD;
use gatebroker_core::{BrokerError, FilterExpression, Record, Value};

/// A validated filter, ready to evaluate.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompiledFilter {
    expr: Option<FilterExpression>,
}

impl CompiledFilter {
    /// Parses a filter document. `None` matches every record.
    ///
    /// # Errors
    ///
    /// Returns `INVALID_ARGUMENT` for malformed documents.
    pub fn compile(doc: Option<&Value>) -> Result<Self, BrokerError> {
        let expr = doc.map(FilterExpression::from_document).transpose()?;
        Ok(Self { expr })
    }

    /// Whether evaluation needs the decoded payload.
    #[must_use]
    pub fn needs_payload(&self) -> bool {
        self.expr.as_ref().is_some_and(reads_payload)
    }

    /// Evaluates the filter.
    ///
    /// `payload` is the decoded record data, or `None` when it could not be
    /// decoded; payload paths never match in that case.
    #[must_use]
    pub fn matches(&self, record: &Record, payload: Option<&Value>) -> bool {
        self.expr
            .as_ref()
            .is_none_or(|expr| eval(expr, record, payload))
    }
}

fn reads_payload(expr: &FilterExpression) -> bool {
    match expr {
        FilterExpression::And(children) | FilterExpression::Or(children) => {
            children.iter().any(reads_payload)
        }
        FilterExpression::Not(child) => reads_payload(child),
        FilterExpression::Equals { path, .. } => !is_id_path(path),
    }
}

fn is_id_path(path: &[String]) -> bool {
    path.len() == 1 && path[0] == ID_FIELD
}

fn eval(expr: &FilterExpression, record: &Record, payload: Option<&Value>) -> bool {
    match expr {
        FilterExpression::And(children) => children.iter().all(|c| eval(c, record, payload)),
        FilterExpression::Or(children) => children.iter().any(|c| eval(c, record, payload)),
        FilterExpression::Not(child) => !eval(child, record, payload),
        FilterExpression::Equals { path, value } if is_id_path(path) => {
            value.as_str() == Some(record.id.as_str())
        }
        FilterExpression::Equals { path, value } => payload
            .and_then(|p| p.get_path(path))
            .is_some_and(|found| literal_eq(found, value)),
    }
}

/// Equality between a payload value and a filter literal.
///
/// Integers and floats compare numerically; everything else structurally.
#[allow(clippy::cast_precision_loss, clippy::float_cmp)]
fn literal_eq(found: &Value, literal: &Value) -> bool {
    match (found, literal) {
        (Value::Int(i), Value::Float(f)) | (Value::Float(f), Value::Int(i)) => *i as f64 == *f,
        _ => found == literal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, payload: &Value) -> Record {
        Record {
            record_type: "session".to_string(),
            id: id.to_string(),
            version: 1,
            data: payload.encode().unwrap(),
            modified_at: 0,
            deleted_at: None,
        }
    }

    fn check(filter: &Value, id: &str, payload: &Value) -> bool {
        let compiled = CompiledFilter::compile(Some(filter)).unwrap();
        compiled.matches(&record(id, payload), Some(payload))
    }

    fn session() -> Value {
        Value::map([
            ("user", Value::map([("email", Value::from("a@example.com"))])),
            ("count", Value::Int(3)),
            ("active", Value::Bool(true)),
        ])
    }

    #[test]
    fn absent_filter_matches_everything() {
        let compiled = CompiledFilter::compile(None).unwrap();
        assert!(!compiled.needs_payload());
        assert!(compiled.matches(&record("x", &Value::Null), None));
    }

    #[test]
    fn nested_path_equality() {
        let filter = Value::map([("user.email", Value::from("a@example.com"))]);
        assert!(check(&filter, "s1", &session()));

        let other = Value::map([("user.email", Value::from("b@example.com"))]);
        assert!(!check(&other, "s1", &session()));
    }

    #[test]
    fn missing_path_never_matches() {
        let filter = Value::map([("user.name", Value::Null)]);
        assert!(!check(&filter, "s1", &session()));

        let through_scalar = Value::map([("count.low", Value::Int(3))]);
        assert!(!check(&through_scalar, "s1", &session()));
    }

    #[test]
    fn integers_and_floats_compare_numerically() {
        let filter = Value::map([("count", Value::Float(3.0))]);
        assert!(check(&filter, "s1", &session()));
        let miss = Value::map([("count", Value::Float(3.5))]);
        assert!(!check(&miss, "s1", &session()));
    }

    #[test]
    fn strings_do_not_coerce() {
        let filter = Value::map([("count", Value::from("3"))]);
        assert!(!check(&filter, "s1", &session()));
    }

    #[test]
    fn id_filter_skips_payload() {
        let filter = Value::map([("$id", Value::from("s1"))]);
        let compiled = CompiledFilter::compile(Some(&filter)).unwrap();
        assert!(!compiled.needs_payload());
        assert!(compiled.matches(&record("s1", &Value::Null), None));
        assert!(!compiled.matches(&record("s2", &Value::Null), None));
    }

    #[test]
    fn boolean_composition() {
        let filter = Value::map([(
            "$or",
            Value::Array(vec![
                Value::map([("$id", Value::from("nope"))]),
                Value::map([("$not", Value::map([("active", Value::Bool(false))]))]),
            ]),
        )]);
        assert!(check(&filter, "s1", &session()));

        let both = Value::map([
            ("active", Value::Bool(true)),
            ("count", Value::Int(4)),
        ]);
        assert!(!check(&both, "s1", &session()));
    }

    #[test]
    fn undecodable_payload_fails_payload_terms() {
        let filter = Value::map([("active", Value::Bool(true))]);
        let compiled = CompiledFilter::compile(Some(&filter)).unwrap();
        assert!(compiled.needs_payload());
        assert!(!compiled.matches(&record("s1", &session()), None));
    }

    #[test]
    fn malformed_documents_are_rejected() {
        let err = CompiledFilter::compile(Some(&Value::Int(1))).unwrap_err();
        assert_eq!(err.code(), gatebroker_core::ErrorCode::InvalidArgument);
        let unknown = Value::map([("$gt", Value::Int(1))]);
        assert!(CompiledFilter::compile(Some(&unknown)).is_err());
    }
}
