//! Free-text matching.
//!
//! Best effort: a case-insensitive substring search over the record id and
//! every scalar reachable in the decoded payload. Binary values are skipped.

use gatebroker_core::{Record, Value};

/// A lowercased search term. Blank input means no text constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextQuery {
    needle: String,
}

impl TextQuery {
    /// Returns `None` for blank terms.
    #[must_use]
    pub fn new(term: &str) -> Option<Self> {
        let term = term.trim();
        if term.is_empty() {
            None
        } else {
            Some(Self {
                needle: term.to_lowercase(),
            })
        }
    }

    /// Whether the record id or any payload scalar contains the term.
    #[must_use]
    pub fn matches(&self, record: &Record, payload: Option<&Value>) -> bool {
        self.contained_in(&record.id) || payload.is_some_and(|p| self.value_matches(p))
    }

    fn contained_in(&self, haystack: &str) -> bool {
        haystack.to_lowercase().contains(&self.needle)
    }

    fn value_matches(&self, value: &Value) -> bool {
        match value {
            Value::Null | Value::Bytes(_) => false,
            Value::Bool(b) => self.contained_in(&b.to_string()),
            Value::Int(n) => self.contained_in(&n.to_string()),
            Value::Float(f) => self.contained_in(&f.to_string()),
            Value::String(s) => self.contained_in(s),
            Value::Array(items) => items.iter().any(|v| self.value_matches(v)),
            Value::Map(fields) => fields.values().any(|v| self.value_matches(v)),
        }
    }
}
