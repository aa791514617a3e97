//! Filter expression tree and its document wire format.
//!
//! Filters travel as generic nested documents ([`Value::Map`]), independent of
//! the storage backend:
//!
//! - `{"$and": [doc, ...]}`, `{"$or": [doc, ...]}`, `{"$not": doc}`
//! - `{"user.email": literal}` or `{"user": {"email": literal}}` compare a
//!   payload field path against a literal
//! - `{"user": {"$eq": literal}}` compares the whole sub-document
//! - `{"$id": "abc"}` compares the record id
//!
//! Several keys in one document are AND-ed in sorted key order.

use crate::error::BrokerError;
use crate::types::Value;

/// Reserved path segment that addresses the record id instead of the payload.
pub const ID_FIELD: &str = "$id";

/// A parsed boolean filter expression.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpression {
    /// All children must match. An empty list matches everything.
    And(Vec<FilterExpression>),
    /// At least one child must match. An empty list matches nothing.
    Or(Vec<FilterExpression>),
    /// Negation of the child.
    Not(Box<FilterExpression>),
    /// The value at `path` equals `value`.
    Equals { path: Vec<String>, value: Value },
}

impl FilterExpression {
    /// Builds an `Equals` node from a dotted path.
    #[must_use]
    pub fn equals(path: &str, value: impl Into<Value>) -> Self {
        FilterExpression::Equals {
            path: path.split('.').map(str::to_string).collect(),
            value: value.into(),
        }
    }

    /// Parses a filter document.
    ///
    /// # Errors
    ///
    /// Returns `INVALID_ARGUMENT` for non-map documents, unknown `$` operators,
    /// wrongly typed operands, or empty path segments.
    pub fn from_document(doc: &Value) -> Result<Self, BrokerError> {
        let Value::Map(fields) = doc else {
            return Err(invalid("filter must be a document"));
        };

        let mut terms = Vec::with_capacity(fields.len());
        for (key, value) in fields {
            let term = match key.as_str() {
                "$and" => FilterExpression::And(parse_list(key, value)?),
                "$or" => FilterExpression::Or(parse_list(key, value)?),
                "$not" => FilterExpression::Not(Box::new(Self::from_document(value)?)),
                ID_FIELD => match value {
                    Value::String(_) => FilterExpression::Equals {
                        path: vec![ID_FIELD.to_string()],
                        value: value.clone(),
                    },
                    _ => return Err(invalid(format!("{ID_FIELD} expects a string literal"))),
                },
                op if op.starts_with('$') => {
                    return Err(invalid(format!("unknown operator {op}")));
                }
                field => equals_from_value(split_path(field)?, value)?,
            };
            terms.push(term);
        }

        Ok(collapse(terms))
    }

    /// Renders the expression back into its document form.
    #[must_use]
    pub fn to_document(&self) -> Value {
        match self {
            FilterExpression::And(children) => Value::map([(
                "$and",
                Value::Array(children.iter().map(Self::to_document).collect()),
            )]),
            FilterExpression::Or(children) => Value::map([(
                "$or",
                Value::Array(children.iter().map(Self::to_document).collect()),
            )]),
            FilterExpression::Not(child) => Value::map([("$not", child.to_document())]),
            FilterExpression::Equals { path, value } if path.len() == 1 && path[0] == ID_FIELD => {
                Value::map([(ID_FIELD, value.clone())])
            }
            FilterExpression::Equals { path, value } => {
                Value::map([(path.join("."), Value::map([("$eq", value.clone())]))])
            }
        }
    }
}

fn invalid(message: impl Into<String>) -> BrokerError {
    BrokerError::InvalidArgument(message.into())
}

fn parse_list(op: &str, value: &Value) -> Result<Vec<FilterExpression>, BrokerError> {
    let Value::Array(items) = value else {
        return Err(invalid(format!("{op} expects a list of documents")));
    };
    items.iter().map(FilterExpression::from_document).collect()
}

fn split_path(field: &str) -> Result<Vec<String>, BrokerError> {
    let segments: Vec<String> = field.split('.').map(str::to_string).collect();
    if segments.iter().any(String::is_empty) {
        return Err(invalid(format!("empty segment in field path {field:?}")));
    }
    Ok(segments)
}

/// A map operand either holds `$eq` or descends into nested field names.
fn equals_from_value(path: Vec<String>, value: &Value) -> Result<FilterExpression, BrokerError> {
    let Value::Map(fields) = value else {
        return Ok(FilterExpression::Equals {
            path,
            value: value.clone(),
        });
    };

    if let Some(literal) = fields.get("$eq") {
        if fields.len() != 1 {
            return Err(invalid("$eq cannot be combined with other keys"));
        }
        return Ok(FilterExpression::Equals {
            path,
            value: literal.clone(),
        });
    }

    if fields.is_empty() {
        return Err(invalid(format!(
            "empty document for field {:?}; use $eq to match an empty map",
            path.join(".")
        )));
    }

    let mut terms = Vec::with_capacity(fields.len());
    for (key, nested) in fields {
        if key.starts_with('$') {
            return Err(invalid(format!("unknown operator {key}")));
        }
        let mut nested_path = path.clone();
        nested_path.extend(split_path(key)?);
        terms.push(equals_from_value(nested_path, nested)?);
    }
    Ok(collapse(terms))
}

fn collapse(mut terms: Vec<FilterExpression>) -> FilterExpression {
    if terms.len() == 1 {
        terms.remove(0)
    } else {
        FilterExpression::And(terms)
    }
}
