use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::BrokerError;

/// Generic runtime value type for record payloads and filter literals.
///
/// Supports all JSON-compatible types plus binary data. Payloads are stored
/// as opaque `MsgPack` bytes (see [`Value::encode`]) and decoded only where
/// the filter engine needs to look inside them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// JSON null.
    Null,
    /// JSON boolean.
    Bool(bool),
    /// JSON integer (signed 64-bit).
    Int(i64),
    /// JSON floating-point (64-bit IEEE 754).
    Float(f64),
    /// JSON string (UTF-8).
    String(String),
    /// Binary data (not directly representable in JSON).
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
    /// JSON array (ordered sequence of values).
    Array(Vec<Value>),
    /// JSON object. Uses `BTreeMap` for deterministic serialization order.
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Builds a `Value::Map` from key/value pairs.
    #[must_use]
    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Serializes the value into its stored `MsgPack` form.
    ///
    /// # Errors
    ///
    /// Returns `INTERNAL` if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, BrokerError> {
        rmp_serde::to_vec_named(self)
            .map_err(|e| BrokerError::Internal(format!("failed to encode payload: {e}")))
    }

    /// Decodes a stored payload.
    ///
    /// # Errors
    ///
    /// Returns `INVALID_ARGUMENT` if the bytes are not a `MsgPack`-encoded `Value`.
    pub fn decode(bytes: &[u8]) -> Result<Self, BrokerError> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| BrokerError::InvalidArgument(format!("undecodable payload: {e}")))
    }

    /// Walks a field path through nested maps.
    ///
    /// Returns `None` as soon as a segment is missing or a non-map is reached.
    #[must_use]
    pub fn get_path<S: AsRef<str>>(&self, path: &[S]) -> Option<&Value> {
        let mut current = self;
        for segment in path {
            match current {
                Value::Map(fields) => current = fields.get(segment.as_ref())?,
                _ => return None,
            }
        }
        Some(current)
    }

    /// Returns the string content if this is a `Value::String`.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// Current-state row for one `(type, id)`.
///
/// `version` strictly increases on every successful mutation of the record.
/// Deleted records are tombstoned (`deleted_at` set) and retained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Record type, e.g. `"session"` or `"route"`.
    #[serde(rename = "type")]
    pub record_type: String,
    /// Identifier, unique within the type.
    pub id: String,
    /// Per-record version.
    pub version: u64,
    /// Opaque serialized payload.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    /// Millis since epoch of the last mutation.
    pub modified_at: i64,
    /// Millis since epoch of the soft-delete, if deleted.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub deleted_at: Option<i64>,
}

impl Record {
    /// Whether the record is a tombstone.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Decodes the payload.
    ///
    /// # Errors
    ///
    /// Returns `INVALID_ARGUMENT` if the payload is not a `MsgPack` `Value`.
    pub fn payload(&self) -> Result<Value, BrokerError> {
        Value::decode(&self.data)
    }
}

/// Immutable change-log row capturing one mutation.
///
/// `version` is the global sequence number assigned at commit and doubles as
/// the replication cursor. `record_version` is the record's own version after
/// the mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEntry {
    #[serde(rename = "type")]
    pub record_type: String,
    pub id: String,
    /// Global, monotonically increasing sequence number.
    pub version: u64,
    /// Version of the record after this mutation.
    pub record_version: u64,
    /// Snapshot of the payload at the time of the mutation.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    pub modified_at: i64,
    /// Set when this entry records a deletion (explicit or eviction).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub deleted_at: Option<i64>,
}

impl ChangeEntry {
    /// Whether this entry records a deletion.
    #[must_use]
    pub fn is_deletion(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Per-type options. A missing capacity means the type is unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordTypeOptions {
    #[serde(rename = "type")]
    pub record_type: String,
    /// Maximum number of live records for the type.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub capacity: Option<u64>,
}

/// A time-bounded mutual-exclusion grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub name: String,
    pub holder_id: String,
    /// Millis since epoch after which the lease is free.
    pub expires_at: i64,
}

impl Lease {
    /// A lease is live strictly before its expiry instant.
    #[must_use]
    pub fn is_live(&self, now: i64) -> bool {
        self.expires_at > now
    }

    /// Milliseconds until expiry, zero once expired.
    #[must_use]
    pub fn remaining_ms(&self, now: i64) -> u64 {
        u64::try_from(self.expires_at.saturating_sub(now)).unwrap_or(0)
    }
}
