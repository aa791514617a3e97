//! Request and response messages for the broker API.
//!
//! All structs use `#[serde(rename_all = "camelCase")]` and travel as named
//! `MsgPack` (`rmp_serde::to_vec_named()`) over the HTTP boundary.

use serde::{Deserialize, Serialize};

use crate::types::{Record, Value};

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// A read over one record type.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    #[serde(rename = "type")]
    pub record_type: String,
    /// Filter document, see [`FilterExpression`](crate::filter::FilterExpression).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub filter: Option<Value>,
    /// Free-text term. Empty means no text constraint.
    #[serde(default)]
    pub query: String,
    /// 0-based offset into the ordered match set.
    #[serde(default)]
    pub offset: i64,
    /// Page size. Zero or negative returns the remainder.
    #[serde(default)]
    pub limit: i64,
}

impl QueryRequest {
    /// A request for every live record of a type.
    #[must_use]
    pub fn all(record_type: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            ..Self::default()
        }
    }

    /// Sets the filter document.
    #[must_use]
    pub fn with_filter(mut self, filter: Value) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Sets the free-text term.
    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.query = text.into();
        self
    }

    /// Sets offset and limit.
    #[must_use]
    pub fn with_page(mut self, offset: i64, limit: i64) -> Self {
        self.offset = offset;
        self.limit = limit;
        self
    }
}

/// One page of query results plus the pre-pagination match count.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub records: Vec<Record>,
    pub total_count: u64,
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Upsert of one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutRequest {
    #[serde(rename = "type")]
    pub record_type: String,
    pub id: String,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    /// Explicit target version for replicated writes. Must exceed the current version.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub version: Option<u64>,
}

/// Addresses one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetRequest {
    #[serde(rename = "type")]
    pub record_type: String,
    pub id: String,
    /// Return tombstoned records instead of `NOT_FOUND`.
    #[serde(default)]
    pub include_deleted: bool,
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Addresses the options of one record type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionsRequest {
    #[serde(rename = "type")]
    pub record_type: String,
}

// ---------------------------------------------------------------------------
// Leases
// ---------------------------------------------------------------------------

/// Acquire or renew a lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcquireLeaseRequest {
    pub name: String,
    pub holder_id: String,
    pub duration_ms: u64,
}

/// Release a lease held by `holder_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseLeaseRequest {
    pub name: String,
    pub holder_id: String,
}

/// Outcome of a release. `released` is false for stale releases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseLeaseResponse {
    pub released: bool,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Identity and replication position of a broker deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub server_incarnation_id: u64,
    pub latest_version: u64,
}
