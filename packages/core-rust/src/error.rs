//! Error taxonomy shared by every broker operation.
//!
//! Each public operation returns either a complete result or exactly one
//! [`BrokerError`]. [`ErrorCode`] is the transport-stable discriminant used
//! when errors cross the HTTP boundary.

use serde::{Deserialize, Serialize};

/// Transport-stable error discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotFound,
    Conflict,
    AlreadyHeld,
    InvalidArgument,
    Unavailable,
    Internal,
    SchemaMismatch,
    Unimplemented,
}

impl ErrorCode {
    /// Returns the wire name of the code.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::AlreadyHeld => "ALREADY_HELD",
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::Internal => "INTERNAL",
            ErrorCode::SchemaMismatch => "SCHEMA_MISMATCH",
            ErrorCode::Unimplemented => "UNIMPLEMENTED",
        }
    }
}

/// Errors returned by broker operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// Missing type, id, lease, or other target.
    #[error("not found: {0}")]
    NotFound(String),
    /// Version mismatch on write. Re-read and retry.
    #[error("version conflict: {0}")]
    Conflict(String),
    /// Lease contention. Back off and retry.
    #[error("lease {name} is held by {holder} for another {remaining_ms}ms")]
    AlreadyHeld {
        name: String,
        holder: String,
        remaining_ms: u64,
    },
    /// Malformed filter, pagination, or identifiers. The caller must fix the input.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Backing store unreachable or deadline exceeded. Retryable.
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// Unexpected backing-store failure.
    #[error("internal error: {0}")]
    Internal(String),
    /// Persisted schema state does not match what the code expects. Fatal.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),
    /// No implementation is configured for the call site.
    #[error("unimplemented: {0}")]
    Unimplemented(String),
}

impl BrokerError {
    /// Returns the transport-stable code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            BrokerError::NotFound(_) => ErrorCode::NotFound,
            BrokerError::Conflict(_) => ErrorCode::Conflict,
            BrokerError::AlreadyHeld { .. } => ErrorCode::AlreadyHeld,
            BrokerError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            BrokerError::Unavailable(_) => ErrorCode::Unavailable,
            BrokerError::Internal(_) => ErrorCode::Internal,
            BrokerError::SchemaMismatch(_) => ErrorCode::SchemaMismatch,
            BrokerError::Unimplemented(_) => ErrorCode::Unimplemented,
        }
    }

    /// Whether a caller may retry the same request unchanged after a backoff.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::Unavailable(_) | BrokerError::AlreadyHeld { .. }
        )
    }

    /// Converts the error into its wire form.
    #[must_use]
    pub fn to_body(&self) -> ErrorBody {
        let (message, holder, remaining_ms, lease) = match self {
            BrokerError::NotFound(m)
            | BrokerError::Conflict(m)
            | BrokerError::InvalidArgument(m)
            | BrokerError::Unavailable(m)
            | BrokerError::Internal(m)
            | BrokerError::SchemaMismatch(m)
            | BrokerError::Unimplemented(m) => (m.clone(), None, None, None),
            BrokerError::AlreadyHeld {
                name,
                holder,
                remaining_ms,
            } => (
                self.to_string(),
                Some(holder.clone()),
                Some(*remaining_ms),
                Some(name.clone()),
            ),
        };
        ErrorBody {
            code: self.code(),
            message,
            lease,
            holder,
            remaining_ms,
        }
    }

    /// Rebuilds the error from its wire form.
    #[must_use]
    pub fn from_body(body: ErrorBody) -> Self {
        match body.code {
            ErrorCode::NotFound => BrokerError::NotFound(body.message),
            ErrorCode::Conflict => BrokerError::Conflict(body.message),
            ErrorCode::AlreadyHeld => BrokerError::AlreadyHeld {
                name: body.lease.unwrap_or_default(),
                holder: body.holder.unwrap_or_default(),
                remaining_ms: body.remaining_ms.unwrap_or_default(),
            },
            ErrorCode::InvalidArgument => BrokerError::InvalidArgument(body.message),
            ErrorCode::Unavailable => BrokerError::Unavailable(body.message),
            ErrorCode::Internal => BrokerError::Internal(body.message),
            ErrorCode::SchemaMismatch => BrokerError::SchemaMismatch(body.message),
            ErrorCode::Unimplemented => BrokerError::Unimplemented(body.message),
        }
    }
}

/// Wire representation of a [`BrokerError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub lease: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub holder: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub remaining_ms: Option<u64>,
}
