//! Lease arbitration rules.
//!
//! A lease is a best-effort distributed mutex: at most one live holder per
//! name, renewable by that holder, and passively free once expired. No
//! sweeper exists; every acquire re-evaluates expiry against the clock.

use std::time::Duration;

use gatebroker_core::{BrokerError, Lease};

/// Outcome of evaluating an acquire against the current lease row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseDecision {
    /// The caller gets (or renews) the lease.
    Grant(Lease),
    /// Someone else holds a live lease.
    Held { holder: String, remaining_ms: u64 },
}

/// Decides an acquire of `name` by `holder` at `now`.
#[must_use]
pub fn decide(
    existing: Option<&Lease>,
    name: &str,
    holder: &str,
    expires_at: i64,
    now: i64,
) -> LeaseDecision {
    match existing {
        Some(lease) if lease.is_live(now) && lease.holder_id != holder => LeaseDecision::Held {
            holder: lease.holder_id.clone(),
            remaining_ms: lease.remaining_ms(now),
        },
        _ => LeaseDecision::Grant(Lease {
            name: name.to_string(),
            holder_id: holder.to_string(),
            expires_at,
        }),
    }
}

/// Computes the absolute expiry for a lease requested at `now`.
///
/// # Errors
///
/// Returns `INVALID_ARGUMENT` for a zero duration.
pub fn expiry_for(now: i64, duration: Duration) -> Result<i64, BrokerError> {
    if duration.is_zero() {
        return Err(BrokerError::InvalidArgument(
            "lease duration must be positive".to_string(),
        ));
    }
    let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
    Ok(now.saturating_add(millis))
}

impl LeaseDecision {
    /// Converts the decision into the operation result.
    ///
    /// # Errors
    ///
    /// Returns `ALREADY_HELD` when another holder owns a live lease.
    pub fn into_result(self, name: &str) -> Result<Lease, BrokerError> {
        match self {
            LeaseDecision::Grant(lease) => Ok(lease),
            LeaseDecision::Held {
                holder,
                remaining_ms,
            } => Err(BrokerError::AlreadyHeld {
                name: name.to_string(),
                holder,
                remaining_ms,
            }),
        }
    }
}
