//! Transactional storage backends for the broker.
//!
//! [`StorageBackend`] is the seam between the [`Broker`](crate::broker::Broker)
//! facade and the shared backing store. Every mutating method is one
//! all-or-nothing transaction covering the record upsert, the change-log
//! append, and capacity enforcement, so readers never observe a record
//! without its change entry or vice versa.
//!
//! Implementations:
//! - [`MemoryBackend`]: single-process store for tests and ephemeral deployments
//! - `PostgresBackend` (feature `postgres`): shared store for multi-instance deployments

pub mod memory;
pub mod migrations;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use gatebroker_core::{BrokerError, ChangeEntry, Lease, Record, RecordTypeOptions};

pub use memory::MemoryBackend;
pub use migrations::{Migration, MigrationState, MIGRATIONS};
#[cfg(feature = "postgres")]
pub use postgres::PostgresBackend;

/// A single record mutation as handed to the backend.
#[derive(Debug, Clone)]
pub struct RecordWrite {
    pub record_type: String,
    pub id: String,
    pub data: Vec<u8>,
    /// Explicit target version for replicated writes.
    pub version: Option<u64>,
}

/// Everything a committed mutation produced.
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    /// The record as written by this mutation.
    pub record: Record,
    /// The change entry appended for the mutation itself.
    pub change: ChangeEntry,
    /// Change entries of records evicted by capacity enforcement.
    pub evicted: Vec<ChangeEntry>,
}

impl WriteOutcome {
    /// Highest global version assigned by this transaction.
    #[must_use]
    pub fn last_version(&self) -> u64 {
        self.evicted
            .iter()
            .map(|c| c.version)
            .fold(self.change.version, u64::max)
    }
}

/// Shared transactional store behind the broker.
///
/// Used as `Arc<dyn StorageBackend>`.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short backend name for logs.
    fn kind(&self) -> &'static str;

    // --- Schema ---

    /// Creates the namespace and bookkeeping row if absent. Idempotent.
    async fn ensure_schema(&self) -> Result<MigrationState, BrokerError>;

    /// Applies `migrations` in order, each in its own transaction.
    ///
    /// Stops at the first failure with `SCHEMA_MISMATCH`.
    async fn apply_migrations(
        &self,
        migrations: &[Migration],
    ) -> Result<MigrationState, BrokerError>;

    // --- Records + change log ---

    /// Upserts a record, appends its change entry, and enforces capacity.
    async fn put(&self, write: RecordWrite, now: i64) -> Result<WriteOutcome, BrokerError>;

    /// Tombstones a live record and appends its change entry.
    async fn delete(
        &self,
        record_type: &str,
        id: &str,
        now: i64,
    ) -> Result<WriteOutcome, BrokerError>;

    /// Returns the current row for `(type, id)`, tombstones included.
    async fn get(&self, record_type: &str, id: &str) -> Result<Option<Record>, BrokerError>;

    /// Returns all rows of a type in ascending id order.
    async fn list(
        &self,
        record_type: &str,
        include_deleted: bool,
    ) -> Result<Vec<Record>, BrokerError>;

    /// Returns up to `limit` change entries with global version greater than `after`.
    async fn changes_after(&self, after: u64, limit: usize)
        -> Result<Vec<ChangeEntry>, BrokerError>;

    /// Highest assigned global version, 0 if the log is empty.
    async fn latest_version(&self) -> Result<u64, BrokerError>;

    // --- Options ---

    /// Stores the options row and enforces the new capacity.
    async fn set_options(
        &self,
        options: RecordTypeOptions,
        now: i64,
    ) -> Result<Vec<ChangeEntry>, BrokerError>;

    /// Returns the options for a type, unbounded when no row exists.
    async fn get_options(&self, record_type: &str) -> Result<RecordTypeOptions, BrokerError>;

    // --- Leases ---

    /// Grants or renews `name` to `holder` until `expires_at`.
    async fn acquire_lease(
        &self,
        name: &str,
        holder: &str,
        expires_at: i64,
        now: i64,
    ) -> Result<Lease, BrokerError>;

    /// Clears `name` if `holder` holds it. Returns whether anything was released.
    async fn release_lease(&self, name: &str, holder: &str) -> Result<bool, BrokerError>;
}

/// Highest record version any backend stores. PostgreSQL keeps versions in
/// `BIGINT`, so the memory backend accepts the same range.
#[allow(clippy::cast_sign_loss)]
pub const MAX_RECORD_VERSION: u64 = i64::MAX as u64;

/// Computes the version for a write against the current row.
///
/// # Errors
///
/// Returns `INVALID_ARGUMENT` when an explicit version is above
/// [`MAX_RECORD_VERSION`], and `CONFLICT` when it does not exceed the current
/// one or the current version is already the last storable one.
pub fn next_version(
    record_type: &str,
    id: &str,
    current: Option<u64>,
    requested: Option<u64>,
) -> Result<u64, BrokerError> {
    let current = current.unwrap_or(0);
    match requested {
        None => bump_version(record_type, id, current),
        Some(v) if v > MAX_RECORD_VERSION => Err(BrokerError::InvalidArgument(format!(
            "{record_type}/{id}: version {v} exceeds the maximum {MAX_RECORD_VERSION}"
        ))),
        Some(v) if v > current => Ok(v),
        Some(v) => Err(BrokerError::Conflict(format!(
            "{record_type}/{id}: requested version {v} is not greater than current version {current}"
        ))),
    }
}

/// The version following `current`, for implicit writes and tombstones.
///
/// # Errors
///
/// Returns `CONFLICT` once the record has reached [`MAX_RECORD_VERSION`].
pub fn bump_version(record_type: &str, id: &str, current: u64) -> Result<u64, BrokerError> {
    current
        .checked_add(1)
        .filter(|v| *v <= MAX_RECORD_VERSION)
        .ok_or_else(|| {
            BrokerError::Conflict(format!(
                "{record_type}/{id}: version {current} is the last storable version"
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn implicit_versions_increment() {
        assert_eq!(next_version("t", "a", None, None).unwrap(), 1);
        assert_eq!(next_version("t", "a", Some(7), None).unwrap(), 8);
    }

    #[test]
    fn explicit_versions_may_jump_but_not_regress() {
        assert_eq!(next_version("t", "a", Some(2), Some(10)).unwrap(), 10);
        assert!(matches!(
            next_version("t", "a", Some(10), Some(10)),
            Err(BrokerError::Conflict(_))
        ));
        assert!(matches!(
            next_version("t", "a", Some(10), Some(3)),
            Err(BrokerError::Conflict(_))
        ));
    }

    #[test]
    fn versions_stay_within_storable_range() {
        assert!(matches!(
            next_version("t", "a", None, Some(u64::MAX)),
            Err(BrokerError::InvalidArgument(_))
        ));
        assert_eq!(
            next_version("t", "a", None, Some(MAX_RECORD_VERSION)).unwrap(),
            MAX_RECORD_VERSION
        );
        assert!(matches!(
            next_version("t", "a", Some(MAX_RECORD_VERSION), None),
            Err(BrokerError::Conflict(_))
        ));
        assert!(matches!(
            bump_version("t", "a", u64::MAX),
            Err(BrokerError::Conflict(_))
        ));
        assert_eq!(bump_version("t", "a", 4).unwrap(), 5);
    }
}
