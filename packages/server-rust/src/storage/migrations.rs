//! Forward-only schema migrations and the bookkeeping they advance.
//!
//! Migrations form an ordered list; `Migration::version` equals its 1-based
//! position. The persisted `applied` index names the last migration that
//! committed. Each step runs in its own transaction together with the index
//! update, and the sequence stops at the first failure.

use gatebroker_core::BrokerError;

/// Namespace holding every broker table.
pub const SCHEMA_NAME: &str = "gatebroker";

/// Persisted bookkeeping row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationState {
    /// Random id generated once when the bookkeeping row is created.
    ///
    /// Only a uniqueness hint: it is 32 bits wide, so distinct deployments
    /// can collide.
    pub server_incarnation_id: u64,
    /// Version of the last applied migration (0 = none).
    pub applied: u32,
}

/// One forward-only schema step.
#[derive(Debug)]
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    /// SQL statements executed in order inside the migration's transaction.
    pub statements: &'static [&'static str],
}

/// Every known migration, ascending.
pub static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_core_tables",
        statements: &[
            "CREATE TABLE gatebroker.records (
                type TEXT NOT NULL,
                id TEXT NOT NULL,
                version BIGINT NOT NULL,
                data BYTEA NOT NULL,
                modified_at TIMESTAMPTZ NOT NULL DEFAULT(NOW()),
                deleted_at TIMESTAMPTZ NULL,

                index_cidr INET NULL,

                PRIMARY KEY (type, id)
            )",
            "CREATE INDEX ON gatebroker.records USING gist (index_cidr inet_ops)",
            "CREATE TABLE gatebroker.record_changes (
                type TEXT NOT NULL,
                id TEXT NOT NULL,
                version BIGSERIAL,
                record_version BIGINT NOT NULL,
                data BYTEA NOT NULL,
                modified_at TIMESTAMPTZ NOT NULL,
                deleted_at TIMESTAMPTZ NULL,

                PRIMARY KEY (version)
            )",
            "CREATE TABLE gatebroker.record_options (
                type TEXT NOT NULL,
                capacity BIGINT NULL,

                PRIMARY KEY (type)
            )",
            "CREATE TABLE gatebroker.leases (
                name TEXT NOT NULL,
                id TEXT NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL,

                PRIMARY KEY (name)
            )",
        ],
    },
    Migration {
        version: 2,
        name: "index_live_records_by_age",
        statements: &["CREATE INDEX records_live_age_idx
                ON gatebroker.records (type, modified_at, version)
                WHERE deleted_at IS NULL"],
    },
];

/// Version of the newest known migration.
#[must_use]
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}

/// Returns the migrations that still need to run after `applied`.
///
/// # Errors
///
/// Returns `SCHEMA_MISMATCH` when the persisted state is ahead of the code,
/// which means an older binary is pointed at a newer schema.
pub fn pending(applied: u32) -> Result<&'static [Migration], BrokerError> {
    let latest = latest_version();
    if applied > latest {
        return Err(BrokerError::SchemaMismatch(format!(
            "schema is at migration {applied} but this build only knows {latest}"
        )));
    }
    // Versions are contiguous from 1, so `applied` is also the slice offset.
    Ok(&MIGRATIONS[applied as usize..])
}

/// Builds the error for a failed migration step.
#[must_use]
pub fn migration_failed(migration: &Migration, err: &dyn std::fmt::Display) -> BrokerError {
    BrokerError::SchemaMismatch(format!(
        "migration {} ({}) failed: {err}",
        migration.version, migration.name
    ))
}

/// Generates a fresh incarnation id.
///
/// PostgreSQL has no unsigned 64-bit column, so only 32 random bits are used.
#[must_use]
pub fn new_incarnation_id() -> u64 {
    u64::from(rand::random::<u32>())
}
