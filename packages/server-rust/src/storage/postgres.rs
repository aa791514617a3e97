//! `PostgreSQL` [`StorageBackend`] for multi-instance deployments.
//!
//! Every mutation runs in one transaction that first takes a
//! transaction-scoped advisory lock. `record_changes.version` is a
//! `BIGSERIAL`, and serializing writers on the lock makes the order of
//! assigned global versions equal the commit order, which is what change-log
//! tailing relies on.
//!
//! Timestamps are stored as `TIMESTAMPTZ` and cross the boundary as epoch
//! millis (`to_timestamp($n / 1000.0)` in, `EXTRACT(EPOCH ...) * 1000` out).

use std::time::Duration;

use async_trait::async_trait;
use gatebroker_core::{BrokerError, ChangeEntry, Lease, Record, RecordTypeOptions};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use tracing::{debug, info};

use crate::storage::migrations::{self, Migration, MigrationState};
use crate::storage::{bump_version, next_version, RecordWrite, StorageBackend, WriteOutcome};

/// Advisory lock serializing schema creation and migration runs.
const SCHEMA_LOCK: i64 = 0x6761_7465_0001;
/// Advisory lock serializing change-log appends.
const WRITE_LOCK: i64 = 0x6761_7465_0002;

const RECORD_COLUMNS: &str = "type AS record_type, id, version, data, \
     (EXTRACT(EPOCH FROM modified_at) * 1000)::BIGINT AS modified_at, \
     (EXTRACT(EPOCH FROM deleted_at) * 1000)::BIGINT AS deleted_at";

#[derive(sqlx::FromRow)]
struct RecordRow {
    record_type: String,
    id: String,
    version: i64,
    data: Vec<u8>,
    modified_at: i64,
    deleted_at: Option<i64>,
}

impl TryFrom<RecordRow> for Record {
    type Error = BrokerError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        Ok(Record {
            record_type: row.record_type,
            id: row.id,
            version: to_u64(row.version)?,
            data: row.data,
            modified_at: row.modified_at,
            deleted_at: row.deleted_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ChangeRow {
    record_type: String,
    id: String,
    version: i64,
    record_version: i64,
    data: Vec<u8>,
    modified_at: i64,
    deleted_at: Option<i64>,
}

impl TryFrom<ChangeRow> for ChangeEntry {
    type Error = BrokerError;

    fn try_from(row: ChangeRow) -> Result<Self, Self::Error> {
        Ok(ChangeEntry {
            record_type: row.record_type,
            id: row.id,
            version: to_u64(row.version)?,
            record_version: to_u64(row.record_version)?,
            data: row.data,
            modified_at: row.modified_at,
            deleted_at: row.deleted_at,
        })
    }
}

/// Maps driver errors onto the broker taxonomy.
///
/// Connectivity and pool exhaustion are retryable; everything else is not.
fn db_err(err: sqlx::Error) -> BrokerError {
    match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => BrokerError::Unavailable(err.to_string()),
        _ => BrokerError::Internal(err.to_string()),
    }
}

fn to_u64(n: i64) -> Result<u64, BrokerError> {
    u64::try_from(n).map_err(|_| BrokerError::Internal(format!("negative version {n} in storage")))
}

fn to_i64(n: u64) -> Result<i64, BrokerError> {
    i64::try_from(n)
        .map_err(|_| BrokerError::InvalidArgument(format!("{n} exceeds the storable range")))
}

/// Shared store over a `PostgreSQL` connection pool.
#[derive(Debug, Clone)]
pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    /// Wraps an existing pool.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens a pool against `url`.
    ///
    /// # Errors
    ///
    /// Returns `UNAVAILABLE` if the database cannot be reached.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, BrokerError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
            .map_err(db_err)?;
        info!(max_connections, "connected to postgres");
        Ok(Self { pool })
    }

    async fn read_migration_state(
        conn: &mut PgConnection,
    ) -> Result<MigrationState, BrokerError> {
        let (server_version, migration_version): (i64, i64) = sqlx::query_as(
            "SELECT server_version, migration_version FROM gatebroker.migration_info LIMIT 1",
        )
        .fetch_one(&mut *conn)
        .await
        .map_err(db_err)?;

        Ok(MigrationState {
            server_incarnation_id: to_u64(server_version)?,
            applied: u32::try_from(migration_version).map_err(|_| {
                BrokerError::SchemaMismatch(format!(
                    "invalid persisted migration index {migration_version}"
                ))
            })?,
        })
    }
}

async fn lock(conn: &mut PgConnection, key: i64) -> Result<(), BrokerError> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(key)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    Ok(())
}

async fn fetch_record(
    conn: &mut PgConnection,
    record_type: &str,
    id: &str,
    for_update: bool,
) -> Result<Option<Record>, BrokerError> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM gatebroker.records WHERE type = $1 AND id = $2{}",
        if for_update { " FOR UPDATE" } else { "" }
    );
    sqlx::query_as::<_, RecordRow>(&sql)
        .bind(record_type)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?
        .map(Record::try_from)
        .transpose()
}

/// Writes the full row state of `record`.
async fn store_record(conn: &mut PgConnection, record: &Record) -> Result<(), BrokerError> {
    let result = sqlx::query(
        "INSERT INTO gatebroker.records (type, id, version, data, modified_at, deleted_at)
         VALUES ($1, $2, $3, $4,
                 to_timestamp($5::double precision / 1000.0),
                 to_timestamp($6::double precision / 1000.0))
         ON CONFLICT (type, id) DO UPDATE
         SET version = EXCLUDED.version,
             data = EXCLUDED.data,
             modified_at = EXCLUDED.modified_at,
             deleted_at = EXCLUDED.deleted_at
         WHERE records.version < EXCLUDED.version",
    )
    .bind(&record.record_type)
    .bind(&record.id)
    .bind(to_i64(record.version)?)
    .bind(&record.data)
    .bind(record.modified_at)
    .bind(record.deleted_at)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;

    if result.rows_affected() == 0 {
        return Err(BrokerError::Conflict(format!(
            "{}/{}: version {} lost to a concurrent write",
            record.record_type, record.id, record.version
        )));
    }
    Ok(())
}

async fn append_change(
    conn: &mut PgConnection,
    record: &Record,
) -> Result<ChangeEntry, BrokerError> {
    let version: i64 = sqlx::query_scalar(
        "INSERT INTO gatebroker.record_changes
             (type, id, record_version, data, modified_at, deleted_at)
         VALUES ($1, $2, $3, $4,
                 to_timestamp($5::double precision / 1000.0),
                 to_timestamp($6::double precision / 1000.0))
         RETURNING version",
    )
    .bind(&record.record_type)
    .bind(&record.id)
    .bind(to_i64(record.version)?)
    .bind(&record.data)
    .bind(record.modified_at)
    .bind(record.deleted_at)
    .fetch_one(&mut *conn)
    .await
    .map_err(db_err)?;

    Ok(ChangeEntry {
        record_type: record.record_type.clone(),
        id: record.id.clone(),
        version: to_u64(version)?,
        record_version: record.version,
        data: record.data.clone(),
        modified_at: record.modified_at,
        deleted_at: record.deleted_at,
    })
}

/// Tombstones `current` and appends the change entry.
async fn tombstone(
    conn: &mut PgConnection,
    current: Record,
    now: i64,
) -> Result<(Record, ChangeEntry), BrokerError> {
    let record = Record {
        version: bump_version(&current.record_type, &current.id, current.version)?,
        modified_at: now,
        deleted_at: Some(now),
        ..current
    };
    store_record(conn, &record).await?;
    let change = append_change(conn, &record).await?;
    Ok((record, change))
}

async fn enforce_capacity(
    conn: &mut PgConnection,
    record_type: &str,
    written_id: Option<&str>,
    now: i64,
) -> Result<Vec<ChangeEntry>, BrokerError> {
    let capacity: Option<Option<i64>> =
        sqlx::query_scalar("SELECT capacity FROM gatebroker.record_options WHERE type = $1")
            .bind(record_type)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_err)?;
    let Some(capacity) = capacity.flatten() else {
        return Ok(Vec::new());
    };

    let live: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM gatebroker.records WHERE type = $1 AND deleted_at IS NULL",
    )
    .bind(record_type)
    .fetch_one(&mut *conn)
    .await
    .map_err(db_err)?;
    let excess = live - capacity;
    if excess <= 0 {
        return Ok(Vec::new());
    }

    // Same ranking as `capacity::select_evictions`: the written record last,
    // then oldest first.
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM gatebroker.records
         WHERE type = $1 AND deleted_at IS NULL
         ORDER BY COALESCE(id = $2, FALSE), modified_at, version, id
         LIMIT $3
         FOR UPDATE"
    );
    let victims = sqlx::query_as::<_, RecordRow>(&sql)
        .bind(record_type)
        .bind(written_id)
        .bind(excess)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err)?;

    let mut evicted = Vec::with_capacity(victims.len());
    for row in victims {
        let (_, change) = tombstone(conn, Record::try_from(row)?, now).await?;
        evicted.push(change);
    }
    if !evicted.is_empty() {
        debug!(record_type, count = evicted.len(), "evicted records over capacity");
    }
    Ok(evicted)
}

#[async_trait]
impl StorageBackend for PostgresBackend {
    fn kind(&self) -> &'static str {
        "postgres"
    }

    async fn ensure_schema(&self) -> Result<MigrationState, BrokerError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        lock(&mut tx, SCHEMA_LOCK).await?;

        sqlx::raw_sql("CREATE SCHEMA IF NOT EXISTS gatebroker")
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS gatebroker.migration_info (
                server_version BIGINT NOT NULL,
                migration_version BIGINT NOT NULL
            )",
        )
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let inserted = sqlx::query(
            "INSERT INTO gatebroker.migration_info (server_version, migration_version)
             SELECT $1, 0
             WHERE NOT EXISTS (SELECT 1 FROM gatebroker.migration_info)",
        )
        .bind(to_i64(migrations::new_incarnation_id())?)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?
        .rows_affected();

        let state = Self::read_migration_state(&mut tx).await?;
        tx.commit().await.map_err(db_err)?;

        if inserted > 0 {
            info!(
                server_incarnation_id = state.server_incarnation_id,
                "created broker schema bookkeeping"
            );
        }
        Ok(state)
    }

    async fn apply_migrations(
        &self,
        pending: &[Migration],
    ) -> Result<MigrationState, BrokerError> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        let mut state = Self::read_migration_state(&mut conn).await?;
        drop(conn);

        for migration in pending {
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            lock(&mut tx, SCHEMA_LOCK).await?;

            // Another instance may have applied it while we waited on the lock.
            state = Self::read_migration_state(&mut tx).await?;
            if migration.version <= state.applied {
                continue;
            }

            for statement in migration.statements {
                sqlx::raw_sql(statement)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| migrations::migration_failed(migration, &e))?;
            }
            sqlx::query("UPDATE gatebroker.migration_info SET migration_version = $1")
                .bind(i64::from(migration.version))
                .execute(&mut *tx)
                .await
                .map_err(|e| migrations::migration_failed(migration, &e))?;
            tx.commit()
                .await
                .map_err(|e| migrations::migration_failed(migration, &e))?;

            state.applied = migration.version;
            info!(version = migration.version, name = migration.name, "applied migration");
        }
        Ok(state)
    }

    async fn put(&self, write: RecordWrite, now: i64) -> Result<WriteOutcome, BrokerError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        lock(&mut tx, WRITE_LOCK).await?;

        let current = fetch_record(&mut tx, &write.record_type, &write.id, true).await?;
        let version = next_version(
            &write.record_type,
            &write.id,
            current.map(|r| r.version),
            write.version,
        )?;

        let record = Record {
            record_type: write.record_type,
            id: write.id,
            version,
            data: write.data,
            modified_at: now,
            deleted_at: None,
        };
        store_record(&mut tx, &record).await?;
        let change = append_change(&mut tx, &record).await?;
        let evicted = enforce_capacity(&mut tx, &record.record_type, Some(&record.id), now).await?;
        tx.commit().await.map_err(db_err)?;

        Ok(WriteOutcome {
            record,
            change,
            evicted,
        })
    }

    async fn delete(
        &self,
        record_type: &str,
        id: &str,
        now: i64,
    ) -> Result<WriteOutcome, BrokerError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        lock(&mut tx, WRITE_LOCK).await?;

        let current = match fetch_record(&mut tx, record_type, id, true).await? {
            Some(r) if !r.is_deleted() => r,
            _ => return Err(BrokerError::NotFound(format!("{record_type}/{id}"))),
        };
        let (record, change) = tombstone(&mut tx, current, now).await?;
        tx.commit().await.map_err(db_err)?;

        Ok(WriteOutcome {
            record,
            change,
            evicted: Vec::new(),
        })
    }

    async fn get(&self, record_type: &str, id: &str) -> Result<Option<Record>, BrokerError> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        fetch_record(&mut conn, record_type, id, false).await
    }

    async fn list(
        &self,
        record_type: &str,
        include_deleted: bool,
    ) -> Result<Vec<Record>, BrokerError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM gatebroker.records
             WHERE type = $1 AND ($2 OR deleted_at IS NULL)
             ORDER BY id"
        );
        sqlx::query_as::<_, RecordRow>(&sql)
            .bind(record_type)
            .bind(include_deleted)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(Record::try_from)
            .collect()
    }

    async fn changes_after(
        &self,
        after: u64,
        limit: usize,
    ) -> Result<Vec<ChangeEntry>, BrokerError> {
        sqlx::query_as::<_, ChangeRow>(
            "SELECT type AS record_type, id, version, record_version, data,
                    (EXTRACT(EPOCH FROM modified_at) * 1000)::BIGINT AS modified_at,
                    (EXTRACT(EPOCH FROM deleted_at) * 1000)::BIGINT AS deleted_at
             FROM gatebroker.record_changes
             WHERE version > $1
             ORDER BY version
             LIMIT $2",
        )
        .bind(to_i64(after)?)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?
        .into_iter()
        .map(ChangeEntry::try_from)
        .collect()
    }

    async fn latest_version(&self) -> Result<u64, BrokerError> {
        let latest: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM gatebroker.record_changes")
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;
        to_u64(latest)
    }

    async fn set_options(
        &self,
        options: RecordTypeOptions,
        now: i64,
    ) -> Result<Vec<ChangeEntry>, BrokerError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        lock(&mut tx, WRITE_LOCK).await?;

        sqlx::query(
            "INSERT INTO gatebroker.record_options (type, capacity) VALUES ($1, $2)
             ON CONFLICT (type) DO UPDATE SET capacity = EXCLUDED.capacity",
        )
        .bind(&options.record_type)
        .bind(options.capacity.map(to_i64).transpose()?)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let evicted = enforce_capacity(&mut tx, &options.record_type, None, now).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(evicted)
    }

    async fn get_options(&self, record_type: &str) -> Result<RecordTypeOptions, BrokerError> {
        let capacity: Option<Option<i64>> =
            sqlx::query_scalar("SELECT capacity FROM gatebroker.record_options WHERE type = $1")
                .bind(record_type)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;

        Ok(RecordTypeOptions {
            record_type: record_type.to_string(),
            capacity: capacity.flatten().map(to_u64).transpose()?,
        })
    }

    async fn acquire_lease(
        &self,
        name: &str,
        holder: &str,
        expires_at: i64,
        now: i64,
    ) -> Result<Lease, BrokerError> {
        // Grants when the name is free, expired, or already ours.
        let granted = sqlx::query(
            "INSERT INTO gatebroker.leases (name, id, expires_at)
             VALUES ($1, $2, to_timestamp($3::double precision / 1000.0))
             ON CONFLICT (name) DO UPDATE
             SET id = EXCLUDED.id, expires_at = EXCLUDED.expires_at
             WHERE leases.id = EXCLUDED.id
                OR leases.expires_at <= to_timestamp($4::double precision / 1000.0)",
        )
        .bind(name)
        .bind(holder)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?
        .rows_affected()
            > 0;

        if granted {
            return Ok(Lease {
                name: name.to_string(),
                holder_id: holder.to_string(),
                expires_at,
            });
        }

        let current: Option<(String, i64)> = sqlx::query_as(
            "SELECT id, (EXTRACT(EPOCH FROM expires_at) * 1000)::BIGINT
             FROM gatebroker.leases WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match current {
            Some((holder_id, current_expiry)) => Err(BrokerError::AlreadyHeld {
                name: name.to_string(),
                holder: holder_id,
                remaining_ms: u64::try_from(current_expiry.saturating_sub(now)).unwrap_or(0),
            }),
            None => Err(BrokerError::Unavailable(format!(
                "lease {name} changed concurrently, retry"
            ))),
        }
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<bool, BrokerError> {
        let deleted = sqlx::query("DELETE FROM gatebroker.leases WHERE name = $1 AND id = $2")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(db_err)?
            .rows_affected();
        Ok(deleted > 0)
    }
}
