//! In-process [`StorageBackend`] implementation.
//!
//! All state lives behind one [`parking_lot::Mutex`]; holding the lock for the
//! whole of a mutation is this backend's transaction. The lock is never held
//! across an `.await`. Suitable for tests and single-instance deployments;
//! it offers no cross-process coordination.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use gatebroker_core::{BrokerError, ChangeEntry, Lease, Record, RecordTypeOptions};
use parking_lot::Mutex;

use crate::capacity::select_evictions;
use crate::lease::decide;
use crate::storage::migrations::{self, Migration, MigrationState};
use crate::storage::{bump_version, next_version, RecordWrite, StorageBackend, WriteOutcome};

#[derive(Debug, Default)]
struct State {
    migration: Option<MigrationState>,
    /// Keyed by `(type, id)`, so a range over one type yields ascending ids.
    records: BTreeMap<(String, String), Record>,
    changes: Vec<ChangeEntry>,
    capacities: HashMap<String, u64>,
    leases: HashMap<String, Lease>,
    #[cfg(test)]
    failing_migration: Option<u32>,
}

impl State {
    #[cfg(test)]
    fn injected_failure(&self, version: u32) -> bool {
        self.failing_migration == Some(version)
    }

    #[cfg(not(test))]
    #[allow(clippy::unused_self)]
    fn injected_failure(&self, _version: u32) -> bool {
        false
    }

    fn next_change_version(&self) -> u64 {
        self.changes.last().map_or(1, |c| c.version + 1)
    }

    /// Writes `record` and appends its change entry.
    fn commit(&mut self, record: Record) -> ChangeEntry {
        let change = ChangeEntry {
            record_type: record.record_type.clone(),
            id: record.id.clone(),
            version: self.next_change_version(),
            record_version: record.version,
            data: record.data.clone(),
            modified_at: record.modified_at,
            deleted_at: record.deleted_at,
        };
        self.records
            .insert((record.record_type.clone(), record.id.clone()), record);
        self.changes.push(change.clone());
        change
    }

    /// Reverts the latest [`commit`](Self::commit) of `key`.
    fn undo_commit(&mut self, key: (String, String), previous: Option<Record>) {
        self.changes.pop();
        match previous {
            Some(record) => {
                self.records.insert(key, record);
            }
            None => {
                self.records.remove(&key);
            }
        }
    }

    fn live_of_type(&self, record_type: &str) -> Vec<&Record> {
        self.records
            .range((record_type.to_string(), String::new())..)
            .take_while(|((t, _), _)| t == record_type)
            .map(|(_, r)| r)
            .filter(|r| !r.is_deleted())
            .collect()
    }

    /// Soft-deletes the oldest live records of a type beyond its capacity.
    ///
    /// Every tombstone is built before any is committed, so an error leaves
    /// the state untouched.
    fn enforce_capacity(
        &mut self,
        record_type: &str,
        written_id: Option<&str>,
        now: i64,
    ) -> Result<Vec<ChangeEntry>, BrokerError> {
        let Some(&capacity) = self.capacities.get(record_type) else {
            return Ok(Vec::new());
        };
        let victims = select_evictions(&self.live_of_type(record_type), capacity, written_id);

        let mut tombstones = Vec::with_capacity(victims.len());
        for id in victims {
            let key = (record_type.to_string(), id);
            let Some(current) = self.records.get(&key) else {
                continue;
            };
            tombstones.push(Record {
                version: bump_version(record_type, &current.id, current.version)?,
                modified_at: now,
                deleted_at: Some(now),
                ..current.clone()
            });
        }
        Ok(tombstones
            .into_iter()
            .map(|tombstone| self.commit(tombstone))
            .collect())
    }
}

/// Single-process transactional store.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
}

impl MemoryBackend {
    /// Creates an empty backend. Call [`StorageBackend::ensure_schema`] before use.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the migration with `version` fail, for exercising startup aborts.
    #[cfg(test)]
    pub(crate) fn fail_migration(&self, version: u32) {
        self.state.lock().failing_migration = Some(version);
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn ensure_schema(&self) -> Result<MigrationState, BrokerError> {
        let mut state = self.state.lock();
        let migration = *state.migration.get_or_insert_with(|| MigrationState {
            server_incarnation_id: migrations::new_incarnation_id(),
            applied: 0,
        });
        Ok(migration)
    }

    async fn apply_migrations(
        &self,
        pending: &[Migration],
    ) -> Result<MigrationState, BrokerError> {
        let mut state = self.state.lock();
        let Some(mut current) = state.migration else {
            return Err(BrokerError::SchemaMismatch(
                "bookkeeping row missing; ensure_schema must run first".to_string(),
            ));
        };

        for migration in pending {
            if migration.version <= current.applied {
                continue;
            }
            if state.injected_failure(migration.version) {
                return Err(migrations::migration_failed(migration, &"injected failure"));
            }
            // The in-memory layout is implicit; only the index advances.
            current.applied = migration.version;
            state.migration = Some(current);
        }
        Ok(current)
    }

    async fn put(&self, write: RecordWrite, now: i64) -> Result<WriteOutcome, BrokerError> {
        let mut state = self.state.lock();
        let key = (write.record_type.clone(), write.id.clone());
        let current = state.records.get(&key).map(|r| r.version);
        let version = next_version(&write.record_type, &write.id, current, write.version)?;

        let record = Record {
            record_type: write.record_type,
            id: write.id,
            version,
            data: write.data,
            modified_at: now,
            deleted_at: None,
        };
        let previous = state.records.get(&key).cloned();
        let change = state.commit(record.clone());
        let evicted = match state.enforce_capacity(&record.record_type, Some(&record.id), now) {
            Ok(evicted) => evicted,
            Err(err) => {
                state.undo_commit(key, previous);
                return Err(err);
            }
        };

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
        let mut state = self.state.lock();
        let key = (record_type.to_string(), id.to_string());
        let current = match state.records.get(&key) {
            Some(r) if !r.is_deleted() => r.clone(),
            _ => return Err(BrokerError::NotFound(format!("{record_type}/{id}"))),
        };

        let tombstone = Record {
            version: bump_version(record_type, id, current.version)?,
            modified_at: now,
            deleted_at: Some(now),
            ..current
        };
        let change = state.commit(tombstone.clone());

        Ok(WriteOutcome {
            record: tombstone,
            change,
            evicted: Vec::new(),
        })
    }

    async fn get(&self, record_type: &str, id: &str) -> Result<Option<Record>, BrokerError> {
        let state = self.state.lock();
        Ok(state
            .records
            .get(&(record_type.to_string(), id.to_string()))
            .cloned())
    }

    async fn list(
        &self,
        record_type: &str,
        include_deleted: bool,
    ) -> Result<Vec<Record>, BrokerError> {
        let state = self.state.lock();
        Ok(state
            .records
            .range((record_type.to_string(), String::new())..)
            .take_while(|((t, _), _)| t == record_type)
            .map(|(_, r)| r)
            .filter(|r| include_deleted || !r.is_deleted())
            .cloned()
            .collect())
    }

    async fn changes_after(
        &self,
        after: u64,
        limit: usize,
    ) -> Result<Vec<ChangeEntry>, BrokerError> {
        let state = self.state.lock();
        let start = state.changes.partition_point(|c| c.version <= after);
        Ok(state.changes[start..].iter().take(limit).cloned().collect())
    }

    async fn latest_version(&self) -> Result<u64, BrokerError> {
        Ok(self.state.lock().changes.last().map_or(0, |c| c.version))
    }

    async fn set_options(
        &self,
        options: RecordTypeOptions,
        now: i64,
    ) -> Result<Vec<ChangeEntry>, BrokerError> {
        let mut state = self.state.lock();
        let previous = state.capacities.get(&options.record_type).copied();
        match options.capacity {
            Some(capacity) => {
                state
                    .capacities
                    .insert(options.record_type.clone(), capacity);
            }
            None => {
                state.capacities.remove(&options.record_type);
            }
        }
        let evicted = state.enforce_capacity(&options.record_type, None, now);
        if evicted.is_err() {
            match previous {
                Some(capacity) => state.capacities.insert(options.record_type, capacity),
                None => state.capacities.remove(&options.record_type),
            };
        }
        evicted
    }

    async fn get_options(&self, record_type: &str) -> Result<RecordTypeOptions, BrokerError> {
        let state = self.state.lock();
        Ok(RecordTypeOptions {
            record_type: record_type.to_string(),
            capacity: state.capacities.get(record_type).copied(),
        })
    }

    async fn acquire_lease(
        &self,
        name: &str,
        holder: &str,
        expires_at: i64,
        now: i64,
    ) -> Result<Lease, BrokerError> {
        let mut state = self.state.lock();
        let lease =
            decide(state.leases.get(name), name, holder, expires_at, now).into_result(name)?;
        state.leases.insert(name.to_string(), lease.clone());
        Ok(lease)
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<bool, BrokerError> {
        let mut state = self.state.lock();
        let held = state
            .leases
            .get(name)
            .is_some_and(|lease| lease.holder_id == holder);
        if held {
            state.leases.remove(name);
        }
        Ok(held)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(record_type: &str, id: &str, data: &[u8]) -> RecordWrite {
        RecordWrite {
            record_type: record_type.to_string(),
            id: id.to_string(),
            data: data.to_vec(),
            version: None,
        }
    }

    #[tokio::test]
    async fn put_appends_one_change_per_write() {
        let backend = MemoryBackend::new();
        let first = backend.put(write("session", "a", b"x"), 10).await.unwrap();
        let second = backend.put(write("session", "a", b"y"), 20).await.unwrap();

        assert_eq!(first.record.version, 1);
        assert_eq!(second.record.version, 2);
        assert_eq!(first.change.version, 1);
        assert_eq!(second.change.version, 2);
        assert_eq!(second.change.data, b"y");
        assert_eq!(backend.latest_version().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn conflicting_put_leaves_no_trace() {
        let backend = MemoryBackend::new();
        backend.put(write("session", "a", b"x"), 10).await.unwrap();

        let mut stale = write("session", "a", b"stale");
        stale.version = Some(1);
        let err = backend.put(stale, 20).await.unwrap_err();

        assert!(matches!(err, BrokerError::Conflict(_)));
        assert_eq!(backend.latest_version().await.unwrap(), 1);
        let record = backend.get("session", "a").await.unwrap().unwrap();
        assert_eq!(record.data, b"x");
    }

    #[tokio::test]
    async fn writes_at_the_version_ceiling_fail_cleanly() {
        use crate::storage::MAX_RECORD_VERSION;

        let backend = MemoryBackend::new();
        let mut top = write("session", "a", b"x");
        top.version = Some(MAX_RECORD_VERSION);
        backend.put(top, 10).await.unwrap();

        let err = backend.put(write("session", "a", b"y"), 20).await.unwrap_err();
        assert!(matches!(err, BrokerError::Conflict(_)));
        let err = backend.delete("session", "a", 20).await.unwrap_err();
        assert!(matches!(err, BrokerError::Conflict(_)));

        let record = backend.get("session", "a").await.unwrap().unwrap();
        assert_eq!(record.version, MAX_RECORD_VERSION);
        assert!(!record.is_deleted());
        assert_eq!(backend.latest_version().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_eviction_rolls_back_the_put() {
        use crate::storage::MAX_RECORD_VERSION;

        let backend = MemoryBackend::new();
        let mut top = write("widget", "a", b"old");
        top.version = Some(MAX_RECORD_VERSION);
        backend.put(top, 10).await.unwrap();
        backend
            .set_options(
                RecordTypeOptions {
                    record_type: "widget".to_string(),
                    capacity: Some(1),
                },
                15,
            )
            .await
            .unwrap();

        let err = backend.put(write("widget", "b", b"new"), 20).await.unwrap_err();
        assert!(matches!(err, BrokerError::Conflict(_)));
        assert!(backend.get("widget", "b").await.unwrap().is_none());
        assert_eq!(backend.latest_version().await.unwrap(), 1);

        let err = backend
            .set_options(
                RecordTypeOptions {
                    record_type: "widget".to_string(),
                    capacity: Some(0),
                },
                30,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Conflict(_)));
        assert_eq!(backend.get_options("widget").await.unwrap().capacity, Some(1));
    }

    #[tokio::test]
    async fn list_is_scoped_to_type_and_sorted_by_id() {
        let backend = MemoryBackend::new();
        backend.put(write("session", "b", b"1"), 1).await.unwrap();
        backend.put(write("route", "a", b"2"), 2).await.unwrap();
        backend.put(write("session", "a", b"3"), 3).await.unwrap();
        backend.put(write("sessions", "0", b"4"), 4).await.unwrap();

        let ids: Vec<String> = backend
            .list("session", false)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn delete_tombstones_and_logs() {
        let backend = MemoryBackend::new();
        backend.put(write("session", "a", b"x"), 10).await.unwrap();
        let outcome = backend.delete("session", "a", 20).await.unwrap();

        assert_eq!(outcome.record.version, 2);
        assert_eq!(outcome.change.deleted_at, Some(20));
        assert!(backend.list("session", false).await.unwrap().is_empty());
        assert_eq!(backend.list("session", true).await.unwrap().len(), 1);

        let again = backend.delete("session", "a", 30).await.unwrap_err();
        assert!(matches!(again, BrokerError::NotFound(_)));
        assert_eq!(backend.latest_version().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn put_revives_a_tombstone() {
        let backend = MemoryBackend::new();
        backend.put(write("session", "a", b"x"), 10).await.unwrap();
        backend.delete("session", "a", 20).await.unwrap();
        let revived = backend.put(write("session", "a", b"z"), 30).await.unwrap();

        assert_eq!(revived.record.version, 3);
        assert!(!revived.record.is_deleted());
    }

    #[tokio::test]
    async fn changes_after_is_exclusive_and_bounded() {
        let backend = MemoryBackend::new();
        for i in 0..5 {
            backend
                .put(write("session", &format!("s{i}"), b"x"), i)
                .await
                .unwrap();
        }
        let batch = backend.changes_after(2, 2).await.unwrap();
        let versions: Vec<u64> = batch.iter().map(|c| c.version).collect();
        assert_eq!(versions, vec![3, 4]);
        assert!(backend.changes_after(5, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lowering_capacity_evicts_immediately() {
        let backend = MemoryBackend::new();
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            backend
                .put(write("widget", id, b"w"), i64::try_from(i).unwrap())
                .await
                .unwrap();
        }
        let evicted = backend
            .set_options(
                RecordTypeOptions {
                    record_type: "widget".to_string(),
                    capacity: Some(1),
                },
                100,
            )
            .await
            .unwrap();

        let ids: Vec<&str> = evicted.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(evicted.iter().all(ChangeEntry::is_deletion));
        assert_eq!(backend.list("widget", false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ensure_schema_is_idempotent() {
        let backend = MemoryBackend::new();
        let first = backend.ensure_schema().await.unwrap();
        let second = backend.ensure_schema().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.applied, 0);
    }

    #[tokio::test]
    async fn failed_migration_stops_the_sequence() {
        let backend = MemoryBackend::new();
        backend.ensure_schema().await.unwrap();
        backend.fail_migration(2);

        let err = backend
            .apply_migrations(migrations::MIGRATIONS)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::SchemaMismatch(_)));

        let state = backend.ensure_schema().await.unwrap();
        assert_eq!(state.applied, 1, "step 1 committed, step 2 did not");
    }
}
