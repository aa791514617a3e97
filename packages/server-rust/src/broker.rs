//! The broker facade: record store, change log, capacity, and leases over a
//! shared [`StorageBackend`].
//!
//! [`Broker::open`] brings the schema up to date before anything is served.
//! Every operation then runs under the configured deadline and either
//! completes or fails with exactly one [`BrokerError`]. Committed mutations
//! bump an in-process watch channel so local tails wake without polling.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gatebroker_core::{
    BrokerError, ChangeEntry, ClockSource, Lease, PutRequest, Querier, QueryRequest,
    QueryResponse, Record, RecordTypeOptions, ServerInfo,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::lease;
use crate::query::QueryPlan;
use crate::storage::{migrations, RecordWrite, StorageBackend, WriteOutcome};
use crate::tail::{ChangeSource, ChangeStream, TailSettings};

/// Tunables for a [`Broker`].
#[derive(Debug, Clone, Copy)]
pub struct BrokerSettings {
    /// Deadline applied to every storage call.
    pub operation_timeout: Duration,
    /// Fallback wake-up interval for tails.
    pub tail_poll_interval: Duration,
    /// Change entries fetched per tail poll, also the default page for
    /// [`Broker::changes_after`].
    pub tail_batch_size: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(10),
            tail_poll_interval: Duration::from_secs(1),
            tail_batch_size: 256,
        }
    }
}

struct Inner {
    backend: Arc<dyn StorageBackend>,
    clock: Arc<dyn ClockSource>,
    settings: BrokerSettings,
    /// Highest global version committed through this process.
    commits: watch::Sender<u64>,
    server_incarnation_id: u64,
}

/// Cheaply cloneable handle to one broker instance.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("backend", &self.inner.backend.kind())
            .field("server_incarnation_id", &self.inner.server_incarnation_id)
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

fn require(field: &str, value: &str) -> Result<(), BrokerError> {
    if value.is_empty() {
        Err(BrokerError::InvalidArgument(format!("{field} must not be empty")))
    } else {
        Ok(())
    }
}

impl Broker {
    /// Ensures the schema, applies pending migrations, and returns a ready broker.
    ///
    /// # Errors
    ///
    /// Returns `SCHEMA_MISMATCH` if a migration fails or the schema is newer
    /// than this build. The broker must not serve in that case.
    pub async fn open(
        backend: Arc<dyn StorageBackend>,
        clock: Arc<dyn ClockSource>,
        settings: BrokerSettings,
    ) -> Result<Self, BrokerError> {
        let state = backend.ensure_schema().await?;
        let pending = migrations::pending(state.applied)?;
        let state = if pending.is_empty() {
            state
        } else {
            info!(
                from = state.applied,
                to = migrations::latest_version(),
                "applying schema migrations"
            );
            backend.apply_migrations(pending).await?
        };
        let latest = backend.latest_version().await?;

        info!(
            backend = backend.kind(),
            server_incarnation_id = state.server_incarnation_id,
            migration = state.applied,
            latest_version = latest,
            "broker ready"
        );

        let (commits, _) = watch::channel(latest);
        Ok(Self {
            inner: Arc::new(Inner {
                backend,
                clock,
                settings,
                commits,
                server_incarnation_id: state.server_incarnation_id,
            }),
        })
    }

    /// Random id fixed for the lifetime of the backing schema.
    #[must_use]
    pub fn server_incarnation_id(&self) -> u64 {
        self.inner.server_incarnation_id
    }

    /// Name of the storage backend in use.
    #[must_use]
    pub fn backend_kind(&self) -> &'static str {
        self.inner.backend.kind()
    }

    fn now(&self) -> i64 {
        self.inner.clock.now_millis()
    }

    async fn with_deadline<T, F>(&self, op: &'static str, fut: F) -> Result<T, BrokerError>
    where
        F: Future<Output = Result<T, BrokerError>>,
    {
        let timeout = self.inner.settings.operation_timeout;
        if let Ok(result) = tokio::time::timeout(timeout, fut).await {
            result
        } else {
            warn!(op, ?timeout, "operation deadline exceeded");
            Err(BrokerError::Unavailable(format!(
                "{op} did not complete within {timeout:?}"
            )))
        }
    }

    fn publish(&self, version: u64) {
        self.inner.commits.send_modify(|latest| {
            *latest = (*latest).max(version);
        });
    }

    fn record_evictions(&self, evicted: &[ChangeEntry]) {
        if let Some(first) = evicted.first() {
            metrics::counter!("gatebroker_evictions_total", "type" => first.record_type.clone())
                .increment(evicted.len() as u64);
            debug!(
                record_type = %first.record_type,
                count = evicted.len(),
                "capacity evicted records"
            );
        }
    }

    // --- Records ---

    /// Upserts a record and returns it with its new version.
    ///
    /// # Errors
    ///
    /// `INVALID_ARGUMENT` for empty type or id; `CONFLICT` when an explicit
    /// version does not exceed the current one.
    pub async fn put(&self, request: PutRequest) -> Result<Record, BrokerError> {
        require("type", &request.record_type)?;
        require("id", &request.id)?;

        let write = RecordWrite {
            record_type: request.record_type,
            id: request.id,
            data: request.data,
            version: request.version,
        };
        let now = self.now();
        let outcome: WriteOutcome = self
            .with_deadline("put", self.inner.backend.put(write, now))
            .await?;

        self.publish(outcome.last_version());
        metrics::counter!("gatebroker_puts_total").increment(1);
        self.record_evictions(&outcome.evicted);
        debug!(
            record_type = %outcome.record.record_type,
            id = %outcome.record.id,
            version = outcome.record.version,
            change = outcome.change.version,
            "put"
        );
        Ok(outcome.record)
    }

    /// Returns the current record.
    ///
    /// # Errors
    ///
    /// `NOT_FOUND` if the record does not exist, or is deleted and
    /// `include_deleted` is false.
    pub async fn get(
        &self,
        record_type: &str,
        id: &str,
        include_deleted: bool,
    ) -> Result<Record, BrokerError> {
        let record = self
            .with_deadline("get", self.inner.backend.get(record_type, id))
            .await?;
        match record {
            Some(r) if include_deleted || !r.is_deleted() => Ok(r),
            _ => Err(BrokerError::NotFound(format!("{record_type}/{id}"))),
        }
    }

    /// Soft-deletes a live record and returns its tombstone.
    ///
    /// # Errors
    ///
    /// `NOT_FOUND` for missing or already deleted records.
    pub async fn delete(&self, record_type: &str, id: &str) -> Result<Record, BrokerError> {
        let now = self.now();
        let outcome = self
            .with_deadline("delete", self.inner.backend.delete(record_type, id, now))
            .await?;

        self.publish(outcome.last_version());
        metrics::counter!("gatebroker_deletes_total").increment(1);
        debug!(record_type, id, version = outcome.record.version, "deleted");
        Ok(outcome.record)
    }

    /// Returns one page of live records matching the request.
    ///
    /// # Errors
    ///
    /// `INVALID_ARGUMENT` for malformed filters or pagination, checked
    /// before touching storage.
    pub async fn query(&self, request: &QueryRequest) -> Result<QueryResponse, BrokerError> {
        let plan = QueryPlan::compile(request)?;
        let candidates = self
            .with_deadline(
                "query",
                self.inner.backend.list(&request.record_type, false),
            )
            .await?;

        metrics::counter!("gatebroker_queries_total").increment(1);
        Ok(plan.execute(candidates))
    }

    // --- Change log ---

    /// One batch of change entries after `after`. A `limit` of zero uses the
    /// configured batch size.
    ///
    /// # Errors
    ///
    /// Storage errors only.
    pub async fn changes_after(
        &self,
        after: u64,
        limit: usize,
    ) -> Result<Vec<ChangeEntry>, BrokerError> {
        let limit = if limit == 0 {
            self.inner.settings.tail_batch_size
        } else {
            limit
        };
        self.with_deadline(
            "changes_after",
            self.inner.backend.changes_after(after, limit),
        )
        .await
    }

    /// Highest committed global version, 0 when the log is empty.
    ///
    /// # Errors
    ///
    /// Storage errors only.
    pub async fn latest_version(&self) -> Result<u64, BrokerError> {
        self.with_deadline("latest_version", self.inner.backend.latest_version())
            .await
    }

    /// Identity and replication position of this deployment.
    ///
    /// # Errors
    ///
    /// Storage errors only.
    pub async fn server_info(&self) -> Result<ServerInfo, BrokerError> {
        Ok(ServerInfo {
            server_incarnation_id: self.server_incarnation_id(),
            latest_version: self.latest_version().await?,
        })
    }

    /// Subscribes to every change with a global version greater than
    /// `from_version`. Must be called within a tokio runtime.
    #[must_use]
    pub fn tail(&self, from_version: u64) -> ChangeStream {
        ChangeStream::spawn(
            Arc::new(self.clone()),
            self.inner.commits.subscribe(),
            from_version,
            TailSettings {
                poll_interval: self.inner.settings.tail_poll_interval,
                batch_size: self.inner.settings.tail_batch_size,
            },
        )
    }

    // --- Options ---

    /// Stores per-type options and enforces the new capacity immediately.
    /// Returns the change entries of evicted records.
    ///
    /// # Errors
    ///
    /// `INVALID_ARGUMENT` for an empty type.
    pub async fn set_options(
        &self,
        options: RecordTypeOptions,
    ) -> Result<Vec<ChangeEntry>, BrokerError> {
        require("type", &options.record_type)?;
        let now = self.now();
        let evicted = self
            .with_deadline("set_options", self.inner.backend.set_options(options, now))
            .await?;

        if let Some(last) = evicted.iter().map(|c| c.version).max() {
            self.publish(last);
        }
        self.record_evictions(&evicted);
        Ok(evicted)
    }

    /// Options for a type, unbounded when none were set.
    ///
    /// # Errors
    ///
    /// Storage errors only.
    pub async fn get_options(&self, record_type: &str) -> Result<RecordTypeOptions, BrokerError> {
        self.with_deadline("get_options", self.inner.backend.get_options(record_type))
            .await
    }

    // --- Leases ---

    /// Acquires or renews `name` for `holder` for `duration`.
    ///
    /// # Errors
    ///
    /// `ALREADY_HELD` with the current holder and remaining time when another
    /// holder owns a live lease; `INVALID_ARGUMENT` for empty names or a zero
    /// duration.
    pub async fn acquire_lease(
        &self,
        name: &str,
        holder: &str,
        duration: Duration,
    ) -> Result<Lease, BrokerError> {
        require("lease name", name)?;
        require("holder id", holder)?;
        let now = self.now();
        let expires_at = lease::expiry_for(now, duration)?;

        let result = self
            .with_deadline(
                "acquire_lease",
                self.inner.backend.acquire_lease(name, holder, expires_at, now),
            )
            .await;

        let outcome = match &result {
            Ok(_) => "granted",
            Err(BrokerError::AlreadyHeld { .. }) => "held",
            Err(_) => "error",
        };
        metrics::counter!("gatebroker_lease_acquire_total", "outcome" => outcome).increment(1);
        debug!(name, holder, outcome, "lease acquire");
        result
    }

    /// Releases `name` if `holder` holds it. Stale releases return `false`.
    ///
    /// # Errors
    ///
    /// Storage errors only.
    pub async fn release_lease(&self, name: &str, holder: &str) -> Result<bool, BrokerError> {
        let released = self
            .with_deadline(
                "release_lease",
                self.inner.backend.release_lease(name, holder),
            )
            .await?;
        if !released {
            debug!(name, holder, "stale lease release ignored");
        }
        Ok(released)
    }
}

#[async_trait]
impl Querier for Broker {
    async fn query(&self, request: &QueryRequest) -> Result<QueryResponse, BrokerError> {
        Broker::query(self, request).await
    }
}

#[async_trait]
impl ChangeSource for Broker {
    async fn fetch_changes(
        &self,
        after: u64,
        limit: usize,
    ) -> Result<Vec<ChangeEntry>, BrokerError> {
        self.changes_after(after, limit).await
    }
}

#[cfg(test)]
mod tests {
    use gatebroker_core::{ErrorCode, ManualClock, RequestContext, Value};

    use super::*;
    use crate::storage::MemoryBackend;

    const START: i64 = 1_700_000_000_000;

    async fn open_with(backend: Arc<MemoryBackend>) -> (Broker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(START));
        let broker = Broker::open(backend, clock.clone(), BrokerSettings::default())
            .await
            .unwrap();
        (broker, clock)
    }

    async fn open() -> (Broker, Arc<ManualClock>) {
        open_with(Arc::new(MemoryBackend::new())).await
    }

    fn put_request(record_type: &str, id: &str, payload: &Value) -> PutRequest {
        PutRequest {
            record_type: record_type.to_string(),
            id: id.to_string(),
            data: payload.encode().unwrap(),
            version: None,
        }
    }

    async fn next_change(stream: &mut ChangeStream) -> ChangeEntry {
        tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("tail stalled")
            .expect("tail ended")
            .expect("tail error")
    }

    // --- Startup ---

    #[tokio::test]
    async fn open_migrates_to_latest_and_keeps_incarnation() {
        let backend = Arc::new(MemoryBackend::new());
        let (first, _) = open_with(backend.clone()).await;
        let (second, _) = open_with(backend.clone()).await;
        assert_eq!(first.server_incarnation_id(), second.server_incarnation_id());

        let state = backend.ensure_schema().await.unwrap();
        assert_eq!(state.applied, migrations::latest_version());
    }

    #[tokio::test]
    async fn failed_migration_refuses_to_open() {
        let backend = Arc::new(MemoryBackend::new());
        backend.fail_migration(2);
        let clock = Arc::new(ManualClock::new(START));
        let err = Broker::open(backend, clock, BrokerSettings::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::SchemaMismatch);
    }

    // --- Records ---

    #[tokio::test]
    async fn session_put_tail_get_query() {
        let (broker, clock) = open().await;
        let mut tail = broker.tail(0);

        let v1 = broker
            .put(put_request("session", "s1", &Value::map([("user", Value::from("u1"))])))
            .await
            .unwrap();
        clock.advance(Duration::from_millis(5));
        let v2 = broker
            .put(put_request("session", "s1", &Value::map([("user", Value::from("u2"))])))
            .await
            .unwrap();
        assert_eq!((v1.version, v2.version), (1, 2));

        let first = next_change(&mut tail).await;
        let second = next_change(&mut tail).await;
        assert_eq!((first.version, first.record_version), (1, 1));
        assert_eq!((second.version, second.record_version), (2, 2));
        assert!(first.version < second.version);

        let current = broker.get("session", "s1", false).await.unwrap();
        assert_eq!(current.version, 2);
        assert_eq!(current.modified_at, START + 5);

        let res = broker
            .query(&QueryRequest::all("session").with_filter(Value::map([("user", Value::from("u2"))])))
            .await
            .unwrap();
        assert_eq!(res.total_count, 1);
        assert_eq!(res.records[0].id, "s1");

        let stale = broker
            .query(&QueryRequest::all("session").with_filter(Value::map([("user", Value::from("u1"))])))
            .await
            .unwrap();
        assert_eq!(stale.total_count, 0);
    }

    #[tokio::test]
    async fn explicit_stale_version_conflicts_without_change_entry() {
        let (broker, _) = open().await;
        let mut request = put_request("session", "s1", &Value::Null);
        request.version = Some(10);
        assert_eq!(broker.put(request.clone()).await.unwrap().version, 10);

        let err = broker.put(request).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);
        assert_eq!(broker.latest_version().await.unwrap(), 1);
        assert_eq!(broker.changes_after(0, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn replicated_versions_are_bounded() {
        let (broker, _) = open().await;
        let mut request = put_request("session", "s1", &Value::Null);
        request.version = Some(u64::MAX);
        let err = broker.put(request.clone()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
        assert_eq!(broker.latest_version().await.unwrap(), 0);

        request.version = Some(crate::storage::MAX_RECORD_VERSION);
        broker.put(request).await.unwrap();

        let err = broker
            .put(put_request("session", "s1", &Value::Null))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);
        let err = broker.delete("session", "s1").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);
        assert_eq!(broker.latest_version().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn empty_identifiers_are_rejected() {
        let (broker, _) = open().await;
        let err = broker
            .put(put_request("session", "", &Value::Null))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
        assert_eq!(broker.latest_version().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_tombstones_and_hides_the_record() {
        let (broker, _) = open().await;
        broker
            .put(put_request("route", "r1", &Value::Null))
            .await
            .unwrap();

        let tombstone = broker.delete("route", "r1").await.unwrap();
        assert_eq!(tombstone.version, 2);
        assert!(tombstone.is_deleted());

        assert_eq!(
            broker.get("route", "r1", false).await.unwrap_err().code(),
            ErrorCode::NotFound
        );
        assert!(broker.get("route", "r1", true).await.unwrap().is_deleted());
        assert_eq!(
            broker.delete("route", "r1").await.unwrap_err().code(),
            ErrorCode::NotFound
        );

        let changes = broker.changes_after(0, 0).await.unwrap();
        assert_eq!(changes.len(), 2);
        assert!(changes[1].is_deletion());
    }

    #[tokio::test]
    async fn malformed_query_fails_fast() {
        let (broker, _) = open().await;
        let err = broker
            .query(&QueryRequest::all("route").with_page(-1, 10))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    // --- Capacity ---

    #[tokio::test]
    async fn widget_capacity_evicts_oldest() {
        let (broker, clock) = open().await;
        broker
            .set_options(RecordTypeOptions {
                record_type: "widget".to_string(),
                capacity: Some(2),
            })
            .await
            .unwrap();

        for id in ["w1", "w2", "w3"] {
            broker
                .put(put_request("widget", id, &Value::from(id)))
                .await
                .unwrap();
            clock.advance(Duration::from_millis(1));
        }

        let live = broker.query(&QueryRequest::all("widget")).await.unwrap();
        let ids: Vec<&str> = live.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["w2", "w3"]);

        assert_eq!(
            broker.get("widget", "w1", false).await.unwrap_err().code(),
            ErrorCode::NotFound
        );
        let changes = broker.changes_after(0, 0).await.unwrap();
        let eviction = changes.last().unwrap();
        assert_eq!(eviction.id, "w1");
        assert!(eviction.is_deletion());
    }

    #[tokio::test]
    async fn lowering_capacity_evicts_immediately() {
        let (broker, clock) = open().await;
        for id in ["a", "b", "c"] {
            broker
                .put(put_request("widget", id, &Value::Null))
                .await
                .unwrap();
            clock.advance(Duration::from_millis(1));
        }

        let evicted = broker
            .set_options(RecordTypeOptions {
                record_type: "widget".to_string(),
                capacity: Some(1),
            })
            .await
            .unwrap();
        let ids: Vec<&str> = evicted.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(
            broker.get_options("widget").await.unwrap().capacity,
            Some(1)
        );
        assert_eq!(broker.get_options("gadget").await.unwrap().capacity, None);
    }

    // --- Leases ---

    #[tokio::test]
    async fn migrate_lease_contention_and_expiry() {
        let (broker, clock) = open().await;
        let ttl = Duration::from_secs(30);

        let lease = broker.acquire_lease("migrate", "nodeA", ttl).await.unwrap();
        assert_eq!(lease.expires_at, START + 30_000);

        match broker.acquire_lease("migrate", "nodeB", ttl).await {
            Err(BrokerError::AlreadyHeld {
                holder,
                remaining_ms,
                ..
            }) => {
                assert_eq!(holder, "nodeA");
                assert_eq!(remaining_ms, 30_000);
            }
            other => panic!("expected ALREADY_HELD, got {other:?}"),
        }

        clock.advance(Duration::from_secs(10));
        let renewed = broker.acquire_lease("migrate", "nodeA", ttl).await.unwrap();
        assert_eq!(renewed.expires_at, START + 40_000);

        clock.advance(Duration::from_secs(30));
        let taken = broker.acquire_lease("migrate", "nodeB", ttl).await.unwrap();
        assert_eq!(taken.holder_id, "nodeB");

        assert!(!broker.release_lease("migrate", "nodeA").await.unwrap());
        assert!(broker.release_lease("migrate", "nodeB").await.unwrap());
        broker.acquire_lease("migrate", "nodeA", ttl).await.unwrap();
    }

    // --- Tail ---

    #[tokio::test]
    async fn tail_resumes_from_last_delivered_version() {
        let (broker, _) = open().await;
        for id in ["a", "b"] {
            broker
                .put(put_request("session", id, &Value::Null))
                .await
                .unwrap();
        }

        let mut first = broker.tail(0);
        next_change(&mut first).await;
        let last = next_change(&mut first).await.version;
        drop(first);

        broker
            .put(put_request("session", "c", &Value::Null))
            .await
            .unwrap();

        let mut resumed = broker.tail(last);
        let entry = next_change(&mut resumed).await;
        assert_eq!((entry.id.as_str(), entry.version), ("c", 3));
    }

    // --- Deadlines and querier wiring ---

    #[tokio::test]
    async fn deadline_expiry_is_unavailable() {
        let backend = Arc::new(MemoryBackend::new());
        let clock = Arc::new(ManualClock::new(START));
        let settings = BrokerSettings {
            operation_timeout: Duration::from_millis(10),
            ..BrokerSettings::default()
        };
        let broker = Broker::open(backend, clock, settings).await.unwrap();

        let err = broker
            .with_deadline("stuck", std::future::pending::<Result<(), BrokerError>>())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unavailable);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn broker_serves_as_context_querier() {
        let (broker, _) = open().await;
        broker
            .put(put_request("route", "r1", &Value::Null))
            .await
            .unwrap();

        let ctx = RequestContext::new("node-1", "trace-1").with_querier(Arc::new(broker));
        let res = ctx.querier().query(&QueryRequest::all("route")).await.unwrap();
        assert_eq!(res.total_count, 1);
    }
}
