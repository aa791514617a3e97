//! `gatebroker` server: versioned record store, change-log tailing, capacity
//! eviction, leases, query engine, querier implementations, and the HTTP
//! service in front of them.

pub mod broker;
pub mod capacity;
pub mod config;
pub mod lease;
pub mod network;
pub mod querier;
pub mod query;
pub mod storage;
pub mod tail;

pub use broker::{Broker, BrokerSettings};
pub use querier::{ClientQuerier, StaticQuerier, TracingQuerier};
pub use storage::{MemoryBackend, StorageBackend};
pub use tail::{ChangeStream, TailSettings};
