//! Querier implementations.
//!
//! All share the [`Querier`](gatebroker_core::Querier) trait and are handed
//! around as `Arc<dyn Querier>`, usually inside a
//! [`RequestContext`](gatebroker_core::RequestContext):
//!
//! - [`Broker`](crate::broker::Broker): in-process, against the record store
//! - [`StaticQuerier`]: fixed record set
//! - [`ClientQuerier`]: forwards to a remote broker over HTTP
//! - [`TracingQuerier`]: records every request passed to an inner querier
//! - [`NilQuerier`](gatebroker_core::NilQuerier): fails with `UNIMPLEMENTED`

pub mod client;
pub mod static_querier;
pub mod tracing_querier;

pub use client::ClientQuerier;
pub use static_querier::StaticQuerier;
pub use tracing_querier::TracingQuerier;
