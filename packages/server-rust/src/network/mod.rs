//! HTTP service exposing the broker: configuration, routes, handlers, and
//! shutdown control.

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod module;
pub mod shutdown;

pub use config::NetworkConfig;
pub use handlers::AppState;
pub use module::NetworkModule;
pub use shutdown::{HealthState, InFlightGuard, ShutdownController};

/// Route paths shared by the router and [`ClientQuerier`](crate::querier::ClientQuerier).
pub mod routes {
    pub const QUERY: &str = "/query";
    pub const RECORDS: &str = "/records";
    pub const RECORDS_GET: &str = "/records/get";
    pub const RECORDS_DELETE: &str = "/records/delete";
    pub const CHANGES: &str = "/changes";
    pub const OPTIONS: &str = "/options";
    pub const OPTIONS_GET: &str = "/options/get";
    pub const LEASES_ACQUIRE: &str = "/leases/acquire";
    pub const LEASES_RELEASE: &str = "/leases/release";
    pub const SERVER: &str = "/server";

    /// Content type of every broker request and response body.
    pub const MSGPACK: &str = "application/msgpack";
}
