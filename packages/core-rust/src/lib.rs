//! `gatebroker` core: record model, filter expressions, query messages, and the querier seam.

pub mod clock;
pub mod context;
pub mod error;
pub mod filter;
pub mod messages;
pub mod traits;
pub mod types;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use context::RequestContext;
pub use error::{BrokerError, ErrorBody, ErrorCode};
pub use filter::FilterExpression;
pub use messages::{
    AcquireLeaseRequest, GetRequest, OptionsRequest, PutRequest, QueryRequest, QueryResponse,
    ReleaseLeaseRequest, ReleaseLeaseResponse, ServerInfo,
};
pub use traits::{NilQuerier, Querier};
pub use types::{ChangeEntry, Lease, Record, RecordTypeOptions, Value};
