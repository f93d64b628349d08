//! Process wiring for the gateway: the Conductor (dispatch), the Keeper
//! (background health probing), the shared startup context, Prometheus
//! metrics, and the HTTP surface that ties them together.

pub mod conductor;
pub mod context;
pub mod keeper;
pub mod metrics;
pub mod router;

pub use conductor::{DispatchError, DispatchRequest, DispatchResponse, dispatch};
pub use context::AppContext;
pub use keeper::spawn_schedulers;
pub use metrics::Metrics;
pub use router::router;
