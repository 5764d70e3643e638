//! API layer
//!
//! HTTP handlers for:
//! - ActivityPub inboxes (federation)
//! - Metrics (Prometheus)

mod inbox;
pub mod metrics;

pub use inbox::inbox_router;
pub use metrics::metrics_router;
