//! API layer
//!
//! HTTP handlers for:
//! - ActivityPub (actor, inbox, objects, outbox)
//! - WebFinger
//! - Metrics (Prometheus)

mod activitypub;
pub mod metrics;
mod wellknown;

pub use activitypub::{ACTIVITY_CONTENT_TYPE, activitypub_router};
pub use metrics::metrics_router;
pub use wellknown::wellknown_router;
