//! Domain crate shared by every binary in the workspace: the processing
//! queue, the chart store, the document repository, the notification
//! payloads, the fixed backoff schedule, and the external-collaborator
//! contracts.

pub mod backoff;
pub mod chart;
pub mod collaborators;
pub mod documents;
pub mod error;
pub mod ingress;
pub mod metrics;
pub mod models;
pub mod notify;
pub mod queue;

// Health reporting is a single shared crate (`health`) rather than a copy
// vendored into every domain crate; re-exported here so callers only need
// to depend on this crate for the common case.
pub use health::{ComponentStatus, HealthHandle, HealthRegistry, HealthStatus};
