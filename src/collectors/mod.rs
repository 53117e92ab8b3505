//! Collectors wrap one observation lifecycle each: they snapshot the start,
//! build the record on completion and dispatch it to the exporter and the
//! matching log writer.

pub mod inbound;
pub mod job;
pub mod outbound;
pub mod timing;
pub mod tracker;

pub use inbound::{InboundCollector, InboundObservation};
pub use job::JobCollector;
pub use outbound::{ObservedClient, OutboundCollector};
pub use timing::{peak_memory_bytes, resident_memory_bytes, StartSnapshot};
pub use tracker::StartTracker;
