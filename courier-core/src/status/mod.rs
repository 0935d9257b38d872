//! Status event log and aggregation
//!
//! The append-only log of [`MessageStatusEvent`](crate::model::MessageStatusEvent)s
//! is the source of truth; the status cached on a message and the delivery
//! receipts are projections of it.

mod aggregator;
mod tracker;

pub use aggregator::aggregate_status;
pub use tracker::StatusTracker;
