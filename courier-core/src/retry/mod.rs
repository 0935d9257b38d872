//! Pending-ack retry scheduler
//!
//! Periodically walks the pending-ack table and, for every delivery that is
//! still unconfirmed after its backoff window, resends over the live
//! transport, falls back to push notifications for new messages, or gives up
//! once `max_retries` is reached.

mod backoff;
mod scheduler;

pub use backoff::{next_attempt_at, required_wait};
pub use scheduler::{RetryScheduler, TickReport};
