//! Exponential backoff schedule

use crate::clock::span;
use crate::model::PendingAck;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Wait before attempt `retry_count + 1`: `base * 2^retry_count`, saturating
pub fn required_wait(base: Duration, retry_count: u32) -> Duration {
    let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(Duration::MAX)
}

/// Earliest instant the ack may be retried again
pub fn next_attempt_at(ack: &PendingAck, base: Duration) -> DateTime<Utc> {
    ack.backoff_anchor() + span(required_wait(base, ack.retry_count))
}
