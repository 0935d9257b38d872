//! Delivery metrics
//!
//! Thin helpers over the `metrics` facade. Nothing is exported from here;
//! the embedding binary installs whatever recorder it wants.

use crate::model::MessageStatus;

pub const GATEWAY_SESSIONS: &str = "courier.gateway.sessions";
pub const MESSAGES_DISPATCHED: &str = "courier.gateway.messages_dispatched";

pub const ACKS_DELIVERED: &str = "courier.acks.delivered";
pub const ACKS_READ: &str = "courier.acks.read";
pub const ACKS_PLAYED: &str = "courier.acks.played";

pub const RETRY_ATTEMPTS: &str = "courier.retry.attempts";
pub const RETRY_DEDUPED: &str = "courier.retry.deduped";
pub const RETRY_GAVE_UP: &str = "courier.retry.gave_up";
pub const RETRY_PURGED: &str = "courier.retry.purged";
pub const PENDING_ACKS_DUE: &str = "courier.retry.due";

pub const PUSH_SENT: &str = "courier.push.sent";
pub const PUSH_FAILED: &str = "courier.push.failed";
pub const PUSH_TOKENS_DEACTIVATED: &str = "courier.push.tokens_deactivated";

pub const PRESENCE_TIMEOUTS: &str = "courier.presence.timeouts";

/// Register descriptions for every courier metric
pub fn init_metrics() {
    use ::metrics::{describe_counter, describe_gauge};

    describe_gauge!(GATEWAY_SESSIONS, "Live gateway sessions");
    describe_counter!(MESSAGES_DISPATCHED, "Messages fanned out to recipients");

    describe_counter!(ACKS_DELIVERED, "Delivered acknowledgments recorded");
    describe_counter!(ACKS_READ, "Read acknowledgments recorded");
    describe_counter!(ACKS_PLAYED, "Played acknowledgments recorded");

    describe_counter!(RETRY_ATTEMPTS, "Redelivery attempts made by the retry scheduler");
    describe_counter!(RETRY_DEDUPED, "Pending acks dropped because delivery was already recorded");
    describe_counter!(RETRY_GAVE_UP, "Pending acks abandoned after max retries");
    describe_counter!(RETRY_PURGED, "Pending acks removed by the retention sweep");
    describe_gauge!(PENDING_ACKS_DUE, "Pending acks loaded on the last tick");

    describe_counter!(PUSH_SENT, "Push notifications accepted by the provider");
    describe_counter!(PUSH_FAILED, "Push notifications that failed");
    describe_counter!(PUSH_TOKENS_DEACTIVATED, "Device tokens deactivated after provider rejection");

    describe_counter!(PRESENCE_TIMEOUTS, "Users flipped offline by the presence sweep");
}

/// Record a counter metric
pub fn record_counter(name: &'static str, value: u64) {
    ::metrics::counter!(name).increment(value);
}

/// Record a gauge metric
pub fn record_gauge(name: &'static str, value: f64) {
    ::metrics::gauge!(name).set(value);
}

/// Count one recorded acknowledgment of the given stage
pub fn record_ack(status: MessageStatus) {
    let name = match status {
        MessageStatus::Delivered => ACKS_DELIVERED,
        MessageStatus::Read => ACKS_READ,
        MessageStatus::Played => ACKS_PLAYED,
        _ => return,
    };
    record_counter(name, 1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        init_metrics();
        record_counter(RETRY_ATTEMPTS, 1);
        record_gauge(GATEWAY_SESSIONS, 3.0);
        record_ack(MessageStatus::Read);
        record_ack(MessageStatus::Sent);
    }
}
