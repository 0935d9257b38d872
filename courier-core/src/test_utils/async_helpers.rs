//! Helpers for reading client event channels in tests

use crate::events::ClientEvent;
use crate::registry::EventReceiver;
use tokio::time::{timeout, Duration};

/// Receive the next event, failing after `duration`
pub async fn recv_timeout(
    rx: &mut EventReceiver,
    duration: Duration,
) -> Result<ClientEvent, RecvTimeoutError> {
    timeout(duration, rx.recv())
        .await
        .map_err(|_| RecvTimeoutError::Timeout)?
        .ok_or(RecvTimeoutError::Closed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvTimeoutError {
    Timeout,
    Closed,
}

impl std::fmt::Display for RecvTimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecvTimeoutError::Timeout => write!(f, "receive operation timed out"),
            RecvTimeoutError::Closed => write!(f, "channel closed"),
        }
    }
}

impl std::error::Error for RecvTimeoutError {}

/// Everything already queued on the channel
pub fn drain(rx: &mut EventReceiver) -> Vec<ClientEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Queued events with the given client-facing name
pub fn drain_named(rx: &mut EventReceiver, name: &str) -> Vec<ClientEvent> {
    drain(rx).into_iter().filter(|e| e.name() == name).collect()
}
