//! Error types for the delivery engine

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Result type for delivery operations
pub type DeliveryResult<T> = Result<T, DeliveryError>;

/// Errors that can occur while delivering and tracking messages
///
/// Only [`DeliveryError::InvalidId`], [`DeliveryError::BatchTooLarge`] and
/// [`DeliveryError::InvalidStatus`] are ever returned to a connected client;
/// everything else is absorbed and logged by the component that hit it.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Referenced entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Identifier could not be parsed
    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    /// Batch acknowledgment exceeded the configured cap
    #[error("Batch of {size} messages exceeds limit of {limit}")]
    BatchTooLarge { size: usize, limit: usize },

    /// Status cannot be used for the requested operation
    #[error("Invalid status for operation: {0}")]
    InvalidStatus(String),

    /// Persistence backend failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Push gateway failed
    #[error("Push error: {0}")]
    Push(String),

    /// Backend call did not finish in time
    #[error("Operation timed out: {0}")]
    Timeout(&'static str),

    /// Invalid runtime configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl DeliveryError {
    /// Whether the error is an expected absence rather than a failure
    pub fn is_not_found(&self) -> bool {
        matches!(self, DeliveryError::NotFound(_))
    }
}

/// Run a backend call with an upper bound on its duration
pub async fn bounded<T, F>(limit: Duration, operation: &'static str, fut: F) -> DeliveryResult<T>
where
    F: Future<Output = DeliveryResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(DeliveryError::Timeout(operation)),
    }
}
