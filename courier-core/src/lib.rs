//! Courier core: the delivery guarantee engine behind real-time chat.
//!
//! Messages are fanned out to live sessions through the [`gateway`], every
//! acknowledgment lands in an append-only status log ([`status`]), unconfirmed
//! deliveries are retried with exponential backoff and push fallback
//! ([`retry`]), and stale connections are swept offline by the
//! [`presence`] monitor.

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod presence;
pub mod push;
pub mod registry;
pub mod retry;
pub mod shutdown;
pub mod status;
pub mod store;
pub mod test_utils;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{DeliveryError, DeliveryResult};
pub use events::ClientEvent;
pub use gateway::{Caller, Gateway, Transport};
pub use logging::{init_logging, LogLevel};
pub use model::{AckKind, ChatId, ChatKind, MessageId, MessageStatus, SessionId, UserId};
pub use presence::PresenceMonitor;
pub use push::{PushGateway, PushNotification, PushOutcome};
pub use registry::ConnectionRegistry;
pub use retry::RetryScheduler;
pub use shutdown::{ShutdownCoordinator, ShutdownListener};
pub use status::StatusTracker;
pub use store::{MemoryStore, Repositories};
