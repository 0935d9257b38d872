//! Persistence ports
//!
//! The engine never traverses an object graph; it asks for flat projections
//! through these traits. Each backend owns its own consistency discipline
//! (row-level upsert or create). [`MemoryStore`] implements every port and
//! backs tests and the CLI.

use crate::error::DeliveryResult;
use crate::model::{
    AckKind, Chat, ChatId, DeliveryReceipt, DeviceToken, FeedPosition, Message, MessageId,
    MessageStatus, MessageStatusEvent, PendingAck, Presence, UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

mod memory;

pub use memory::MemoryStore;

/// Message rows (identity read, status write)
#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn get_message(&self, id: MessageId) -> DeliveryResult<Option<Message>>;

    /// Store `status` as the cached aggregate only if it is forward progress
    /// from the stored one; returns whether the row changed
    async fn advance_status(
        &self,
        id: MessageId,
        status: MessageStatus,
        at: DateTime<Utc>,
    ) -> DeliveryResult<bool>;

    /// Messages of a chat created or status-updated strictly after `since`
    /// and, when given, positioned strictly after `after`; ordered by
    /// [`FeedPosition`], at most `limit`
    async fn list_changed_since(
        &self,
        chat_id: ChatId,
        since: DateTime<Utc>,
        after: Option<FeedPosition>,
        limit: usize,
    ) -> DeliveryResult<Vec<Message>>;
}

/// Chat membership
#[async_trait]
pub trait ChatRepository: Send + Sync {
    async fn get_chat(&self, id: ChatId) -> DeliveryResult<Option<Chat>>;

    async fn list_participants(&self, chat_id: ChatId) -> DeliveryResult<Vec<UserId>>;

    async fn list_chats_for_user(&self, user_id: UserId) -> DeliveryResult<Vec<ChatId>>;
}

/// Per-recipient delivery receipts, unique on (message, recipient)
#[async_trait]
pub trait ReceiptRepository: Send + Sync {
    async fn get_receipt(
        &self,
        message_id: MessageId,
        recipient_id: UserId,
    ) -> DeliveryResult<Option<DeliveryReceipt>>;

    /// Insert or replace the receipt for its (message, recipient) pair
    async fn upsert_receipt(&self, receipt: DeliveryReceipt) -> DeliveryResult<()>;
}

/// Append-only status log
#[async_trait]
pub trait StatusEventRepository: Send + Sync {
    async fn append_event(&self, event: MessageStatusEvent) -> DeliveryResult<()>;

    /// Every event of a message in append order
    async fn list_events(&self, message_id: MessageId) -> DeliveryResult<Vec<MessageStatusEvent>>;
}

/// Selection of pending acks a retry tick may act on
///
/// Matches acks created at or before `created_before` with
/// `retry_count < max_retries`. Results are ordered by next attempt
/// (`anchor + base_interval * 2^retry_count`) so acks still inside their
/// backoff window never take a slot of the `limit` from one that is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueQuery {
    pub created_before: DateTime<Utc>,
    pub base_interval: Duration,
    pub max_retries: u32,
    pub limit: usize,
}

/// Unconfirmed deliveries, unique on (message, recipient, kind)
#[async_trait]
pub trait PendingAckRepository: Send + Sync {
    /// Insert unless an ack with the same key exists; returns whether it was inserted
    async fn create_if_absent(&self, ack: PendingAck) -> DeliveryResult<bool>;

    async fn get_pending(
        &self,
        message_id: MessageId,
        recipient_id: UserId,
        kind: AckKind,
    ) -> DeliveryResult<Option<PendingAck>>;

    async fn update_pending(&self, ack: PendingAck) -> DeliveryResult<()>;

    /// Returns whether a row was removed
    async fn delete_pending(
        &self,
        message_id: MessageId,
        recipient_id: UserId,
        kind: AckKind,
    ) -> DeliveryResult<bool>;

    /// Acks matching `query`, earliest next attempt first
    async fn list_due(&self, query: DueQuery) -> DeliveryResult<Vec<PendingAck>>;

    /// Delete every ack created before `cutoff`; returns how many went
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> DeliveryResult<usize>;
}

/// Presence fields and profile data of users
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn get_presence(&self, user_id: UserId) -> DeliveryResult<Option<Presence>>;

    async fn set_online(&self, user_id: UserId, at: DateTime<Utc>) -> DeliveryResult<()>;

    async fn set_offline(&self, user_id: UserId, last_seen_at: DateTime<Utc>) -> DeliveryResult<()>;

    /// Stamp a heartbeat and mark the user online
    async fn record_heartbeat(&self, user_id: UserId, at: DateTime<Utc>) -> DeliveryResult<()>;

    async fn list_online(&self) -> DeliveryResult<Vec<Presence>>;

    /// Flip the user offline only if they are still online and their latest
    /// sign of life is not newer than `cutoff`; returns whether it flipped
    async fn mark_offline_if_stale(
        &self,
        user_id: UserId,
        cutoff: DateTime<Utc>,
        last_seen_at: DateTime<Utc>,
    ) -> DeliveryResult<bool>;

    async fn display_name(&self, user_id: UserId) -> DeliveryResult<Option<String>>;
}

/// Push targets
#[async_trait]
pub trait DeviceTokenRepository: Send + Sync {
    async fn list_active_tokens(&self, user_id: UserId) -> DeliveryResult<Vec<DeviceToken>>;

    async fn deactivate_token(&self, token: &str) -> DeliveryResult<()>;
}

/// Every port the engine needs, injected as one bundle
#[derive(Clone)]
pub struct Repositories {
    pub messages: Arc<dyn MessageRepository>,
    pub chats: Arc<dyn ChatRepository>,
    pub receipts: Arc<dyn ReceiptRepository>,
    pub events: Arc<dyn StatusEventRepository>,
    pub pending_acks: Arc<dyn PendingAckRepository>,
    pub users: Arc<dyn UserRepository>,
    pub devices: Arc<dyn DeviceTokenRepository>,
}

impl Repositories {
    /// Point every port at the same in-memory store
    pub fn in_memory(store: Arc<MemoryStore>) -> Self {
        Self {
            messages: store.clone(),
            chats: store.clone(),
            receipts: store.clone(),
            events: store.clone(),
            pending_acks: store.clone(),
            users: store.clone(),
            devices: store,
        }
    }
}
