/*
    types.rs - Persisted projections the engine reads and writes

    The persistence layer owns these records; the engine only requests flat
    projections of them through the repository ports in `crate::store`.
*/

use super::ids::{ChatId, EventId, MessageId, UserId};
use super::status::MessageStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque message payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContent {
    pub body: String,
    /// MIME-like hint for clients (text, voice, image...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            content_type: None,
        }
    }
}

/// A persisted chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub content: MessageContent,
    pub created_at: DateTime<Utc>,
    /// Last computed aggregate status (cached projection of the event log)
    pub status: MessageStatus,
    /// When `status` last moved forward
    pub status_updated_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(chat_id: ChatId, sender_id: UserId, content: MessageContent, created_at: DateTime<Utc>) -> Self {
        Self {
            id: MessageId::generate(),
            chat_id,
            sender_id,
            content,
            created_at,
            status: MessageStatus::Sending,
            status_updated_at: None,
        }
    }

    /// Latest of creation and last status change
    pub fn last_activity_at(&self) -> DateTime<Utc> {
        match self.status_updated_at {
            Some(updated) if updated > self.created_at => updated,
            _ => self.created_at,
        }
    }

    /// Where this message currently sits in its chat's change feed
    pub fn feed_position(&self) -> FeedPosition {
        FeedPosition {
            at: self.last_activity_at(),
            message_id: self.id,
        }
    }
}

/// Keyset position in a chat's change feed, ordered by activity then id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FeedPosition {
    pub at: DateTime<Utc>,
    pub message_id: MessageId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChatKind {
    /// Exactly two members
    Private,
    /// Any number of members
    Group,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: ChatId,
    pub kind: ChatKind,
}

/// Per-recipient delivery progress for one message
///
/// Timestamps fill monotonically: a later stage back-fills any earlier stage
/// that is still empty, and an already recorded stage is never overwritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub message_id: MessageId,
    pub recipient_id: UserId,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub played_at: Option<DateTime<Utc>>,
}

impl DeliveryReceipt {
    pub fn new(message_id: MessageId, recipient_id: UserId) -> Self {
        Self {
            message_id,
            recipient_id,
            delivered_at: None,
            read_at: None,
            played_at: None,
        }
    }

    /// Record that `status` was reached at `at`
    ///
    /// Returns `false` when the stage was already recorded, in which case the
    /// receipt is left untouched.
    pub fn record(&mut self, status: MessageStatus, at: DateTime<Utc>) -> bool {
        if self.has_reached(status) {
            return false;
        }
        match status {
            MessageStatus::Delivered => {
                self.delivered_at = Some(at);
            }
            MessageStatus::Read => {
                self.delivered_at.get_or_insert(at);
                self.read_at = Some(at);
            }
            MessageStatus::Played => {
                self.delivered_at.get_or_insert(at);
                self.read_at.get_or_insert(at);
                self.played_at = Some(at);
            }
            _ => return false,
        }
        true
    }

    pub fn has_reached(&self, status: MessageStatus) -> bool {
        match status {
            MessageStatus::Delivered => self.delivered_at.is_some(),
            MessageStatus::Read => self.read_at.is_some(),
            MessageStatus::Played => self.played_at.is_some(),
            _ => false,
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.delivered_at.is_some()
    }
}

/// Where a status event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusSource {
    /// Emitted by the server itself (dispatch)
    Server,
    /// Single acknowledgment over the live connection
    Gateway,
    /// Batch acknowledgment
    Batch,
    /// Acknowledgment of messages caught up through incremental sync
    Sync,
}

/// One entry of the append-only status log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageStatusEvent {
    pub id: EventId,
    pub message_id: MessageId,
    /// Participant the event is attributed to; `None` for server events
    pub user_id: Option<UserId>,
    pub status: MessageStatus,
    pub source: StatusSource,
    pub created_at: DateTime<Utc>,
}

/// What an unconfirmed delivery carried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AckKind {
    /// The message itself, owed to a recipient
    NewMessage,
    /// A status change, owed to the sender
    StatusUpdate,
}

/// A delivery the recipient has not confirmed yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAck {
    pub message_id: MessageId,
    pub recipient_id: UserId,
    pub kind: AckKind,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub last_push_at: Option<DateTime<Utc>>,
}

impl PendingAck {
    pub fn new(message_id: MessageId, recipient_id: UserId, kind: AckKind, now: DateTime<Utc>) -> Self {
        Self {
            message_id,
            recipient_id,
            kind,
            retry_count: 0,
            created_at: now,
            last_retry_at: None,
            last_push_at: None,
        }
    }

    /// Instant the next backoff window is measured from
    pub fn backoff_anchor(&self) -> DateTime<Utc> {
        match self.last_retry_at {
            Some(retried) if retried > self.created_at => retried,
            _ => self.created_at,
        }
    }

    pub fn key(&self) -> (MessageId, UserId, AckKind) {
        (self.message_id, self.recipient_id, self.kind)
    }
}

/// Live online/offline state of a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub user_id: UserId,
    pub is_online: bool,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl Presence {
    pub fn offline(user_id: UserId) -> Self {
        Self {
            user_id,
            is_online: false,
            last_seen_at: None,
            last_heartbeat_at: None,
        }
    }

    /// Most recent sign of life: heartbeat or connect, whichever is newer
    pub fn last_alive_at(&self) -> Option<DateTime<Utc>> {
        self.last_heartbeat_at.max(self.last_seen_at)
    }
}

/// A push-notification target registered by a user's device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceToken {
    pub user_id: UserId,
    pub token: String,
    pub platform: String,
    pub active: bool,
}
