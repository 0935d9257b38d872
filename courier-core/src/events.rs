//! Events pushed to connected clients

use crate::model::{ChatId, Message, MessageId, MessageStatus, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outbound event surface of the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientEvent {
    MessageReceived(Message),
    StatusUpdated {
        message_id: MessageId,
        status: MessageStatus,
    },
    BatchStatusUpdated {
        message_ids: Vec<MessageId>,
        status: MessageStatus,
    },
    UserStatusChanged {
        user_id: UserId,
        is_online: bool,
        last_seen_at: Option<DateTime<Utc>>,
    },
    TypingIndicator {
        user_id: UserId,
        display_name: String,
        is_typing: bool,
        chat_id: ChatId,
    },
    /// Liveness reply to a heartbeat, sent to the calling session only
    HeartbeatAck { server_time: DateTime<Utc> },
}

impl ClientEvent {
    /// Event name as seen by clients
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::MessageReceived(_) => "MessageReceived",
            ClientEvent::StatusUpdated { .. } => "StatusUpdated",
            ClientEvent::BatchStatusUpdated { .. } => "BatchStatusUpdated",
            ClientEvent::UserStatusChanged { .. } => "UserStatusChanged",
            ClientEvent::TypingIndicator { .. } => "TypingIndicator",
            ClientEvent::HeartbeatAck { .. } => "HeartbeatAck",
        }
    }
}
