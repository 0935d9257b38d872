//! Status event store backed by the persistence ports

use super::aggregator::aggregate_status;
use crate::clock::Clock;
use crate::error::{bounded, DeliveryError, DeliveryResult};
use crate::model::{
    EventId, Message, MessageId, MessageStatus, MessageStatusEvent, StatusSource, UserId,
};
use crate::store::Repositories;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Appends status events and derives the canonical status of a message
///
/// Safe to call concurrently with itself: aggregation always runs on a
/// snapshot of the log, and the cached status on the message is only ever
/// moved forward by the repository.
#[derive(Clone)]
pub struct StatusTracker {
    repos: Repositories,
    clock: Arc<dyn Clock>,
    io_timeout: Duration,
}

impl StatusTracker {
    pub fn new(repos: Repositories, clock: Arc<dyn Clock>, io_timeout: Duration) -> Self {
        Self {
            repos,
            clock,
            io_timeout,
        }
    }

    /// Append one event, timestamped now
    pub async fn append_event(
        &self,
        message_id: MessageId,
        status: MessageStatus,
        user_id: Option<UserId>,
        source: StatusSource,
    ) -> DeliveryResult<MessageStatusEvent> {
        let event = MessageStatusEvent {
            id: EventId::generate(),
            message_id,
            user_id,
            status,
            source,
            created_at: self.clock.now(),
        };
        bounded(
            self.io_timeout,
            "append status event",
            self.repos.events.append_event(event.clone()),
        )
        .await?;
        trace!(%message_id, %status, ?source, "Status event appended");
        Ok(event)
    }

    /// Canonical status of a message
    pub async fn aggregate(&self, message_id: MessageId) -> DeliveryResult<MessageStatus> {
        let message = bounded(
            self.io_timeout,
            "load message",
            self.repos.messages.get_message(message_id),
        )
        .await?
        .ok_or_else(|| DeliveryError::NotFound(format!("message {}", message_id)))?;
        self.aggregate_for(&message).await
    }

    pub(crate) async fn aggregate_for(&self, message: &Message) -> DeliveryResult<MessageStatus> {
        let chat = bounded(
            self.io_timeout,
            "load chat",
            self.repos.chats.get_chat(message.chat_id),
        )
        .await?
        .ok_or_else(|| DeliveryError::NotFound(format!("chat {}", message.chat_id)))?;
        let participants = bounded(
            self.io_timeout,
            "list participants",
            self.repos.chats.list_participants(message.chat_id),
        )
        .await?;
        let events = bounded(
            self.io_timeout,
            "list status events",
            self.repos.events.list_events(message.id),
        )
        .await?;

        Ok(aggregate_status(
            &events,
            chat.kind,
            message.sender_id,
            &participants,
        ))
    }

    /// Recompute the aggregate and persist it if it moved forward
    ///
    /// Returns the new status when the cached one changed.
    pub async fn refresh(&self, message: &Message) -> DeliveryResult<Option<MessageStatus>> {
        let status = self.aggregate_for(message).await?;
        let changed = bounded(
            self.io_timeout,
            "advance message status",
            self.repos
                .messages
                .advance_status(message.id, status, self.clock.now()),
        )
        .await?;
        Ok(changed.then_some(status))
    }
}
