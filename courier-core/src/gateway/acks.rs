//! Acknowledgment calls
//!
//! Every ack follows the same path: validate, append the status event, fill
//! the receipt, recompute the aggregate, and broadcast only when the
//! aggregate moved. A stage already present on the receipt short-circuits the
//! whole path, which makes repeated acks free of side effects.

use super::{Caller, Gateway};
use crate::error::{bounded, DeliveryError, DeliveryResult};
use crate::events::ClientEvent;
use crate::metrics;
use crate::model::{
    AckKind, ChatId, DeliveryReceipt, Message, MessageId, MessageStatus, PendingAck, StatusSource,
};
use std::collections::HashSet;
use tracing::{debug, error, trace};

impl Gateway {
    /// The caller's client received a message
    pub async fn acknowledge_delivered(&self, caller: &Caller, message_id: MessageId, chat_id: ChatId) {
        self.acknowledge(caller, message_id, chat_id, MessageStatus::Delivered)
            .await
    }

    /// The caller read a message
    pub async fn acknowledge_read(&self, caller: &Caller, message_id: MessageId, chat_id: ChatId) {
        self.acknowledge(caller, message_id, chat_id, MessageStatus::Read)
            .await
    }

    /// The caller played a voice or video message
    pub async fn acknowledge_played(&self, caller: &Caller, message_id: MessageId, chat_id: ChatId) {
        self.acknowledge(caller, message_id, chat_id, MessageStatus::Played)
            .await
    }

    /// Acknowledge several messages of one chat at once
    ///
    /// Returns the ids whose aggregate status changed. Changed messages are
    /// announced with one `BatchStatusUpdated` per resulting status.
    pub async fn acknowledge_batch(
        &self,
        caller: &Caller,
        chat_id: ChatId,
        message_ids: &[MessageId],
        status: MessageStatus,
    ) -> DeliveryResult<Vec<MessageId>> {
        self.acknowledge_many(caller, chat_id, message_ids, status, StatusSource::Batch)
            .await
    }

    /// Batch acknowledgment of messages returned by a sync
    ///
    /// Same rules as [`Gateway::acknowledge_batch`]; the events are tagged
    /// [`StatusSource::Sync`].
    pub async fn acknowledge_synced(
        &self,
        caller: &Caller,
        chat_id: ChatId,
        message_ids: &[MessageId],
        status: MessageStatus,
    ) -> DeliveryResult<Vec<MessageId>> {
        self.acknowledge_many(caller, chat_id, message_ids, status, StatusSource::Sync)
            .await
    }

    async fn acknowledge_many(
        &self,
        caller: &Caller,
        chat_id: ChatId,
        message_ids: &[MessageId],
        status: MessageStatus,
        source: StatusSource,
    ) -> DeliveryResult<Vec<MessageId>> {
        if message_ids.len() > self.config.max_batch_size {
            return Err(DeliveryError::BatchTooLarge {
                size: message_ids.len(),
                limit: self.config.max_batch_size,
            });
        }
        if !status.is_acknowledgeable() {
            return Err(DeliveryError::InvalidStatus(format!(
                "{} cannot be acknowledged",
                status
            )));
        }

        let mut seen = HashSet::new();
        let mut changed: Vec<(MessageStatus, Vec<MessageId>)> = Vec::new();
        for message_id in message_ids.iter().copied().filter(|id| seen.insert(*id)) {
            match self
                .apply_ack(caller, message_id, chat_id, status, source)
                .await
            {
                Ok(Some(new_status)) => match changed.iter_mut().find(|(s, _)| *s == new_status) {
                    Some((_, ids)) => ids.push(message_id),
                    None => changed.push((new_status, vec![message_id])),
                },
                Ok(None) => {}
                Err(e) => log_ack_failure(&e, message_id),
            }
        }

        let mut all_changed = Vec::new();
        for (new_status, ids) in changed {
            all_changed.extend(ids.iter().copied());
            let event = ClientEvent::BatchStatusUpdated {
                message_ids: ids,
                status: new_status,
            };
            self.registry.send_to_group(chat_id, &event, None);
        }
        debug!(
            user = %caller.user_id,
            %chat_id,
            requested = message_ids.len(),
            changed = all_changed.len(),
            ?source,
            "Batch acknowledgment applied"
        );
        Ok(all_changed)
    }

    async fn acknowledge(&self, caller: &Caller, message_id: MessageId, chat_id: ChatId, status: MessageStatus) {
        match self
            .apply_ack(caller, message_id, chat_id, status, StatusSource::Gateway)
            .await
        {
            Ok(Some(new_status)) => {
                let event = ClientEvent::StatusUpdated {
                    message_id,
                    status: new_status,
                };
                self.registry.send_to_group(chat_id, &event, None);
            }
            Ok(None) => {}
            Err(e) => log_ack_failure(&e, message_id),
        }
    }

    /// Apply one ack; returns the new aggregate when it changed
    async fn apply_ack(
        &self,
        caller: &Caller,
        message_id: MessageId,
        chat_id: ChatId,
        status: MessageStatus,
        source: StatusSource,
    ) -> DeliveryResult<Option<MessageStatus>> {
        let user = caller.user_id;
        let Some(message) = self.load_message(message_id).await? else {
            debug!(%message_id, %user, "Ack for unknown message ignored");
            return Ok(None);
        };
        if message.chat_id != chat_id {
            debug!(%message_id, %chat_id, "Ack with mismatched chat ignored");
            return Ok(None);
        }
        if message.sender_id == user {
            debug!(%message_id, %user, "Sender ack of own message ignored");
            return Ok(None);
        }
        let participants = bounded(
            self.config.io_timeout,
            "list participants",
            self.repos.chats.list_participants(chat_id),
        )
        .await?;
        if !participants.contains(&user) {
            debug!(%message_id, %user, "Ack from non-participant ignored");
            return Ok(None);
        }

        let mut receipt = bounded(
            self.config.io_timeout,
            "load receipt",
            self.repos.receipts.get_receipt(message_id, user),
        )
        .await?
        .unwrap_or_else(|| DeliveryReceipt::new(message_id, user));
        if !receipt.record(status, self.clock.now()) {
            trace!(%message_id, %user, %status, "Stage already recorded");
            return Ok(None);
        }

        // The receipt may never lead the status log
        self.tracker
            .append_event(message_id, status, Some(user), source)
            .await?;
        bounded(
            self.config.io_timeout,
            "upsert receipt",
            self.repos.receipts.upsert_receipt(receipt),
        )
        .await?;
        metrics::record_ack(status);

        let changed = self.tracker.refresh(&message).await?;
        if let Some(new_status) = changed {
            self.track_status_update(&message).await;
            debug!(%message_id, %new_status, "Aggregate status advanced");
        }
        Ok(changed)
    }

    /// Owe the sender a confirmation of the status change
    async fn track_status_update(&self, message: &Message) {
        let ack = PendingAck::new(
            message.id,
            message.sender_id,
            AckKind::StatusUpdate,
            self.clock.now(),
        );
        if let Err(e) = bounded(
            self.config.io_timeout,
            "create pending ack",
            self.repos.pending_acks.create_if_absent(ack),
        )
        .await
        {
            error!(message_id = %message.id, error = %e, "Failed to register status update ack");
        }
    }
}

fn log_ack_failure(err: &DeliveryError, message_id: MessageId) {
    if err.is_not_found() {
        debug!(%message_id, error = %err, "Ack skipped");
    } else {
        error!(%message_id, error = %err, "Ack processing failed");
    }
}
