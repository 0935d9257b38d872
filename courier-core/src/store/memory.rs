//! In-memory persistence
//!
//! Implements every repository port on plain maps behind `tokio` locks. Each
//! method takes one lock at a time, which gives the row-level upsert
//! semantics the engine relies on.

use super::{
    ChatRepository, DeviceTokenRepository, DueQuery, MessageRepository, PendingAckRepository,
    ReceiptRepository, StatusEventRepository, UserRepository,
};
use crate::error::{DeliveryError, DeliveryResult};
use crate::retry::next_attempt_at;
use crate::model::{
    AckKind, Chat, ChatId, ChatKind, DeliveryReceipt, DeviceToken, FeedPosition, Message,
    MessageId, MessageStatus, MessageStatusEvent, PendingAck, Presence, UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

type AckKey = (MessageId, UserId, AckKind);

#[derive(Debug, Clone)]
struct UserRow {
    display_name: Option<String>,
    presence: Presence,
}

#[derive(Debug, Clone)]
struct ChatRow {
    chat: Chat,
    participants: Vec<UserId>,
}

/// In-memory implementation of every repository port
#[derive(Default)]
pub struct MemoryStore {
    messages: RwLock<HashMap<MessageId, Message>>,
    chats: RwLock<HashMap<ChatId, ChatRow>>,
    receipts: RwLock<HashMap<(MessageId, UserId), DeliveryReceipt>>,
    events: RwLock<HashMap<MessageId, Vec<MessageStatusEvent>>>,
    pending: RwLock<HashMap<AckKey, PendingAck>>,
    users: RwLock<HashMap<UserId, UserRow>>,
    tokens: RwLock<Vec<DeviceToken>>,
    poisoned: RwLock<HashSet<MessageId>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user with an optional display name
    pub async fn add_user(&self, user_id: UserId, display_name: Option<&str>) {
        self.users.write().await.insert(
            user_id,
            UserRow {
                display_name: display_name.map(str::to_string),
                presence: Presence::offline(user_id),
            },
        );
    }

    /// Create a chat with the given members
    pub async fn add_chat(&self, kind: ChatKind, participants: Vec<UserId>) -> ChatId {
        let id = ChatId::generate();
        self.chats.write().await.insert(
            id,
            ChatRow {
                chat: Chat { id, kind },
                participants,
            },
        );
        id
    }

    pub async fn insert_message(&self, message: Message) {
        self.messages.write().await.insert(message.id, message);
    }

    pub async fn add_device_token(&self, token: DeviceToken) {
        self.tokens.write().await.push(token);
    }

    pub async fn device_token(&self, token: &str) -> Option<DeviceToken> {
        self.tokens
            .read()
            .await
            .iter()
            .find(|t| t.token == token)
            .cloned()
    }

    /// Snapshot of every pending ack
    pub async fn pending_acks(&self) -> Vec<PendingAck> {
        let mut acks: Vec<_> = self.pending.read().await.values().cloned().collect();
        acks.sort_by_key(|a| a.created_at);
        acks
    }

    pub async fn receipt_count(&self) -> usize {
        self.receipts.read().await.len()
    }

    /// Make every receipt lookup for `message_id` fail with a storage error
    pub async fn poison_message(&self, message_id: MessageId) {
        self.poisoned.write().await.insert(message_id);
    }

    async fn check_poisoned(&self, message_id: MessageId) -> DeliveryResult<()> {
        if self.poisoned.read().await.contains(&message_id) {
            return Err(DeliveryError::Storage(format!(
                "receipt table unavailable for message {}",
                message_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageRepository for MemoryStore {
    async fn get_message(&self, id: MessageId) -> DeliveryResult<Option<Message>> {
        Ok(self.messages.read().await.get(&id).cloned())
    }

    async fn advance_status(
        &self,
        id: MessageId,
        status: MessageStatus,
        at: DateTime<Utc>,
    ) -> DeliveryResult<bool> {
        let mut messages = self.messages.write().await;
        let message = messages
            .get_mut(&id)
            .ok_or_else(|| DeliveryError::NotFound(format!("message {}", id)))?;
        if !message.status.advances_to(status) {
            return Ok(false);
        }
        message.status = status;
        message.status_updated_at = Some(at);
        Ok(true)
    }

    async fn list_changed_since(
        &self,
        chat_id: ChatId,
        since: DateTime<Utc>,
        after: Option<FeedPosition>,
        limit: usize,
    ) -> DeliveryResult<Vec<Message>> {
        let messages = self.messages.read().await;
        let mut changed: Vec<Message> = messages
            .values()
            .filter(|m| m.chat_id == chat_id && m.last_activity_at() > since)
            .filter(|m| after.map_or(true, |after| m.feed_position() > after))
            .cloned()
            .collect();
        changed.sort_by_key(Message::feed_position);
        changed.truncate(limit);
        Ok(changed)
    }
}

#[async_trait]
impl ChatRepository for MemoryStore {
    async fn get_chat(&self, id: ChatId) -> DeliveryResult<Option<Chat>> {
        Ok(self.chats.read().await.get(&id).map(|row| row.chat.clone()))
    }

    async fn list_participants(&self, chat_id: ChatId) -> DeliveryResult<Vec<UserId>> {
        Ok(self
            .chats
            .read()
            .await
            .get(&chat_id)
            .map(|row| row.participants.clone())
            .unwrap_or_default())
    }

    async fn list_chats_for_user(&self, user_id: UserId) -> DeliveryResult<Vec<ChatId>> {
        let mut chats: Vec<ChatId> = self
            .chats
            .read()
            .await
            .values()
            .filter(|row| row.participants.contains(&user_id))
            .map(|row| row.chat.id)
            .collect();
        chats.sort();
        Ok(chats)
    }
}

#[async_trait]
impl ReceiptRepository for MemoryStore {
    async fn get_receipt(
        &self,
        message_id: MessageId,
        recipient_id: UserId,
    ) -> DeliveryResult<Option<DeliveryReceipt>> {
        self.check_poisoned(message_id).await?;
        Ok(self
            .receipts
            .read()
            .await
            .get(&(message_id, recipient_id))
            .cloned())
    }

    async fn upsert_receipt(&self, receipt: DeliveryReceipt) -> DeliveryResult<()> {
        self.check_poisoned(receipt.message_id).await?;
        self.receipts
            .write()
            .await
            .insert((receipt.message_id, receipt.recipient_id), receipt);
        Ok(())
    }
}

#[async_trait]
impl StatusEventRepository for MemoryStore {
    async fn append_event(&self, event: MessageStatusEvent) -> DeliveryResult<()> {
        self.events
            .write()
            .await
            .entry(event.message_id)
            .or_default()
            .push(event);
        Ok(())
    }

    async fn list_events(&self, message_id: MessageId) -> DeliveryResult<Vec<MessageStatusEvent>> {
        Ok(self
            .events
            .read()
            .await
            .get(&message_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl PendingAckRepository for MemoryStore {
    async fn create_if_absent(&self, ack: PendingAck) -> DeliveryResult<bool> {
        let mut pending = self.pending.write().await;
        if pending.contains_key(&ack.key()) {
            return Ok(false);
        }
        pending.insert(ack.key(), ack);
        Ok(true)
    }

    async fn get_pending(
        &self,
        message_id: MessageId,
        recipient_id: UserId,
        kind: AckKind,
    ) -> DeliveryResult<Option<PendingAck>> {
        Ok(self
            .pending
            .read()
            .await
            .get(&(message_id, recipient_id, kind))
            .cloned())
    }

    async fn update_pending(&self, ack: PendingAck) -> DeliveryResult<()> {
        let mut pending = self.pending.write().await;
        match pending.get_mut(&ack.key()) {
            Some(existing) => {
                *existing = ack;
                Ok(())
            }
            None => Err(DeliveryError::NotFound(format!(
                "pending ack for message {} recipient {}",
                ack.message_id, ack.recipient_id
            ))),
        }
    }

    async fn delete_pending(
        &self,
        message_id: MessageId,
        recipient_id: UserId,
        kind: AckKind,
    ) -> DeliveryResult<bool> {
        Ok(self
            .pending
            .write()
            .await
            .remove(&(message_id, recipient_id, kind))
            .is_some())
    }

    async fn list_due(&self, query: DueQuery) -> DeliveryResult<Vec<PendingAck>> {
        let pending = self.pending.read().await;
        let mut due: Vec<(DateTime<Utc>, PendingAck)> = pending
            .values()
            .filter(|a| a.created_at <= query.created_before && a.retry_count < query.max_retries)
            .map(|a| (next_attempt_at(a, query.base_interval), a.clone()))
            .collect();
        due.sort_by_key(|(at, a)| (*at, a.created_at));
        due.truncate(query.limit);
        Ok(due.into_iter().map(|(_, a)| a).collect())
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> DeliveryResult<usize> {
        let mut pending = self.pending.write().await;
        let before = pending.len();
        pending.retain(|_, ack| ack.created_at >= cutoff);
        Ok(before - pending.len())
    }
}

#[async_trait]
impl UserRepository for MemoryStore {
    async fn get_presence(&self, user_id: UserId) -> DeliveryResult<Option<Presence>> {
        Ok(self
            .users
            .read()
            .await
            .get(&user_id)
            .map(|row| row.presence.clone()))
    }

    async fn set_online(&self, user_id: UserId, at: DateTime<Utc>) -> DeliveryResult<()> {
        let mut users = self.users.write().await;
        let row = users.entry(user_id).or_insert_with(|| UserRow {
            display_name: None,
            presence: Presence::offline(user_id),
        });
        row.presence.is_online = true;
        row.presence.last_seen_at = Some(at);
        Ok(())
    }

    async fn set_offline(&self, user_id: UserId, last_seen_at: DateTime<Utc>) -> DeliveryResult<()> {
        let mut users = self.users.write().await;
        let row = users
            .get_mut(&user_id)
            .ok_or_else(|| DeliveryError::NotFound(format!("user {}", user_id)))?;
        row.presence.is_online = false;
        row.presence.last_seen_at = Some(last_seen_at);
        Ok(())
    }

    async fn record_heartbeat(&self, user_id: UserId, at: DateTime<Utc>) -> DeliveryResult<()> {
        let mut users = self.users.write().await;
        let row = users.entry(user_id).or_insert_with(|| UserRow {
            display_name: None,
            presence: Presence::offline(user_id),
        });
        row.presence.is_online = true;
        row.presence.last_heartbeat_at = Some(at);
        Ok(())
    }

    async fn list_online(&self) -> DeliveryResult<Vec<Presence>> {
        Ok(self
            .users
            .read()
            .await
            .values()
            .filter(|row| row.presence.is_online)
            .map(|row| row.presence.clone())
            .collect())
    }

    async fn mark_offline_if_stale(
        &self,
        user_id: UserId,
        cutoff: DateTime<Utc>,
        last_seen_at: DateTime<Utc>,
    ) -> DeliveryResult<bool> {
        let mut users = self.users.write().await;
        let Some(row) = users.get_mut(&user_id) else {
            return Ok(false);
        };
        let stale = match row.presence.last_alive_at() {
            Some(alive) => alive <= cutoff,
            None => true,
        };
        if !row.presence.is_online || !stale {
            return Ok(false);
        }
        row.presence.is_online = false;
        row.presence.last_seen_at = Some(last_seen_at);
        Ok(true)
    }

    async fn display_name(&self, user_id: UserId) -> DeliveryResult<Option<String>> {
        Ok(self
            .users
            .read()
            .await
            .get(&user_id)
            .and_then(|row| row.display_name.clone()))
    }
}

#[async_trait]
impl DeviceTokenRepository for MemoryStore {
    async fn list_active_tokens(&self, user_id: UserId) -> DeliveryResult<Vec<DeviceToken>> {
        Ok(self
            .tokens
            .read()
            .await
            .iter()
            .filter(|t| t.user_id == user_id && t.active)
            .cloned()
            .collect())
    }

    async fn deactivate_token(&self, token: &str) -> DeliveryResult<()> {
        let mut tokens = self.tokens.write().await;
        for entry in tokens.iter_mut().filter(|t| t.token == token) {
            entry.active = false;
        }
        Ok(())
    }
}
