//! Realtime gateway
//!
//! Entry point for every call a connected client makes and for every event the
//! server pushes back. The gateway's only mutable state is the
//! [`ConnectionRegistry`]; everything persisted goes through the repository
//! ports, and broadcasts always happen after the write they announce.
//!
//! Expected failure modes never reach the caller: unknown ids and self-acks
//! are ignored at debug level, backend failures are logged at error level.

use crate::clock::Clock;
use crate::config::GatewayConfig;
use crate::error::{bounded, DeliveryResult};
use crate::events::ClientEvent;
use crate::metrics;
use crate::model::{AckKind, ChatId, Message, MessageId, MessageStatus, PendingAck, SessionId, StatusSource, UserId};
use crate::registry::{ConnectionRegistry, EventReceiver};
use crate::status::StatusTracker;
use crate::store::Repositories;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

mod acks;
mod sync;

pub use sync::{ChatSync, SyncCursor, SyncResult, SyncedMessage};

/// Identity of the connection making a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Caller {
    pub user_id: UserId,
    pub session_id: SessionId,
}

/// A freshly opened client connection
pub struct Connection {
    pub caller: Caller,
    /// Events to write to the client's socket
    pub events: EventReceiver,
}

/// Port used by background schedulers to reach live clients
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send to every live session of `user`; no-op when there is none
    async fn send_to_user(&self, user: UserId, event: ClientEvent) -> usize;

    async fn is_connected(&self, user: UserId) -> bool;
}

/// The realtime gateway service
pub struct Gateway {
    registry: Arc<ConnectionRegistry>,
    repos: Repositories,
    tracker: StatusTracker,
    clock: Arc<dyn Clock>,
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        repos: Repositories,
        clock: Arc<dyn Clock>,
        config: GatewayConfig,
    ) -> Self {
        let tracker = StatusTracker::new(repos.clone(), clock.clone(), config.io_timeout);
        Self {
            registry,
            repos,
            tracker,
            clock,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn tracker(&self) -> &StatusTracker {
        &self.tracker
    }

    /// Open a session for `user`
    ///
    /// Joins the broadcast group of every chat the user belongs to, marks the
    /// user online and tells the other members.
    pub async fn connect(&self, user: UserId) -> Connection {
        let session = SessionId::generate();
        let (tx, rx) = mpsc::unbounded_channel();
        self.registry.register(user, session, tx);
        metrics::record_gauge(metrics::GATEWAY_SESSIONS, self.registry.session_count() as f64);

        let chats = self.chats_of(user).await;
        for chat in &chats {
            self.registry.join_group(*chat, user);
        }

        let now = self.clock.now();
        if let Err(e) = bounded(self.config.io_timeout, "set online", self.repos.users.set_online(user, now)).await {
            error!(%user, error = %e, "Failed to mark user online");
        }
        self.broadcast_presence_to(user, true, Some(now), &chats);

        info!(%user, %session, chats = chats.len(), "Client connected");
        Connection {
            caller: Caller {
                user_id: user,
                session_id: session,
            },
            events: rx,
        }
    }

    /// Close a session
    ///
    /// Presence only flips offline when the user's last session goes away.
    /// Group membership is left in place for the next connect.
    pub async fn disconnect(&self, caller: &Caller) {
        let user = caller.user_id;
        let last = self.registry.unregister(user, caller.session_id);
        metrics::record_gauge(metrics::GATEWAY_SESSIONS, self.registry.session_count() as f64);
        info!(%user, session = %caller.session_id, last, "Client disconnected");
        if !last {
            return;
        }

        if self.registry.is_online(user) {
            debug!(%user, "Reconnected before going offline");
            return;
        }

        let now = self.clock.now();
        if let Err(e) = bounded(self.config.io_timeout, "set offline", self.repos.users.set_offline(user, now)).await {
            error!(%user, error = %e, "Failed to mark user offline");
        }
        // A connect that registered meanwhile may have written online first
        if self.registry.is_online(user) {
            debug!(%user, "Reconnected while going offline, restoring presence");
            if let Err(e) = bounded(self.config.io_timeout, "set online", self.repos.users.set_online(user, now)).await {
                error!(%user, error = %e, "Failed to restore online presence");
            }
            return;
        }
        self.broadcast_presence(user, false, Some(now)).await;
    }

    /// Fan a freshly persisted message out to its recipients
    ///
    /// Appends the server `Sent` event, pushes `MessageReceived` to every live
    /// recipient session and registers one `NewMessage` pending ack per
    /// recipient. Unknown messages are ignored.
    pub async fn dispatch_message(&self, message_id: MessageId) -> DeliveryResult<()> {
        let Some(message) = self.load_message(message_id).await? else {
            debug!(%message_id, "Dispatch requested for unknown message");
            return Ok(());
        };
        let participants = bounded(
            self.config.io_timeout,
            "list participants",
            self.repos.chats.list_participants(message.chat_id),
        )
        .await?;

        self.tracker
            .append_event(message.id, MessageStatus::Sent, None, StatusSource::Server)
            .await?;
        let status = match self.tracker.refresh(&message).await {
            Ok(changed) => changed.unwrap_or(message.status),
            Err(e) => {
                error!(%message_id, error = %e, "Failed to refresh status after dispatch");
                message.status
            }
        };
        let event = ClientEvent::MessageReceived(Message { status, ..message.clone() });

        let now = self.clock.now();
        let mut live = 0usize;
        for recipient in participants.into_iter().filter(|p| *p != message.sender_id) {
            if self.registry.send_to_user(recipient, &event) > 0 {
                live += 1;
            }
            let ack = PendingAck::new(message.id, recipient, AckKind::NewMessage, now);
            if let Err(e) = bounded(
                self.config.io_timeout,
                "create pending ack",
                self.repos.pending_acks.create_if_absent(ack),
            )
            .await
            {
                error!(%message_id, %recipient, error = %e, "Failed to register pending ack");
            }
        }

        metrics::record_counter(metrics::MESSAGES_DISPATCHED, 1);
        debug!(%message_id, chat_id = %message.chat_id, live, "Message dispatched");
        Ok(())
    }

    /// Broadcast a typing indicator to the other members of a chat
    pub async fn typing_indicator(&self, caller: &Caller, chat_id: ChatId, is_typing: bool) {
        let user = caller.user_id;
        if !self.registry.group_members(chat_id).contains(&user) {
            debug!(%user, %chat_id, "Typing indicator from non-member ignored");
            return;
        }

        let display_name = match bounded(
            self.config.io_timeout,
            "load display name",
            self.repos.users.display_name(user),
        )
        .await
        {
            Ok(Some(name)) => name,
            Ok(None) => user.to_string(),
            Err(e) => {
                warn!(%user, error = %e, "Failed to load display name");
                user.to_string()
            }
        };

        let event = ClientEvent::TypingIndicator {
            user_id: user,
            display_name,
            is_typing,
            chat_id,
        };
        self.registry.send_to_group(chat_id, &event, Some(user));
    }

    /// Record a heartbeat and answer the calling session
    pub async fn heartbeat(&self, caller: &Caller) {
        let now = self.clock.now();
        if let Err(e) = bounded(
            self.config.io_timeout,
            "record heartbeat",
            self.repos.users.record_heartbeat(caller.user_id, now),
        )
        .await
        {
            error!(user = %caller.user_id, error = %e, "Failed to record heartbeat");
        }
        self.registry.send_to_session(
            caller.user_id,
            caller.session_id,
            ClientEvent::HeartbeatAck { server_time: now },
        );
    }

    /// The sender's client confirms it saw the latest status of a message
    pub async fn confirm_status_update(&self, caller: &Caller, message_id: MessageId) {
        match bounded(
            self.config.io_timeout,
            "delete pending ack",
            self.repos
                .pending_acks
                .delete_pending(message_id, caller.user_id, AckKind::StatusUpdate),
        )
        .await
        {
            Ok(true) => debug!(%message_id, user = %caller.user_id, "Status update confirmed"),
            Ok(false) => debug!(%message_id, user = %caller.user_id, "No pending status update to confirm"),
            Err(e) => error!(%message_id, error = %e, "Failed to confirm status update"),
        }
    }

    /// Tell every chat `user` shares with others about a presence change
    pub async fn broadcast_presence(&self, user: UserId, is_online: bool, last_seen_at: Option<DateTime<Utc>>) {
        let chats = self.chats_of(user).await;
        self.broadcast_presence_to(user, is_online, last_seen_at, &chats);
    }

    fn broadcast_presence_to(
        &self,
        user: UserId,
        is_online: bool,
        last_seen_at: Option<DateTime<Utc>>,
        chats: &[ChatId],
    ) {
        let event = ClientEvent::UserStatusChanged {
            user_id: user,
            is_online,
            last_seen_at,
        };
        for chat in chats {
            self.registry.send_to_group(*chat, &event, Some(user));
        }
    }

    async fn chats_of(&self, user: UserId) -> Vec<ChatId> {
        match bounded(
            self.config.io_timeout,
            "list chats",
            self.repos.chats.list_chats_for_user(user),
        )
        .await
        {
            Ok(chats) => chats,
            Err(e) => {
                error!(%user, error = %e, "Failed to load chat memberships");
                Vec::new()
            }
        }
    }

    async fn load_message(&self, message_id: MessageId) -> DeliveryResult<Option<Message>> {
        bounded(
            self.config.io_timeout,
            "load message",
            self.repos.messages.get_message(message_id),
        )
        .await
    }
}

#[async_trait]
impl Transport for Gateway {
    async fn send_to_user(&self, user: UserId, event: ClientEvent) -> usize {
        self.registry.send_to_user(user, &event)
    }

    async fn is_connected(&self, user: UserId) -> bool {
        self.registry.is_online(user)
    }
}

#[cfg(test)]
mod tests;
