//! Connection registry
//!
//! Tracks which live sessions each user has and which users belong to each
//! chat's broadcast group. This is the only state mutated by arbitrarily many
//! concurrent callers without going through persistence, so both maps are
//! sharded (`DashMap`) and never locked as a whole.
//!
//! Group membership is user-level and survives disconnects; a broadcast to a
//! group resolves to whatever sessions the members have at send time.

use crate::events::ClientEvent;
use crate::model::{ChatId, SessionId, UserId};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tracing::trace;

/// Outbound half of a session's event channel
pub type EventSender = mpsc::UnboundedSender<ClientEvent>;

/// Inbound half, held by the transport that writes to the socket
pub type EventReceiver = mpsc::UnboundedReceiver<ClientEvent>;

/// Live sessions and broadcast groups
#[derive(Default)]
pub struct ConnectionRegistry {
    sessions: DashMap<UserId, HashMap<SessionId, EventSender>>,
    groups: DashMap<ChatId, HashSet<UserId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a live session for `user`
    pub fn register(&self, user: UserId, session: SessionId, sender: EventSender) {
        self.sessions.entry(user).or_default().insert(session, sender);
        trace!(%user, %session, "Session registered");
    }

    /// Remove a session; returns `true` when it was the user's last one
    ///
    /// The user's entry is dropped as soon as its session set is empty.
    pub fn unregister(&self, user: UserId, session: SessionId) -> bool {
        if let Some(mut sessions) = self.sessions.get_mut(&user) {
            sessions.remove(&session);
        }
        let emptied = self
            .sessions
            .remove_if(&user, |_, sessions| sessions.is_empty())
            .is_some();
        trace!(%user, %session, emptied, "Session unregistered");
        emptied
    }

    pub fn sessions_for(&self, user: UserId) -> HashSet<SessionId> {
        self.sessions
            .get(&user)
            .map(|sessions| sessions.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_online(&self, user: UserId) -> bool {
        self.sessions.contains_key(&user)
    }

    /// Number of users with at least one session
    pub fn online_users(&self) -> usize {
        self.sessions.len()
    }

    /// Total number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.iter().map(|entry| entry.value().len()).sum()
    }

    /// Send to every session of `user`; returns how many accepted the event
    pub fn send_to_user(&self, user: UserId, event: &ClientEvent) -> usize {
        let Some(sessions) = self.sessions.get(&user) else {
            return 0;
        };
        sessions
            .values()
            .filter(|sender| sender.send(event.clone()).is_ok())
            .count()
    }

    /// Send to one specific session
    pub fn send_to_session(&self, user: UserId, session: SessionId, event: ClientEvent) -> bool {
        self.sessions
            .get(&user)
            .and_then(|sessions| sessions.get(&session).map(|sender| sender.send(event).is_ok()))
            .unwrap_or(false)
    }

    pub fn join_group(&self, chat: ChatId, user: UserId) {
        self.groups.entry(chat).or_default().insert(user);
    }

    pub fn leave_group(&self, chat: ChatId, user: UserId) {
        if let Some(mut members) = self.groups.get_mut(&chat) {
            members.remove(&user);
        }
        self.groups.remove_if(&chat, |_, members| members.is_empty());
    }

    pub fn group_members(&self, chat: ChatId) -> Vec<UserId> {
        self.groups
            .get(&chat)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Fan an event out to every member's sessions, optionally skipping one user
    ///
    /// Best effort: each currently registered session gets the event once.
    pub fn send_to_group(&self, chat: ChatId, event: &ClientEvent, except: Option<UserId>) -> usize {
        // Snapshot members first so no group shard lock is held while sending.
        let members = self.group_members(chat);
        members
            .into_iter()
            .filter(|member| Some(*member) != except)
            .map(|member| self.send_to_user(member, event))
            .sum()
    }
}
