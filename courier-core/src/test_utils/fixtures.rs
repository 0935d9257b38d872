//! A fully wired engine on top of the in-memory store

use super::recorders::RecordingPushGateway;
use crate::clock::{Clock, ManualClock};
use crate::config::Config;
use crate::gateway::{Gateway, Transport};
use crate::model::{ChatId, ChatKind, DeviceToken, Message, MessageContent, UserId};
use crate::presence::PresenceMonitor;
use crate::push::PushGateway;
use crate::registry::ConnectionRegistry;
use crate::retry::RetryScheduler;
use crate::store::{MemoryStore, Repositories};
use std::sync::Arc;
use std::time::Duration;

/// Gateway, store, clock and push recorder sharing one state
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub registry: Arc<ConnectionRegistry>,
    pub gateway: Arc<Gateway>,
    pub push: Arc<RecordingPushGateway>,
    pub config: Config,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let registry = Arc::new(ConnectionRegistry::new());
        let gateway = Arc::new(Gateway::new(
            registry.clone(),
            Repositories::in_memory(store.clone()),
            clock.clone(),
            config.gateway.clone(),
        ));

        Self {
            store,
            clock,
            registry,
            gateway,
            push: Arc::new(RecordingPushGateway::new()),
            config,
        }
    }

    pub fn repos(&self) -> Repositories {
        Repositories::in_memory(self.store.clone())
    }

    /// Scheduler resending through the gateway, pushing to the recorder
    pub fn retry_scheduler(&self) -> RetryScheduler {
        self.retry_scheduler_with(self.gateway.clone(), Some(self.push.clone()))
    }

    pub fn retry_scheduler_with(
        &self,
        transport: Arc<dyn Transport>,
        push: Option<Arc<dyn PushGateway>>,
    ) -> RetryScheduler {
        RetryScheduler::new(
            self.repos(),
            transport,
            push,
            self.clock.clone(),
            self.config.retry.clone(),
        )
    }

    pub fn presence_monitor(&self) -> PresenceMonitor {
        PresenceMonitor::new(
            self.repos(),
            self.gateway.clone(),
            self.clock.clone(),
            self.config.presence.clone(),
        )
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    pub async fn user(&self, name: &str) -> UserId {
        let id = UserId::generate();
        self.store.add_user(id, Some(name)).await;
        id
    }

    pub async fn private_chat(&self, a: UserId, b: UserId) -> ChatId {
        self.store.add_chat(ChatKind::Private, vec![a, b]).await
    }

    pub async fn group_chat(&self, members: &[UserId]) -> ChatId {
        self.store.add_chat(ChatKind::Group, members.to_vec()).await
    }

    /// Persist a text message without dispatching it
    pub async fn post(&self, chat_id: ChatId, sender: UserId, body: &str) -> Message {
        let message = Message::new(chat_id, sender, MessageContent::text(body), self.clock.now());
        self.store.insert_message(message.clone()).await;
        message
    }

    /// Persist and dispatch a text message
    pub async fn send(&self, chat_id: ChatId, sender: UserId, body: &str) -> Message {
        let message = self.post(chat_id, sender, body).await;
        self.gateway
            .dispatch_message(message.id)
            .await
            .expect("dispatch failed");
        message
    }

    pub async fn add_device(&self, user: UserId, token: &str) {
        self.store
            .add_device_token(DeviceToken {
                user_id: user,
                token: token.to_string(),
                platform: "android".to_string(),
                active: true,
            })
            .await;
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
