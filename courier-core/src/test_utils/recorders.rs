//! Recording fakes for the push and transport ports

use crate::error::{DeliveryError, DeliveryResult};
use crate::events::ClientEvent;
use crate::gateway::Transport;
use crate::model::UserId;
use crate::push::{PushGateway, PushNotification, PushOutcome};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Push gateway that records every attempt
///
/// Tokens deliver successfully unless configured otherwise.
#[derive(Default)]
pub struct RecordingPushGateway {
    sent: Mutex<Vec<(String, PushNotification)>>,
    outcomes: Mutex<HashMap<String, PushOutcome>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingPushGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `outcome` for every send to `token`
    pub fn set_outcome(&self, token: &str, outcome: PushOutcome) {
        self.outcomes
            .lock()
            .unwrap()
            .insert(token.to_string(), outcome);
    }

    /// Make sends to `token` return a transport error
    pub fn fail_token(&self, token: &str) {
        self.failing.lock().unwrap().insert(token.to_string());
    }

    pub fn sent(&self) -> Vec<(String, PushNotification)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn send_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl PushGateway for RecordingPushGateway {
    async fn send(&self, token: &str, notification: &PushNotification) -> DeliveryResult<PushOutcome> {
        self.sent
            .lock()
            .unwrap()
            .push((token.to_string(), notification.clone()));
        if self.failing.lock().unwrap().contains(token) {
            return Err(DeliveryError::Push(format!("provider unreachable for {}", token)));
        }
        Ok(self
            .outcomes
            .lock()
            .unwrap()
            .get(token)
            .copied()
            .unwrap_or_else(PushOutcome::delivered))
    }
}

/// Transport that records sends instead of reaching real sessions
#[derive(Default)]
pub struct RecordingTransport {
    connected: Mutex<HashSet<UserId>>,
    sent: Mutex<Vec<(UserId, ClientEvent)>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connected(&self, user: UserId, connected: bool) {
        let mut users = self.connected.lock().unwrap();
        if connected {
            users.insert(user);
        } else {
            users.remove(&user);
        }
    }

    pub fn sent(&self) -> Vec<(UserId, ClientEvent)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, user: UserId) -> Vec<ClientEvent> {
        self.sent()
            .into_iter()
            .filter(|(u, _)| *u == user)
            .map(|(_, e)| e)
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send_to_user(&self, user: UserId, event: ClientEvent) -> usize {
        if !self.connected.lock().unwrap().contains(&user) {
            return 0;
        }
        self.sent.lock().unwrap().push((user, event));
        1
    }

    async fn is_connected(&self, user: UserId) -> bool {
        self.connected.lock().unwrap().contains(&user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_recording_push_outcomes() {
        let push = RecordingPushGateway::new();
        push.set_outcome("dead", PushOutcome::invalid_token());
        push.fail_token("flaky");
        let notification = PushNotification {
            title: "t".into(),
            body: "b".into(),
            data: Default::default(),
        };

        let outcomes = push
            .send_batch(&["ok".into(), "dead".into(), "flaky".into()], &notification)
            .await;

        assert_eq!(outcomes[0].1, PushOutcome::delivered());
        assert_eq!(outcomes[1].1, PushOutcome::invalid_token());
        assert_eq!(outcomes[2].1, PushOutcome::transient_failure());
        assert_eq!(push.send_count(), 3);
    }

    #[tokio::test]
    async fn test_recording_transport_only_reaches_connected() {
        let transport = RecordingTransport::new();
        let user = UserId::generate();
        let event = ClientEvent::HeartbeatAck { server_time: Utc::now() };

        assert_eq!(transport.send_to_user(user, event.clone()).await, 0);
        transport.set_connected(user, true);
        assert_eq!(transport.send_to_user(user, event).await, 1);
        assert_eq!(transport.sent_to(user).len(), 1);
    }
}
