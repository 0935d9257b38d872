//! Push gateway port
//!
//! Secondary delivery channel used when a recipient has no live connection.
//! The engine never requires a push gateway; without one the fallback path is
//! simply skipped.

use crate::error::DeliveryResult;
use crate::model::Message;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const PREVIEW_CHARS: usize = 100;

/// A notification as handed to the push provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushNotification {
    pub title: String,
    pub body: String,
    pub data: BTreeMap<String, String>,
}

impl PushNotification {
    /// Notification announcing a new message
    pub fn new_message(message: &Message, sender_name: Option<&str>) -> Self {
        let mut body: String = message.content.body.chars().take(PREVIEW_CHARS).collect();
        if message.content.body.chars().count() > PREVIEW_CHARS {
            body.push('…');
        }

        let mut data = BTreeMap::new();
        data.insert("type".to_string(), "new_message".to_string());
        data.insert("message_id".to_string(), message.id.to_string());
        data.insert("chat_id".to_string(), message.chat_id.to_string());

        Self {
            title: sender_name.unwrap_or("New message").to_string(),
            body,
            data,
        }
    }
}

/// Result of one push attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PushOutcome {
    pub delivered: bool,
    /// The provider rejected the token permanently
    pub token_invalid: bool,
}

impl PushOutcome {
    pub fn delivered() -> Self {
        Self {
            delivered: true,
            token_invalid: false,
        }
    }

    pub fn transient_failure() -> Self {
        Self::default()
    }

    pub fn invalid_token() -> Self {
        Self {
            delivered: false,
            token_invalid: true,
        }
    }
}

/// Push notification provider
#[async_trait]
pub trait PushGateway: Send + Sync {
    async fn send(&self, token: &str, notification: &PushNotification) -> DeliveryResult<PushOutcome>;

    /// Send to several tokens; an error on one token counts as a transient failure
    async fn send_batch(
        &self,
        tokens: &[String],
        notification: &PushNotification,
    ) -> Vec<(String, PushOutcome)> {
        let mut outcomes = Vec::with_capacity(tokens.len());
        for token in tokens {
            let outcome = match self.send(token, notification).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(error = %e, "Push send failed");
                    PushOutcome::transient_failure()
                }
            };
            outcomes.push((token.clone(), outcome));
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChatId, MessageContent, UserId};
    use chrono::Utc;

    #[test]
    fn test_new_message_notification() {
        let message = Message::new(
            ChatId::generate(),
            UserId::generate(),
            MessageContent::text("hello there"),
            Utc::now(),
        );
        let notification = PushNotification::new_message(&message, Some("Ada"));

        assert_eq!(notification.title, "Ada");
        assert_eq!(notification.body, "hello there");
        assert_eq!(notification.data["message_id"], message.id.to_string());
        assert_eq!(notification.data["type"], "new_message");
    }

    #[test]
    fn test_long_body_is_truncated() {
        let message = Message::new(
            ChatId::generate(),
            UserId::generate(),
            MessageContent::text("x".repeat(500)),
            Utc::now(),
        );
        let notification = PushNotification::new_message(&message, None);

        assert_eq!(notification.title, "New message");
        assert_eq!(notification.body.chars().count(), PREVIEW_CHARS + 1);
    }
}
