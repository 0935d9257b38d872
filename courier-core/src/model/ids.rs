/*
    ids.rs - Typed identifiers

    Every entity is keyed by a UUID wrapped in its own newtype so a chat id can
    never be passed where a message id is expected. Parsing failures surface as
    `DeliveryError::InvalidId`, the only malformed-input error the gateway
    reports back to a client.
*/

use crate::error::DeliveryError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random identifier
            pub fn generate() -> Self {
                $name(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                $name(id)
            }
        }

        impl FromStr for $name {
            type Err = DeliveryError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s)
                    .map($name)
                    .map_err(|e| DeliveryError::InvalidId(format!("{} '{}': {}", $label, s, e)))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

typed_id!(
    /// Identity of a user account
    UserId,
    "user id"
);
typed_id!(
    /// Identity of a private or group chat
    ChatId,
    "chat id"
);
typed_id!(
    /// Identity of a persisted message
    MessageId,
    "message id"
);
typed_id!(
    /// Identity of one live transport connection
    SessionId,
    "session id"
);
typed_id!(
    /// Identity of a status event in the append-only log
    EventId,
    "event id"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trip() {
        let id = MessageId::generate();
        let parsed: MessageId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = "not-a-uuid".parse::<ChatId>().unwrap_err();
        assert!(matches!(err, DeliveryError::InvalidId(_)));
        assert!(err.to_string().contains("chat id"));
    }

    #[test]
    fn test_serializes_as_plain_uuid() {
        let id = UserId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.0));
    }
}
