//! Domain types shared by every component

mod ids;
mod status;
mod types;

pub use ids::{ChatId, EventId, MessageId, SessionId, UserId};
pub use status::MessageStatus;
pub use types::{
    AckKind, Chat, ChatKind, DeliveryReceipt, DeviceToken, FeedPosition, Message,
    MessageContent, MessageStatusEvent, PendingAck, Presence, StatusSource,
};
