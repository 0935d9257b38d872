//! Message lifecycle status

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle stage of a message
///
/// The wire code is fixed (`Sending=0` .. `Failed=5`). Progress ordering is
/// given by [`MessageStatus::rank`], not by the code: `Failed` is a sentinel
/// outside the `Sent < Delivered < Read < Played` chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Played,
    Failed,
}

impl MessageStatus {
    /// Numeric code sent to clients
    pub fn code(self) -> u8 {
        match self {
            MessageStatus::Sending => 0,
            MessageStatus::Sent => 1,
            MessageStatus::Delivered => 2,
            MessageStatus::Read => 3,
            MessageStatus::Played => 4,
            MessageStatus::Failed => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(MessageStatus::Sending),
            1 => Some(MessageStatus::Sent),
            2 => Some(MessageStatus::Delivered),
            3 => Some(MessageStatus::Read),
            4 => Some(MessageStatus::Played),
            5 => Some(MessageStatus::Failed),
            _ => None,
        }
    }

    /// Position on the progress chain; `None` for `Failed`
    pub fn rank(self) -> Option<u8> {
        match self {
            MessageStatus::Sending => Some(0),
            MessageStatus::Sent => Some(1),
            MessageStatus::Delivered => Some(2),
            MessageStatus::Read => Some(3),
            MessageStatus::Played => Some(4),
            MessageStatus::Failed => None,
        }
    }

    /// Whether moving from `self` to `next` is forward progress
    ///
    /// Nothing advances out of a progress stage into `Failed`, and `Failed`
    /// can be superseded by any progress stage.
    pub fn advances_to(self, next: MessageStatus) -> bool {
        match (self.rank(), next.rank()) {
            (Some(current), Some(candidate)) => candidate > current,
            (None, Some(_)) => true,
            (Some(current), None) => current == 0,
            (None, None) => false,
        }
    }

    /// Stages a client may acknowledge
    pub fn is_acknowledgeable(self) -> bool {
        matches!(
            self,
            MessageStatus::Delivered | MessageStatus::Read | MessageStatus::Played
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Played => "played",
            MessageStatus::Failed => "failed",
        }
    }
}

impl Default for MessageStatus {
    fn default() -> Self {
        MessageStatus::Sending
    }
}

impl From<MessageStatus> for u8 {
    fn from(status: MessageStatus) -> Self {
        status.code()
    }
}

impl TryFrom<u8> for MessageStatus {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        MessageStatus::from_code(code).ok_or_else(|| format!("unknown status code {}", code))
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
