//! Incremental sync for reconnecting clients

use super::{Caller, Gateway};
use crate::error::{bounded, DeliveryResult};
use crate::model::{ChatId, FeedPosition, Message, MessageStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// A message the client may have missed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncedMessage {
    pub message: Message,
    /// Delivery progress was recorded after the sync point
    pub has_status_update: bool,
}

/// Where the next page of a chat's sync starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    /// Sync point the client asked for
    pub since: DateTime<Utc>,
    /// Last message of the previous page
    pub after: FeedPosition,
}

/// Missed messages of one chat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSync {
    pub chat_id: ChatId,
    pub messages: Vec<SyncedMessage>,
    /// More changes exist beyond this page
    pub has_more: bool,
    /// Pass to [`Gateway::continue_sync`] for the rest; set with `has_more`
    pub next_cursor: Option<SyncCursor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    /// Use as `since` for the next sync once every chat is paged through
    pub server_time: DateTime<Utc>,
    pub chats: Vec<ChatSync>,
}

impl Gateway {
    /// Everything created or updated after `since`
    ///
    /// With `chat_ids` the sync is limited to those chats (the caller must be a
    /// member); otherwise every chat the caller belongs to is included. Each
    /// chat returns at most `sync_page_size` messages, least recently active
    /// first, and a cursor for the rest.
    pub async fn incremental_sync(
        &self,
        caller: &Caller,
        since: DateTime<Utc>,
        chat_ids: Option<&[ChatId]>,
    ) -> SyncResult {
        let server_time = self.clock.now();
        let memberships = self.chats_of(caller.user_id).await;
        let targets: Vec<ChatId> = match chat_ids {
            Some(requested) => {
                let mut targets = Vec::new();
                for chat in requested {
                    if memberships.contains(chat) && !targets.contains(chat) {
                        targets.push(*chat);
                    }
                }
                targets
            }
            None => memberships,
        };

        let mut chats = Vec::with_capacity(targets.len());
        for chat_id in targets {
            match self.chat_page(chat_id, since, None).await {
                Ok(page) => chats.push(page),
                Err(e) => error!(%chat_id, error = %e, "Failed to load messages for sync"),
            }
        }

        debug!(
            user = %caller.user_id,
            %since,
            chats = chats.len(),
            "Incremental sync served"
        );
        SyncResult { server_time, chats }
    }

    /// Next page of a chat after a sync that reported `has_more`
    ///
    /// Messages whose status moves while the client pages are moved to the
    /// end of the feed, so nothing is skipped.
    pub async fn continue_sync(
        &self,
        caller: &Caller,
        chat_id: ChatId,
        cursor: SyncCursor,
    ) -> DeliveryResult<Option<ChatSync>> {
        if !self.chats_of(caller.user_id).await.contains(&chat_id) {
            debug!(user = %caller.user_id, %chat_id, "Sync continuation for foreign chat ignored");
            return Ok(None);
        }
        self.chat_page(chat_id, cursor.since, Some(cursor.after))
            .await
            .map(Some)
    }

    async fn chat_page(
        &self,
        chat_id: ChatId,
        since: DateTime<Utc>,
        after: Option<FeedPosition>,
    ) -> DeliveryResult<ChatSync> {
        let page_size = self.config.sync_page_size;
        let mut page = bounded(
            self.config.io_timeout,
            "list changed messages",
            self.repos
                .messages
                .list_changed_since(chat_id, since, after, page_size + 1),
        )
        .await?;

        let has_more = page.len() > page_size;
        page.truncate(page_size);
        let next_cursor = match page.last() {
            Some(last) if has_more => Some(SyncCursor {
                since,
                after: last.feed_position(),
            }),
            _ => None,
        };
        let messages = page
            .into_iter()
            .map(|message| SyncedMessage {
                has_status_update: has_progress_since(&message, since),
                message,
            })
            .collect();
        Ok(ChatSync {
            chat_id,
            messages,
            has_more,
            next_cursor,
        })
    }
}

fn has_progress_since(message: &Message, since: DateTime<Utc>) -> bool {
    let progressed = MessageStatus::Sent.advances_to(message.status);
    progressed && message.status_updated_at.map_or(false, |at| at > since)
}
