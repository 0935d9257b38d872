use super::*;
use crate::config::Config;
use crate::error::DeliveryError;
use crate::store::{PendingAckRepository, ReceiptRepository, StatusEventRepository, UserRepository};
use crate::test_utils::{drain, drain_named, Harness};
use std::time::Duration;

fn status_updates(events: Vec<ClientEvent>) -> Vec<(MessageId, MessageStatus)> {
    events
        .into_iter()
        .filter_map(|e| match e {
            ClientEvent::StatusUpdated { message_id, status } => Some((message_id, status)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_connect_announces_presence() {
    let h = Harness::new();
    let (a, b) = (h.user("ada").await, h.user("bob").await);
    h.private_chat(a, b).await;
    let mut bob = h.gateway.connect(b).await;

    let ada = h.gateway.connect(a).await;
    assert!(h.registry.is_online(a));
    assert!(h.registry.sessions_for(a).contains(&ada.caller.session_id));
    assert!(h.store.get_presence(a).await.unwrap().unwrap().is_online);

    assert_eq!(
        drain(&mut bob.events),
        vec![ClientEvent::UserStatusChanged {
            user_id: a,
            is_online: true,
            last_seen_at: Some(h.clock.now()),
        }]
    );
}

#[tokio::test]
async fn test_disconnect_goes_offline_after_last_session() {
    let h = Harness::new();
    let (a, b) = (h.user("ada").await, h.user("bob").await);
    h.private_chat(a, b).await;
    let mut bob = h.gateway.connect(b).await;
    let phone = h.gateway.connect(a).await;
    let laptop = h.gateway.connect(a).await;
    drain(&mut bob.events);

    h.gateway.disconnect(&phone.caller).await;
    assert!(h.registry.is_online(a));
    assert!(drain(&mut bob.events).is_empty());

    h.advance(Duration::from_secs(5));
    h.gateway.disconnect(&laptop.caller).await;
    assert!(!h.registry.is_online(a));

    let presence = h.store.get_presence(a).await.unwrap().unwrap();
    assert!(!presence.is_online);
    assert_eq!(presence.last_seen_at, Some(h.clock.now()));
    assert_eq!(
        drain(&mut bob.events),
        vec![ClientEvent::UserStatusChanged {
            user_id: a,
            is_online: false,
            last_seen_at: Some(h.clock.now()),
        }]
    );
}

#[tokio::test]
async fn test_dispatch_reaches_live_recipients_and_tracks_all() {
    let h = Harness::new();
    let (a, b, c) = (h.user("ada").await, h.user("bob").await, h.user("cy").await);
    let chat = h.group_chat(&[a, b, c]).await;
    let mut ada = h.gateway.connect(a).await;
    let mut bob = h.gateway.connect(b).await;
    drain(&mut ada.events);

    let message = h.send(chat, a, "hello group").await;

    let received = drain_named(&mut bob.events, "MessageReceived");
    assert_eq!(received.len(), 1);
    match &received[0] {
        ClientEvent::MessageReceived(m) => {
            assert_eq!(m.id, message.id);
            assert_eq!(m.status, MessageStatus::Sent);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(drain_named(&mut ada.events, "MessageReceived").is_empty());

    let pending = h.store.pending_acks().await;
    let mut recipients: Vec<UserId> = pending
        .iter()
        .filter(|p| p.kind == AckKind::NewMessage)
        .map(|p| p.recipient_id)
        .collect();
    recipients.sort();
    let mut expected = vec![b, c];
    expected.sort();
    assert_eq!(recipients, expected);
    assert_eq!(pending.len(), 2);

    assert_eq!(
        h.gateway.tracker().aggregate(message.id).await.unwrap(),
        MessageStatus::Sent
    );
}

#[tokio::test]
async fn test_dispatch_of_unknown_message_is_noop() {
    let h = Harness::new();
    h.gateway.dispatch_message(MessageId::generate()).await.unwrap();
    assert!(h.store.pending_acks().await.is_empty());
}

#[tokio::test]
async fn test_delivered_ack_broadcasts_and_owes_sender() {
    let h = Harness::new();
    let (a, b) = (h.user("ada").await, h.user("bob").await);
    let chat = h.private_chat(a, b).await;
    let mut ada = h.gateway.connect(a).await;
    let mut bob = h.gateway.connect(b).await;
    let message = h.send(chat, a, "hello").await;
    drain(&mut ada.events);
    drain(&mut bob.events);

    h.gateway
        .acknowledge_delivered(&bob.caller, message.id, chat)
        .await;

    assert_eq!(
        status_updates(drain(&mut ada.events)),
        vec![(message.id, MessageStatus::Delivered)]
    );
    assert_eq!(
        status_updates(drain(&mut bob.events)),
        vec![(message.id, MessageStatus::Delivered)]
    );
    assert!(h
        .store
        .get_pending(message.id, a, AckKind::StatusUpdate)
        .await
        .unwrap()
        .is_some());

    h.gateway.confirm_status_update(&ada.caller, message.id).await;
    assert!(h
        .store
        .get_pending(message.id, a, AckKind::StatusUpdate)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_repeated_ack_has_no_side_effects() {
    let h = Harness::new();
    let (a, b) = (h.user("ada").await, h.user("bob").await);
    let chat = h.private_chat(a, b).await;
    let mut ada = h.gateway.connect(a).await;
    let bob = h.gateway.connect(b).await;
    let message = h.send(chat, a, "hello").await;

    h.gateway
        .acknowledge_delivered(&bob.caller, message.id, chat)
        .await;
    let events_after_first = h.store.list_events(message.id).await.unwrap().len();
    drain(&mut ada.events);

    h.advance(Duration::from_secs(2));
    h.gateway
        .acknowledge_delivered(&bob.caller, message.id, chat)
        .await;

    assert_eq!(events_after_first, 2);
    assert_eq!(h.store.list_events(message.id).await.unwrap().len(), 2);
    assert!(drain(&mut ada.events).is_empty());
    let receipt = h.store.get_receipt(message.id, b).await.unwrap().unwrap();
    assert!(receipt.delivered_at < Some(h.clock.now()));
}

#[tokio::test]
async fn test_sender_cannot_ack_own_message() {
    let h = Harness::new();
    let (a, b) = (h.user("ada").await, h.user("bob").await);
    let chat = h.private_chat(a, b).await;
    let mut ada = h.gateway.connect(a).await;
    let message = h.send(chat, a, "hello").await;
    drain(&mut ada.events);

    h.gateway.acknowledge_read(&ada.caller, message.id, chat).await;

    assert_eq!(h.store.receipt_count().await, 0);
    assert!(drain(&mut ada.events).is_empty());
    assert_eq!(
        h.gateway.tracker().aggregate(message.id).await.unwrap(),
        MessageStatus::Sent
    );
}

#[tokio::test]
async fn test_read_backfills_delivery() {
    let h = Harness::new();
    let (a, b) = (h.user("ada").await, h.user("bob").await);
    let chat = h.private_chat(a, b).await;
    let mut ada = h.gateway.connect(a).await;
    let bob = h.gateway.connect(b).await;
    let message = h.send(chat, a, "hello").await;
    drain(&mut ada.events);

    h.advance(Duration::from_secs(1));
    h.gateway.acknowledge_read(&bob.caller, message.id, chat).await;

    let receipt = h.store.get_receipt(message.id, b).await.unwrap().unwrap();
    assert_eq!(receipt.delivered_at, Some(h.clock.now()));
    assert_eq!(receipt.read_at, Some(h.clock.now()));
    assert_eq!(
        status_updates(drain(&mut ada.events)),
        vec![(message.id, MessageStatus::Read)]
    );
}

#[tokio::test]
async fn test_played_ack_tops_the_order() {
    let h = Harness::new();
    let (a, b) = (h.user("ada").await, h.user("bob").await);
    let chat = h.private_chat(a, b).await;
    let bob = h.gateway.connect(b).await;
    let message = h.send(chat, a, "voice note").await;

    h.gateway.acknowledge_read(&bob.caller, message.id, chat).await;
    h.gateway
        .acknowledge_played(&bob.caller, message.id, chat)
        .await;
    // a late delivery ack must not pull the status back
    h.gateway
        .acknowledge_delivered(&bob.caller, message.id, chat)
        .await;

    let receipt = h.store.get_receipt(message.id, b).await.unwrap().unwrap();
    assert!(receipt.played_at.is_some());
    assert_eq!(
        h.gateway.tracker().aggregate(message.id).await.unwrap(),
        MessageStatus::Played
    );
}

#[tokio::test]
async fn test_foreign_acks_are_ignored() {
    let h = Harness::new();
    let (a, b, eve) = (h.user("ada").await, h.user("bob").await, h.user("eve").await);
    let chat = h.private_chat(a, b).await;
    let other_chat = h.private_chat(b, eve).await;
    let bob = h.gateway.connect(b).await;
    let eve_conn = h.gateway.connect(eve).await;
    let message = h.send(chat, a, "hello").await;

    h.gateway
        .acknowledge_delivered(&eve_conn.caller, message.id, chat)
        .await;
    h.gateway
        .acknowledge_delivered(&bob.caller, message.id, other_chat)
        .await;
    h.gateway
        .acknowledge_delivered(&bob.caller, MessageId::generate(), chat)
        .await;

    assert_eq!(h.store.receipt_count().await, 0);
    assert_eq!(
        h.gateway.tracker().aggregate(message.id).await.unwrap(),
        MessageStatus::Sent
    );
}

#[tokio::test]
async fn test_group_status_follows_slowest_member() {
    let h = Harness::new();
    let (a, b, c) = (h.user("ada").await, h.user("bob").await, h.user("cy").await);
    let chat = h.group_chat(&[a, b, c]).await;
    let mut ada = h.gateway.connect(a).await;
    let bob = h.gateway.connect(b).await;
    let cy = h.gateway.connect(c).await;
    let message = h.send(chat, a, "hello all").await;
    drain(&mut ada.events);

    h.gateway
        .acknowledge_delivered(&bob.caller, message.id, chat)
        .await;
    assert!(status_updates(drain(&mut ada.events)).is_empty());

    h.gateway.acknowledge_read(&cy.caller, message.id, chat).await;
    assert_eq!(
        status_updates(drain(&mut ada.events)),
        vec![(message.id, MessageStatus::Delivered)]
    );

    h.gateway.acknowledge_read(&bob.caller, message.id, chat).await;
    assert_eq!(
        status_updates(drain(&mut ada.events)),
        vec![(message.id, MessageStatus::Read)]
    );
}

#[tokio::test]
async fn test_batch_ack_validation() {
    let mut config = Config::default();
    config.gateway.max_batch_size = 2;
    let h = Harness::with_config(config);
    let (a, b) = (h.user("ada").await, h.user("bob").await);
    let chat = h.private_chat(a, b).await;
    let bob = h.gateway.connect(b).await;
    let ids = vec![MessageId::generate(); 3];

    let err = h
        .gateway
        .acknowledge_batch(&bob.caller, chat, &ids, MessageStatus::Read)
        .await
        .unwrap_err();
    assert!(matches!(err, DeliveryError::BatchTooLarge { size: 3, limit: 2 }));

    let err = h
        .gateway
        .acknowledge_batch(&bob.caller, chat, &ids[..1], MessageStatus::Sent)
        .await
        .unwrap_err();
    assert!(matches!(err, DeliveryError::InvalidStatus(_)));
}

#[tokio::test]
async fn test_batch_ack_announces_changes_once() {
    let h = Harness::new();
    let (a, b) = (h.user("ada").await, h.user("bob").await);
    let chat = h.private_chat(a, b).await;
    let mut ada = h.gateway.connect(a).await;
    let bob = h.gateway.connect(b).await;
    let m1 = h.send(chat, a, "one").await;
    let m2 = h.send(chat, a, "two").await;
    let m3 = h.send(chat, a, "three").await;
    drain(&mut ada.events);

    let ids = vec![m1.id, m2.id, m3.id, m2.id, MessageId::generate()];
    let changed = h
        .gateway
        .acknowledge_batch(&bob.caller, chat, &ids, MessageStatus::Read)
        .await
        .unwrap();
    assert_eq!(changed, vec![m1.id, m2.id, m3.id]);
    assert_eq!(
        drain(&mut ada.events),
        vec![ClientEvent::BatchStatusUpdated {
            message_ids: vec![m1.id, m2.id, m3.id],
            status: MessageStatus::Read,
        }]
    );

    let again = h
        .gateway
        .acknowledge_batch(&bob.caller, chat, &ids, MessageStatus::Read)
        .await
        .unwrap();
    assert!(again.is_empty());
    assert!(drain(&mut ada.events).is_empty());
}

#[tokio::test]
async fn test_typing_reaches_other_members_only() {
    let h = Harness::new();
    let (a, b, c) = (h.user("ada").await, h.user("bob").await, h.user("cy").await);
    let chat = h.group_chat(&[a, b, c]).await;
    let mut ada = h.gateway.connect(a).await;
    let mut bob = h.gateway.connect(b).await;
    let mut cy = h.gateway.connect(c).await;
    drain(&mut ada.events);
    drain(&mut bob.events);
    drain(&mut cy.events);

    h.gateway.typing_indicator(&ada.caller, chat, true).await;

    let expected = vec![ClientEvent::TypingIndicator {
        user_id: a,
        display_name: "ada".to_string(),
        is_typing: true,
        chat_id: chat,
    }];
    assert_eq!(drain(&mut bob.events), expected);
    assert_eq!(drain(&mut cy.events), expected);
    assert!(drain(&mut ada.events).is_empty());
}

#[tokio::test]
async fn test_heartbeat_answers_calling_session_only() {
    let h = Harness::new();
    let a = h.user("ada").await;
    let mut phone = h.gateway.connect(a).await;
    let mut laptop = h.gateway.connect(a).await;

    h.advance(Duration::from_secs(30));
    h.gateway.heartbeat(&phone.caller).await;

    assert_eq!(
        drain(&mut phone.events),
        vec![ClientEvent::HeartbeatAck {
            server_time: h.clock.now()
        }]
    );
    assert!(drain(&mut laptop.events).is_empty());

    let presence = h.store.get_presence(a).await.unwrap().unwrap();
    assert!(presence.is_online);
    assert_eq!(presence.last_heartbeat_at, Some(h.clock.now()));
}

#[tokio::test]
async fn test_incremental_sync_pages_and_flags_updates() {
    let mut config = Config::default();
    config.gateway.sync_page_size = 2;
    let h = Harness::with_config(config);
    let (a, b, eve) = (h.user("ada").await, h.user("bob").await, h.user("eve").await);
    let chat = h.private_chat(a, b).await;
    let foreign = h.private_chat(a, eve).await;
    let bob = h.gateway.connect(b).await;

    let old = h.send(chat, a, "before the gap").await;
    h.advance(Duration::from_secs(10));
    let since = h.clock.now();
    let mut fresh = Vec::new();
    for body in ["one", "two", "three"] {
        h.advance(Duration::from_secs(1));
        fresh.push(h.send(chat, a, body).await);
    }
    h.advance(Duration::from_secs(1));
    h.gateway.acknowledge_read(&bob.caller, old.id, chat).await;

    let result = h
        .gateway
        .incremental_sync(&bob.caller, since, Some(&[chat, foreign]))
        .await;

    assert_eq!(result.server_time, h.clock.now());
    assert_eq!(result.chats.len(), 1);
    let first = &result.chats[0];
    assert_eq!(first.chat_id, chat);
    assert!(first.has_more);
    assert_eq!(first.messages.len(), 2);

    // page through the rest; the read receipt moved `old` to the end
    let mut synced = first.messages.clone();
    let mut cursor = first.next_cursor;
    while let Some(next) = cursor {
        let page = h
            .gateway
            .continue_sync(&bob.caller, chat, next)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(page.has_more, page.next_cursor.is_some());
        synced.extend(page.messages);
        cursor = page.next_cursor;
    }
    let ids: Vec<MessageId> = synced.iter().map(|m| m.message.id).collect();
    assert_eq!(ids, vec![fresh[0].id, fresh[1].id, fresh[2].id, old.id]);
    assert!(synced[3].has_status_update);
    assert!(synced[..3].iter().all(|m| !m.has_status_update));

    let foreign_cursor = first.next_cursor.unwrap();
    assert!(h
        .gateway
        .continue_sync(&bob.caller, foreign, foreign_cursor)
        .await
        .unwrap()
        .is_none());

    let caught_up = h
        .gateway
        .incremental_sync(&bob.caller, result.server_time, None)
        .await;
    assert_eq!(caught_up.chats.len(), 1);
    assert!(caught_up.chats[0].messages.is_empty());
    assert!(!caught_up.chats[0].has_more);
}

#[tokio::test]
async fn test_gateway_as_transport() {
    let h = Harness::new();
    let a = h.user("ada").await;
    let transport: Arc<dyn Transport> = h.gateway.clone();
    assert!(!transport.is_connected(a).await);

    let mut ada = h.gateway.connect(a).await;
    assert!(transport.is_connected(a).await);
    let reached = transport
        .send_to_user(a, ClientEvent::HeartbeatAck { server_time: h.clock.now() })
        .await;
    assert_eq!(reached, 1);
    assert_eq!(drain(&mut ada.events).len(), 1);
}

/// Event log that rejects the next participant-attributed append
struct FlakyEventLog {
    inner: Arc<crate::store::MemoryStore>,
    fail_next: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl StatusEventRepository for FlakyEventLog {
    async fn append_event(&self, event: crate::model::MessageStatusEvent) -> DeliveryResult<()> {
        use std::sync::atomic::Ordering;
        if event.user_id.is_some() && self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(DeliveryError::Storage("event log unavailable".to_string()));
        }
        self.inner.append_event(event).await
    }

    async fn list_events(
        &self,
        message_id: MessageId,
    ) -> DeliveryResult<Vec<crate::model::MessageStatusEvent>> {
        self.inner.list_events(message_id).await
    }
}

#[tokio::test]
async fn test_failed_event_append_leaves_ack_retryable() {
    let h = Harness::new();
    let (a, b) = (h.user("ada").await, h.user("bob").await);
    let chat = h.private_chat(a, b).await;
    let message = h.send(chat, a, "hello").await;

    let mut repos = h.repos();
    repos.events = Arc::new(FlakyEventLog {
        inner: h.store.clone(),
        fail_next: std::sync::atomic::AtomicBool::new(true),
    });
    let gateway = Gateway::new(h.registry.clone(), repos, h.clock.clone(), h.config.gateway.clone());
    let bob = gateway.connect(b).await;

    gateway.acknowledge_delivered(&bob.caller, message.id, chat).await;
    assert!(h.store.get_receipt(message.id, b).await.unwrap().is_none());
    assert_eq!(
        gateway.tracker().aggregate(message.id).await.unwrap(),
        MessageStatus::Sent
    );

    gateway.acknowledge_delivered(&bob.caller, message.id, chat).await;
    assert_eq!(
        gateway.tracker().aggregate(message.id).await.unwrap(),
        MessageStatus::Delivered
    );

    h.advance(Duration::from_secs(3));
    let report = h.retry_scheduler().tick().await.unwrap();
    assert_eq!(report.deduped, 1);
    assert!(h
        .store
        .get_pending(message.id, b, AckKind::NewMessage)
        .await
        .unwrap()
        .is_none());
}

/// User store where a new session connects just as `set_offline` runs
struct ReconnectDuringOffline {
    inner: Arc<crate::store::MemoryStore>,
    registry: Arc<ConnectionRegistry>,
}

#[async_trait]
impl UserRepository for ReconnectDuringOffline {
    async fn get_presence(&self, user_id: UserId) -> DeliveryResult<Option<crate::model::Presence>> {
        self.inner.get_presence(user_id).await
    }

    async fn set_online(&self, user_id: UserId, at: DateTime<Utc>) -> DeliveryResult<()> {
        self.inner.set_online(user_id, at).await
    }

    async fn set_offline(&self, user_id: UserId, last_seen_at: DateTime<Utc>) -> DeliveryResult<()> {
        let (tx, _rx) = mpsc::unbounded_channel();
        self.registry.register(user_id, SessionId::generate(), tx);
        self.inner.set_online(user_id, last_seen_at).await?;
        self.inner.set_offline(user_id, last_seen_at).await
    }

    async fn record_heartbeat(&self, user_id: UserId, at: DateTime<Utc>) -> DeliveryResult<()> {
        self.inner.record_heartbeat(user_id, at).await
    }

    async fn list_online(&self) -> DeliveryResult<Vec<crate::model::Presence>> {
        self.inner.list_online().await
    }

    async fn mark_offline_if_stale(
        &self,
        user_id: UserId,
        cutoff: DateTime<Utc>,
        last_seen_at: DateTime<Utc>,
    ) -> DeliveryResult<bool> {
        self.inner.mark_offline_if_stale(user_id, cutoff, last_seen_at).await
    }

    async fn display_name(&self, user_id: UserId) -> DeliveryResult<Option<String>> {
        self.inner.display_name(user_id).await
    }
}

#[tokio::test]
async fn test_reconnect_racing_last_disconnect_stays_online() {
    let h = Harness::new();
    let (a, b) = (h.user("ada").await, h.user("bob").await);
    h.private_chat(a, b).await;

    let mut repos = h.repos();
    repos.users = Arc::new(ReconnectDuringOffline {
        inner: h.store.clone(),
        registry: h.registry.clone(),
    });
    let gateway = Gateway::new(h.registry.clone(), repos, h.clock.clone(), h.config.gateway.clone());
    let mut ada = gateway.connect(a).await;
    let bob = gateway.connect(b).await;
    drain(&mut ada.events);

    h.advance(Duration::from_secs(5));
    gateway.disconnect(&bob.caller).await;

    assert!(h.registry.is_online(b));
    assert!(h.store.get_presence(b).await.unwrap().unwrap().is_online);
    assert!(drain_named(&mut ada.events, "UserStatusChanged").is_empty());
}

#[tokio::test]
async fn test_synced_acks_are_tagged_with_sync_source() {
    let h = Harness::new();
    let (a, b) = (h.user("ada").await, h.user("bob").await);
    let chat = h.private_chat(a, b).await;
    let since = h.clock.now();
    h.advance(Duration::from_secs(1));
    let missed = h.send(chat, a, "while you were away").await;

    let bob = h.gateway.connect(b).await;
    let sync = h.gateway.incremental_sync(&bob.caller, since, None).await;
    let ids: Vec<MessageId> = sync.chats[0].messages.iter().map(|m| m.message.id).collect();
    assert_eq!(ids, vec![missed.id]);

    let changed = h
        .gateway
        .acknowledge_synced(&bob.caller, chat, &ids, MessageStatus::Delivered)
        .await
        .unwrap();
    assert_eq!(changed, vec![missed.id]);

    let events = h.store.list_events(missed.id).await.unwrap();
    let last = events.last().unwrap();
    assert_eq!(last.user_id, Some(b));
    assert_eq!(last.source, StatusSource::Sync);
}
