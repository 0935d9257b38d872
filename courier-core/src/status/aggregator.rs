/*
    aggregator.rs - Canonical status of a message from its event log

    Pure function over a snapshot of events; no storage access. Rules:
    - no events                -> Sending
    - private chat             -> status of the latest event
    - group chat               -> per non-sender participant take their latest
                                  event (default Sent), result is the minimum
    Failed events never take part in the latest/minimum computation; a log
    made only of Failed events yields Failed.
*/

use crate::model::{ChatKind, MessageStatus, MessageStatusEvent, UserId};

/// Compute the aggregate status of a message
///
/// `events` must be in append order; timestamp ties resolve to the later
/// appended event.
pub fn aggregate_status(
    events: &[MessageStatusEvent],
    kind: ChatKind,
    sender: UserId,
    participants: &[UserId],
) -> MessageStatus {
    if events.is_empty() {
        return MessageStatus::Sending;
    }

    let progress: Vec<&MessageStatusEvent> = events
        .iter()
        .filter(|e| e.status != MessageStatus::Failed)
        .collect();
    if progress.is_empty() {
        return MessageStatus::Failed;
    }

    let recipients: Vec<UserId> = participants
        .iter()
        .copied()
        .filter(|p| *p != sender)
        .collect();

    match kind {
        ChatKind::Group if !recipients.is_empty() => recipients
            .iter()
            .map(|participant| {
                latest(progress.iter().copied().filter(|e| e.user_id == Some(*participant)))
                    .unwrap_or(MessageStatus::Sent)
            })
            .min_by_key(|status| status.rank())
            .unwrap_or(MessageStatus::Sent),
        _ => latest(progress.into_iter()).unwrap_or(MessageStatus::Sending),
    }
}

fn latest<'a>(events: impl Iterator<Item = &'a MessageStatusEvent>) -> Option<MessageStatus> {
    // max_by_key keeps the last of equal keys, so ties go to the later append.
    events.max_by_key(|e| e.created_at).map(|e| e.status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventId, MessageId, StatusSource};
    use chrono::{DateTime, Duration, Utc};
    use proptest::prelude::*;

    struct Log {
        message_id: MessageId,
        start: DateTime<Utc>,
        events: Vec<MessageStatusEvent>,
    }

    impl Log {
        fn new() -> Self {
            Self {
                message_id: MessageId::generate(),
                start: Utc::now(),
                events: Vec::new(),
            }
        }

        fn push(&mut self, user: Option<UserId>, status: MessageStatus, at_secs: i64) {
            self.events.push(MessageStatusEvent {
                id: EventId::generate(),
                message_id: self.message_id,
                user_id: user,
                status,
                source: StatusSource::Gateway,
                created_at: self.start + Duration::seconds(at_secs),
            });
        }
    }

    #[test]
    fn test_no_events_is_sending() {
        let sender = UserId::generate();
        let status = aggregate_status(&[], ChatKind::Group, sender, &[sender, UserId::generate()]);
        assert_eq!(status, MessageStatus::Sending);
    }

    #[test]
    fn test_private_chat_uses_latest_event() {
        let (a, b) = (UserId::generate(), UserId::generate());
        let mut log = Log::new();
        log.push(None, MessageStatus::Sent, 0);
        log.push(Some(b), MessageStatus::Read, 5);
        log.push(Some(b), MessageStatus::Delivered, 2);

        assert_eq!(
            aggregate_status(&log.events, ChatKind::Private, a, &[a, b]),
            MessageStatus::Read
        );
    }

    #[test]
    fn test_timestamp_tie_goes_to_later_append() {
        let (a, b) = (UserId::generate(), UserId::generate());
        let mut log = Log::new();
        log.push(Some(b), MessageStatus::Delivered, 1);
        log.push(Some(b), MessageStatus::Read, 1);

        assert_eq!(
            aggregate_status(&log.events, ChatKind::Private, a, &[a, b]),
            MessageStatus::Read
        );
    }

    #[test]
    fn test_group_takes_slowest_participant() {
        let (a, b, c) = (UserId::generate(), UserId::generate(), UserId::generate());
        let mut log = Log::new();
        log.push(None, MessageStatus::Sent, 0);
        log.push(Some(b), MessageStatus::Delivered, 1);
        log.push(Some(c), MessageStatus::Read, 2);

        assert_eq!(
            aggregate_status(&log.events, ChatKind::Group, a, &[a, b, c]),
            MessageStatus::Delivered
        );

        log.push(Some(b), MessageStatus::Read, 3);
        assert_eq!(
            aggregate_status(&log.events, ChatKind::Group, a, &[a, b, c]),
            MessageStatus::Read
        );
    }

    #[test]
    fn test_group_participant_without_events_counts_as_sent() {
        let (a, b, c) = (UserId::generate(), UserId::generate(), UserId::generate());
        let mut log = Log::new();
        log.push(Some(b), MessageStatus::Played, 1);

        assert_eq!(
            aggregate_status(&log.events, ChatKind::Group, a, &[a, b, c]),
            MessageStatus::Sent
        );
    }

    #[test]
    fn test_sender_events_do_not_count_in_group() {
        let (a, b) = (UserId::generate(), UserId::generate());
        let mut log = Log::new();
        log.push(Some(a), MessageStatus::Read, 1);
        log.push(Some(b), MessageStatus::Delivered, 2);

        assert_eq!(
            aggregate_status(&log.events, ChatKind::Group, a, &[a, b]),
            MessageStatus::Delivered
        );
    }

    #[test]
    fn test_failed_is_excluded_from_minimum() {
        let (a, b, c) = (UserId::generate(), UserId::generate(), UserId::generate());
        let mut log = Log::new();
        log.push(Some(b), MessageStatus::Read, 1);
        log.push(Some(c), MessageStatus::Read, 1);
        log.push(Some(c), MessageStatus::Failed, 2);

        assert_eq!(
            aggregate_status(&log.events, ChatKind::Group, a, &[a, b, c]),
            MessageStatus::Read
        );
    }

    #[test]
    fn test_only_failed_events_yield_failed() {
        let (a, b) = (UserId::generate(), UserId::generate());
        let mut log = Log::new();
        log.push(None, MessageStatus::Failed, 0);

        assert_eq!(
            aggregate_status(&log.events, ChatKind::Private, a, &[a, b]),
            MessageStatus::Failed
        );
    }

    fn ack_status() -> impl Strategy<Value = MessageStatus> {
        prop_oneof![
            Just(MessageStatus::Delivered),
            Just(MessageStatus::Read),
            Just(MessageStatus::Played),
        ]
    }

    proptest! {
        #[test]
        fn prop_group_is_min_of_latest(acks in proptest::collection::vec((0usize..4, ack_status()), 0..24)) {
            let sender = UserId::generate();
            let members: Vec<UserId> = (0..4).map(|_| UserId::generate()).collect();
            let mut participants = vec![sender];
            participants.extend(members.iter().copied());

            let mut log = Log::new();
            log.push(None, MessageStatus::Sent, 0);
            let mut latest_by_member = vec![MessageStatus::Sent; members.len()];
            for (i, (member, status)) in acks.iter().enumerate() {
                log.push(Some(members[*member]), *status, i as i64 + 1);
                latest_by_member[*member] = *status;
            }

            let expected = latest_by_member
                .into_iter()
                .min_by_key(|s| s.rank())
                .unwrap();
            prop_assert_eq!(
                aggregate_status(&log.events, ChatKind::Group, sender, &participants),
                expected
            );
        }

        #[test]
        fn prop_private_never_regresses_under_monotone_acks(stages in proptest::collection::vec(ack_status(), 1..12)) {
            let (a, b) = (UserId::generate(), UserId::generate());
            let mut log = Log::new();
            log.push(None, MessageStatus::Sent, 0);

            // Acks that would not advance the recipient are dropped before
            // they reach the log, so only forward steps are appended.
            let mut reached = MessageStatus::Sent;
            let mut observed = aggregate_status(&log.events, ChatKind::Private, a, &[a, b]);
            for (i, stage) in stages.into_iter().enumerate() {
                if reached.advances_to(stage) {
                    reached = stage;
                    log.push(Some(b), stage, i as i64 + 1);
                }
                let next = aggregate_status(&log.events, ChatKind::Private, a, &[a, b]);
                prop_assert!(next.rank() >= observed.rank());
                observed = next;
            }
        }
    }
}
