use super::backoff::next_attempt_at;
use crate::clock::{span, Clock};
use crate::config::RetryConfig;
use crate::error::{bounded, DeliveryError, DeliveryResult};
use crate::events::ClientEvent;
use crate::gateway::Transport;
use crate::metrics;
use crate::model::{AckKind, Message, PendingAck};
use crate::push::{PushGateway, PushNotification};
use crate::shutdown::ShutdownListener;
use crate::status::StatusTracker;
use crate::store::{DueQuery, Repositories};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// What one tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Acks loaded from the store
    pub due: usize,
    /// Still inside their backoff window
    pub waiting: usize,
    /// Redelivered over a live session
    pub resent: usize,
    /// Acks that triggered a push attempt
    pub pushed: usize,
    /// Dropped because delivery was already recorded
    pub deduped: usize,
    pub gave_up: usize,
    /// Dropped because the message no longer exists
    pub dropped: usize,
    pub failed: usize,
}

enum Outcome {
    Waiting,
    Deduped,
    Dropped,
    Retried { resent: bool, pushed: bool },
    GaveUp { pushed: bool },
}

/// Background redelivery of unconfirmed messages and status updates
pub struct RetryScheduler {
    repos: Repositories,
    transport: Arc<dyn Transport>,
    push: Option<Arc<dyn PushGateway>>,
    tracker: StatusTracker,
    clock: Arc<dyn Clock>,
    config: RetryConfig,
}

impl RetryScheduler {
    pub fn new(
        repos: Repositories,
        transport: Arc<dyn Transport>,
        push: Option<Arc<dyn PushGateway>>,
        clock: Arc<dyn Clock>,
        config: RetryConfig,
    ) -> Self {
        let tracker = StatusTracker::new(repos.clone(), clock.clone(), config.io_timeout);
        Self {
            repos,
            transport,
            push,
            tracker,
            clock,
            config,
        }
    }

    /// Run one pass over the due acks
    pub async fn tick(&self) -> DeliveryResult<TickReport> {
        self.run_tick(None).await
    }

    /// Delete acks older than the retention window
    pub async fn purge_expired(&self) -> DeliveryResult<usize> {
        let cutoff = self.clock.now() - span(self.config.retention);
        let purged = bounded(
            self.config.io_timeout,
            "purge pending acks",
            self.repos.pending_acks.purge_older_than(cutoff),
        )
        .await?;
        if purged > 0 {
            metrics::record_counter(metrics::RETRY_PURGED, purged as u64);
            info!(purged, %cutoff, "Purged expired pending acks");
        }
        Ok(purged)
    }

    /// Tick every `poll_interval` and purge every `purge_interval` until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: ShutdownListener) {
        let stop = shutdown.clone();
        let mut retry_timer = tokio::time::interval(self.config.poll_interval);
        retry_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut purge_timer = tokio::time::interval(self.config.purge_interval);
        purge_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            poll_interval = ?self.config.poll_interval,
            max_retries = self.config.max_retries,
            push = self.push.is_some(),
            "Retry scheduler started"
        );
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = retry_timer.tick() => {
                    match self.run_tick(Some(&stop)).await {
                        Ok(report) if report.due > 0 => debug!(?report, "Retry tick complete"),
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Retry tick failed"),
                    }
                }
                _ = purge_timer.tick() => {
                    if let Err(e) = self.purge_expired().await {
                        error!(error = %e, "Pending ack purge failed");
                    }
                }
            }
        }
        info!("Retry scheduler stopped");
    }

    async fn run_tick(&self, shutdown: Option<&ShutdownListener>) -> DeliveryResult<TickReport> {
        let now = self.clock.now();
        let due = bounded(
            self.config.io_timeout,
            "list due acks",
            self.repos.pending_acks.list_due(DueQuery {
                created_before: now - span(self.config.poll_interval),
                base_interval: self.config.base_interval,
                max_retries: self.config.max_retries,
                limit: self.config.batch_size,
            }),
        )
        .await?;
        metrics::record_gauge(metrics::PENDING_ACKS_DUE, due.len() as f64);

        let mut report = TickReport {
            due: due.len(),
            ..Default::default()
        };
        for ack in due {
            if shutdown.map_or(false, ShutdownListener::is_shutdown) {
                debug!("Shutdown requested, leaving remaining acks for later");
                break;
            }

            let (message_id, recipient, kind) = ack.key();
            match self.process(ack, now).await {
                Ok(Outcome::Waiting) => report.waiting += 1,
                Ok(Outcome::Deduped) => report.deduped += 1,
                Ok(Outcome::Dropped) => report.dropped += 1,
                Ok(Outcome::Retried { resent, pushed }) => {
                    report.resent += usize::from(resent);
                    report.pushed += usize::from(pushed);
                }
                Ok(Outcome::GaveUp { pushed }) => {
                    report.gave_up += 1;
                    report.pushed += usize::from(pushed);
                }
                Err(e) => {
                    report.failed += 1;
                    error!(%message_id, %recipient, ?kind, error = %e, "Failed to process pending ack");
                }
            }
        }
        Ok(report)
    }

    async fn process(&self, mut ack: PendingAck, now: DateTime<Utc>) -> DeliveryResult<Outcome> {
        let Some(message) = bounded(
            self.config.io_timeout,
            "load message",
            self.repos.messages.get_message(ack.message_id),
        )
        .await?
        else {
            self.delete(&ack).await?;
            debug!(message_id = %ack.message_id, "Pending ack for unknown message dropped");
            return Ok(Outcome::Dropped);
        };

        if ack.kind == AckKind::NewMessage && self.already_delivered(&ack).await? {
            self.delete(&ack).await?;
            metrics::record_counter(metrics::RETRY_DEDUPED, 1);
            debug!(
                message_id = %ack.message_id,
                recipient = %ack.recipient_id,
                "Delivery already recorded, pending ack removed"
            );
            return Ok(Outcome::Deduped);
        }

        if now < next_attempt_at(&ack, self.config.base_interval) {
            return Ok(Outcome::Waiting);
        }

        let pushed = if self.push_due(&ack, now) {
            self.push_fallback(&mut ack, &message, now).await
        } else {
            false
        };

        ack.retry_count += 1;
        ack.last_retry_at = Some(now);
        metrics::record_counter(metrics::RETRY_ATTEMPTS, 1);

        if ack.retry_count >= self.config.max_retries {
            self.delete(&ack).await?;
            metrics::record_counter(metrics::RETRY_GAVE_UP, 1);
            info!(
                message_id = %ack.message_id,
                recipient = %ack.recipient_id,
                kind = ?ack.kind,
                retries = ack.retry_count,
                "Giving up on pending ack"
            );
            return Ok(Outcome::GaveUp { pushed });
        }

        match bounded(
            self.config.io_timeout,
            "update pending ack",
            self.repos.pending_acks.update_pending(ack.clone()),
        )
        .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(message_id = %ack.message_id, "Pending ack confirmed mid-tick");
                return Ok(Outcome::Dropped);
            }
            Err(e) => return Err(e),
        }
        let resent = self.resend(&ack, message).await?;
        debug!(
            message_id = %ack.message_id,
            recipient = %ack.recipient_id,
            retry = ack.retry_count,
            resent,
            pushed,
            "Pending ack retried"
        );
        Ok(Outcome::Retried { resent, pushed })
    }

    async fn already_delivered(&self, ack: &PendingAck) -> DeliveryResult<bool> {
        let receipt = bounded(
            self.config.io_timeout,
            "load receipt",
            self.repos
                .receipts
                .get_receipt(ack.message_id, ack.recipient_id),
        )
        .await?;
        Ok(receipt.map_or(false, |r| r.is_delivered()))
    }

    /// Only new messages ever go out as push notifications
    fn push_due(&self, ack: &PendingAck, now: DateTime<Utc>) -> bool {
        if self.push.is_none() || ack.kind != AckKind::NewMessage {
            return false;
        }
        if now - ack.created_at < span(self.config.push_fallback_after) {
            return false;
        }
        ack.last_push_at
            .map_or(true, |pushed| now - pushed >= span(self.config.push_min_interval))
    }

    /// Push to every active device of the recipient; returns whether anything was sent
    async fn push_fallback(&self, ack: &mut PendingAck, message: &Message, now: DateTime<Utc>) -> bool {
        let Some(push) = &self.push else {
            return false;
        };
        let recipient = ack.recipient_id;

        let tokens: Vec<String> = match bounded(
            self.config.io_timeout,
            "list device tokens",
            self.repos.devices.list_active_tokens(recipient),
        )
        .await
        {
            Ok(tokens) => tokens.into_iter().map(|t| t.token).collect(),
            Err(e) => {
                error!(%recipient, error = %e, "Failed to load device tokens");
                return false;
            }
        };
        if tokens.is_empty() {
            debug!(%recipient, "No active device tokens, push skipped");
            return false;
        }

        let sender_name = match bounded(
            self.config.io_timeout,
            "load display name",
            self.repos.users.display_name(message.sender_id),
        )
        .await
        {
            Ok(name) => name,
            Err(e) => {
                warn!(sender = %message.sender_id, error = %e, "Failed to load sender name");
                None
            }
        };
        let notification = PushNotification::new_message(message, sender_name.as_deref());

        ack.last_push_at = Some(now);
        let outcomes = match bounded(self.config.io_timeout, "push send", async {
            Ok::<_, DeliveryError>(push.send_batch(&tokens, &notification).await)
        })
        .await
        {
            Ok(outcomes) => outcomes,
            Err(e) => {
                metrics::record_counter(metrics::PUSH_FAILED, tokens.len() as u64);
                error!(%recipient, error = %e, "Push batch failed");
                return true;
            }
        };

        for (token, outcome) in outcomes {
            if outcome.delivered {
                metrics::record_counter(metrics::PUSH_SENT, 1);
                continue;
            }
            metrics::record_counter(metrics::PUSH_FAILED, 1);
            if !outcome.token_invalid {
                warn!(%recipient, "Transient push failure");
                continue;
            }
            match bounded(
                self.config.io_timeout,
                "deactivate token",
                self.repos.devices.deactivate_token(&token),
            )
            .await
            {
                Ok(()) => {
                    metrics::record_counter(metrics::PUSH_TOKENS_DEACTIVATED, 1);
                    info!(%recipient, "Device token rejected by provider, deactivated");
                }
                Err(e) => error!(%recipient, error = %e, "Failed to deactivate device token"),
            }
        }
        info!(message_id = %message.id, %recipient, "Push fallback sent");
        true
    }

    /// Redeliver over the live transport; no-op when the recipient is offline
    async fn resend(&self, ack: &PendingAck, message: Message) -> DeliveryResult<bool> {
        if !self.transport.is_connected(ack.recipient_id).await {
            return Ok(false);
        }
        let event = match ack.kind {
            AckKind::NewMessage => ClientEvent::MessageReceived(message),
            AckKind::StatusUpdate => ClientEvent::StatusUpdated {
                message_id: message.id,
                status: self.tracker.aggregate_for(&message).await?,
            },
        };
        Ok(self.transport.send_to_user(ack.recipient_id, event).await > 0)
    }

    async fn delete(&self, ack: &PendingAck) -> DeliveryResult<()> {
        bounded(
            self.config.io_timeout,
            "delete pending ack",
            self.repos
                .pending_acks
                .delete_pending(ack.message_id, ack.recipient_id, ack.kind),
        )
        .await?;
        Ok(())
    }
}
