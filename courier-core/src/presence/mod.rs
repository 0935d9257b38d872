//! Presence monitor
//!
//! Flips users offline once their last sign of life is older than the
//! configured timeout and tells the chats they share with others.

use crate::clock::{span, Clock};
use crate::config::PresenceConfig;
use crate::error::{bounded, DeliveryResult};
use crate::gateway::Gateway;
use crate::metrics;
use crate::shutdown::ShutdownListener;
use crate::store::Repositories;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// What one sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Users flagged online in the snapshot
    pub checked: usize,
    pub timed_out: usize,
    pub failed: usize,
}

pub struct PresenceMonitor {
    repos: Repositories,
    gateway: Arc<Gateway>,
    clock: Arc<dyn Clock>,
    config: PresenceConfig,
}

impl PresenceMonitor {
    pub fn new(
        repos: Repositories,
        gateway: Arc<Gateway>,
        clock: Arc<dyn Clock>,
        config: PresenceConfig,
    ) -> Self {
        Self {
            repos,
            gateway,
            clock,
            config,
        }
    }

    /// Flip every stale online user offline
    ///
    /// Works on a snapshot; the flip itself is conditional, so a heartbeat
    /// landing between snapshot and flip keeps the user online.
    pub async fn sweep(&self) -> DeliveryResult<SweepReport> {
        let now = self.clock.now();
        let cutoff = now - span(self.config.timeout);
        let online = bounded(
            self.config.io_timeout,
            "list online users",
            self.repos.users.list_online(),
        )
        .await?;

        let mut report = SweepReport {
            checked: online.len(),
            ..Default::default()
        };
        for presence in online {
            let user = presence.user_id;
            let last_seen = presence.last_alive_at().unwrap_or(now);
            if presence.last_alive_at().map_or(false, |alive| alive > cutoff) {
                continue;
            }

            match bounded(
                self.config.io_timeout,
                "mark offline",
                self.repos.users.mark_offline_if_stale(user, cutoff, last_seen),
            )
            .await
            {
                Ok(true) => {
                    report.timed_out += 1;
                    metrics::record_counter(metrics::PRESENCE_TIMEOUTS, 1);
                    info!(%user, %last_seen, "Presence timed out");
                    self.gateway
                        .broadcast_presence(user, false, Some(last_seen))
                        .await;
                }
                Ok(false) => debug!(%user, "Fresh heartbeat since snapshot, kept online"),
                Err(e) => {
                    report.failed += 1;
                    error!(%user, error = %e, "Failed to flip user offline");
                }
            }
        }
        Ok(report)
    }

    /// Sweep every `sweep_interval` until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: ShutdownListener) {
        let mut timer = tokio::time::interval(self.config.sweep_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            sweep_interval = ?self.config.sweep_interval,
            timeout = ?self.config.timeout,
            "Presence monitor started"
        );
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = timer.tick() => match self.sweep().await {
                    Ok(report) if report.timed_out > 0 => debug!(?report, "Presence sweep complete"),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Presence sweep failed"),
                },
            }
        }
        info!("Presence monitor stopped");
    }
}
