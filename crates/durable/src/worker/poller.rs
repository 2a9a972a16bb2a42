//! Due-job polling for delayed actions

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace};

use crate::engine::DelayedActionScheduler;

/// Runs due [`ScheduledAction`](crate::persistence::ScheduledAction)s the
/// in-process timers did not cover
///
/// Picks up jobs whose delay exceeded the timer horizon and jobs left behind
/// by a restart.
pub struct DelayedActionPoller {
    scheduler: DelayedActionScheduler,
    interval: Duration,
}

impl DelayedActionPoller {
    /// Poll at the scheduler's configured interval
    pub fn new(scheduler: DelayedActionScheduler) -> Self {
        let interval = scheduler.config().poll_interval;
        Self {
            scheduler,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run every job due now; returns how many ran
    ///
    /// Stale claims are reclaimed first so they run in the same poll.
    pub async fn poll(&self) -> usize {
        if let Err(e) = self.scheduler.reclaim_stale().await {
            error!("Delayed action reclaim failed: {}", e);
        }

        match self.scheduler.run_due(Utc::now()).await {
            Ok(0) => {
                trace!("no due delayed actions");
                0
            }
            Ok(count) => {
                info!(count, "ran due delayed actions");
                count
            }
            Err(e) => {
                error!("Delayed action poll failed: {}", e);
                0
            }
        }
    }

    /// Poll until `shutdown_rx` flips
    pub fn spawn(self, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.poll().await;
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Delayed action poller: shutdown requested");
                        break;
                    }
                }
            }

            debug!("Delayed action poller exited");
        })
    }
}
