//! Periodic DLQ sweep

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::dlq::{BatchOptions, DlqProcessor, DEFAULT_MAX_RETRY_ATTEMPTS};
use crate::reliability::duration_millis;

/// Sweep configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DlqSweeperConfig {
    #[serde(with = "duration_millis")]
    pub interval: Duration,

    /// Items per sweep
    pub batch_size: u32,

    /// Leave fresh failures alone for this long
    pub older_than_minutes: Option<u32>,

    pub max_retry_attempts: u32,

    /// Items left `Processing` longer than this are reclaimed before each sweep
    #[serde(with = "duration_millis")]
    pub stale_claim_threshold: Duration,
}

impl Default for DlqSweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            batch_size: 10,
            older_than_minutes: None,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            stale_claim_threshold: Duration::from_secs(900),
        }
    }
}

impl DlqSweeperConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batch_size(mut self, size: u32) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_older_than_minutes(mut self, minutes: Option<u32>) -> Self {
        self.older_than_minutes = minutes;
        self
    }

    pub fn with_max_retry_attempts(mut self, max: u32) -> Self {
        self.max_retry_attempts = max.max(1);
        self
    }

    pub fn with_stale_claim_threshold(mut self, threshold: Duration) -> Self {
        self.stale_claim_threshold = threshold;
        self
    }

    fn batch_options(&self) -> BatchOptions {
        BatchOptions {
            older_than_minutes: self.older_than_minutes,
            specific_ids: None,
            max_retry_attempts: self.max_retry_attempts,
        }
    }
}

/// Runs [`DlqProcessor::process_batch`] on a fixed interval
pub struct DlqSweeper {
    processor: Arc<DlqProcessor>,
    config: DlqSweeperConfig,
}

impl DlqSweeper {
    pub fn new(processor: Arc<DlqProcessor>, config: DlqSweeperConfig) -> Self {
        Self { processor, config }
    }

    pub fn config(&self) -> &DlqSweeperConfig {
        &self.config
    }

    /// One sweep; returns the number of items processed
    ///
    /// Stale claims are reclaimed first so they are eligible for this batch.
    pub async fn sweep(&self) -> u32 {
        if let Err(e) = self
            .processor
            .reclaim_stale(self.config.stale_claim_threshold)
            .await
        {
            error!("DLQ reclaim failed: {}", e);
        }

        match self
            .processor
            .process_batch(self.config.batch_size, self.config.batch_options())
            .await
        {
            Ok(report) => {
                if report.processed > 0 {
                    info!(
                        processed = report.processed,
                        succeeded = report.succeeded(),
                        "DLQ sweep reprocessed items"
                    );
                }
                report.processed
            }
            Err(e) => {
                error!("DLQ sweep failed: {}", e);
                0
            }
        }
    }

    /// Sweep until `shutdown_rx` flips
    pub fn spawn(self, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("DLQ sweeper: shutdown requested");
                        break;
                    }
                }
            }

            debug!("DLQ sweeper exited");
        })
    }
}
