//! Background jobs
//!
//! - [`DlqSweeper`] - periodic DLQ reprocessing
//! - [`DelayedActionPoller`] - runs due delayed actions
//! - [`BackgroundJobs`] - owns both loops and their shutdown signal
//!
//! # Example
//!
//! ```ignore
//! use triggerflow_durable::worker::{BackgroundJobs, DelayedActionPoller, DlqSweeper};
//!
//! let jobs = BackgroundJobs::start(
//!     DlqSweeper::new(processor, DlqSweeperConfig::default()),
//!     DelayedActionPoller::new(scheduler),
//! );
//!
//! tokio::signal::ctrl_c().await?;
//! jobs.shutdown(Duration::from_secs(30)).await;
//! ```

mod poller;
mod sweeper;

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use poller::DelayedActionPoller;
pub use sweeper::{DlqSweeper, DlqSweeperConfig};

/// Running sweeper and poller loops
pub struct BackgroundJobs {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundJobs {
    pub fn start(sweeper: DlqSweeper, poller: DelayedActionPoller) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            sweep_interval_ms = sweeper.config().interval.as_millis() as u64,
            poll_interval_ms = poller.interval().as_millis() as u64,
            "Starting background jobs"
        );

        let handles = vec![
            sweeper.spawn(shutdown_rx.clone()),
            poller.spawn(shutdown_rx),
        ];

        Self {
            shutdown_tx,
            handles,
        }
    }

    /// Signal both loops and wait up to `timeout` for them to exit
    ///
    /// A sweep or poll in progress finishes before its loop exits.
    pub async fn shutdown(self, timeout: Duration) {
        let _ = self.shutdown_tx.send(true);

        let join_all = async {
            for handle in self.handles {
                if let Err(e) = handle.await {
                    warn!("Background job ended abnormally: {}", e);
                }
            }
        };

        if tokio::time::timeout(timeout, join_all).await.is_err() {
            warn!(timeout_ms = timeout.as_millis() as u64, "Background job shutdown timed out");
        } else {
            info!("Background jobs stopped");
        }
    }
}
