//! Periodic removal of expired messages and addresses.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

use crate::store::MailStore;

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Another sweep held the guard; nothing was attempted.
    pub skipped: bool,
    pub messages_deleted: u64,
    pub addresses_deleted: u64,
    /// One entry per table whose delete failed.
    pub errors: Vec<String>,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Deletes rows whose expiry has passed. At most one sweep runs at a time.
#[derive(Clone)]
pub struct Sweeper {
    store: Arc<dyn MailStore>,
    interval: Duration,
    running: Arc<Mutex<()>>,
}

impl Sweeper {
    pub fn new(store: Arc<dyn MailStore>, interval: Duration) -> Self {
        Self {
            store,
            interval,
            running: Arc::new(Mutex::new(())),
        }
    }

    /// Run one sweep against `now`.
    ///
    /// Returns a skipped report instead of waiting when a sweep is already in
    /// progress. A failure on one table does not stop the other.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> SweepReport {
        let Ok(_guard) = self.running.try_lock() else {
            debug!("sweep already in progress, skipping");
            return SweepReport {
                skipped: true,
                ..SweepReport::default()
            };
        };

        let mut report = SweepReport::default();

        match self.store.delete_expired_messages(now).await {
            Ok(n) => report.messages_deleted = n,
            Err(e) => {
                error!(error = %e, "failed to delete expired messages");
                report.errors.push(format!("messages: {e}"));
            }
        }

        match self.store.delete_expired_addresses(now).await {
            Ok(n) => report.addresses_deleted = n,
            Err(e) => {
                error!(error = %e, "failed to delete expired addresses");
                report.errors.push(format!("addresses: {e}"));
            }
        }

        if report.messages_deleted > 0 || report.addresses_deleted > 0 {
            info!(
                messages = report.messages_deleted,
                addresses = report.addresses_deleted,
                "removed expired rows"
            );
        }

        report
    }

    /// Spawn the periodic task. The first sweep runs one interval after start.
    pub fn start(&self) -> SweeperHandle {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let sweeper = self.clone();
        let period = self.interval.max(Duration::from_millis(1));

        let task = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                ticker.tick().await;

                info!(interval_secs = period.as_secs(), "sweeper started");
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            sweeper.sweep_once(Utc::now()).await;
                        }
                    }
                }
                info!("sweeper stopped");
            }
            .instrument(info_span!("sweeper")),
        );

        SweeperHandle { shutdown, task }
    }
}

/// Running sweeper task.
pub struct SweeperHandle {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the timer and wait for an in-flight sweep to finish.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            error!(error = %e, "sweeper task panicked");
        }
    }
}
