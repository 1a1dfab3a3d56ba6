//! Retry Scheduler — long-running background task that re-queues due
//! `RETRY_SCHEDULED` payouts and recovers executions lost to a crash.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::Result;
use crate::orchestrator::Orchestrator;
use crate::payout::PayoutStatus;
use crate::store::PayoutStore;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub batch_size: u32,
    /// A `PROCESSING` record untouched for this long is assumed orphaned.
    /// Must exceed the longest a live execution can take.
    pub stuck_after: chrono::Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            batch_size: 10,
            stuck_after: chrono::Duration::minutes(30),
        }
    }
}

/// Outcome of a single sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub recovered: usize,
    pub dispatched: usize,
    /// Picked up by a concurrent sweep first.
    pub skipped: usize,
    pub errors: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct RetryScheduler {
    store: Arc<dyn PayoutStore>,
    orchestrator: Arc<Orchestrator>,
    config: SchedulerConfig,
}

impl RetryScheduler {
    pub fn new(
        store: Arc<dyn PayoutStore>,
        orchestrator: Arc<Orchestrator>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            orchestrator,
            config,
        }
    }

    /// Run [`Self::sweep`] every `interval` until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            "Retry scheduler starting — every {}s, batch of {}",
            self.config.interval.as_secs(),
            self.config.batch_size
        );

        loop {
            match self.sweep().await {
                Ok(report) if report.is_empty() => debug!("Retry sweep found nothing to do"),
                Ok(report) => info!(
                    recovered = report.recovered,
                    dispatched = report.dispatched,
                    skipped = report.skipped,
                    errors = report.errors,
                    "Retry sweep finished"
                ),
                Err(e) => error!("Retry sweep error: {e}"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }

        info!("Retry scheduler stopped");
    }

    /// One pass: recover orphaned executions, then re-queue due retries.
    ///
    /// Per-record failures are logged and counted, never propagated; only a
    /// failing batch query aborts the sweep.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let now = Utc::now();
        let mut report = SweepReport {
            recovered: self.recover_stuck(now).await?,
            ..Default::default()
        };

        let due = self
            .store
            .find_due(PayoutStatus::RetryScheduled, now, self.config.batch_size)
            .await?;

        for mut payout in due {
            let id = payout.id;
            if let Err(e) = payout.requeue(now) {
                warn!(payout_id = %id, error = %e, "Cannot re-queue payout");
                report.errors += 1;
                continue;
            }

            // Flip to PROCESSING before dispatch so a concurrent sweep loses the swap.
            match self.store.save_if(&payout, PayoutStatus::RetryScheduled).await {
                Ok(true) => {
                    info!(payout_id = %id, retry_count = payout.retry_count, "Re-queued payout for retry");
                    self.orchestrator.dispatch(id);
                    report.dispatched += 1;
                }
                Ok(false) => {
                    debug!(payout_id = %id, "Payout already picked up elsewhere");
                    report.skipped += 1;
                }
                Err(e) => {
                    error!(payout_id = %id, error = %e, "Failed to re-queue payout");
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }

    async fn recover_stuck(&self, now: DateTime<Utc>) -> Result<usize> {
        let before = now - self.config.stuck_after;
        let stuck = self
            .store
            .find_stale(PayoutStatus::Processing, before, self.config.batch_size)
            .await?;

        let mut recovered = 0;
        for payout in stuck {
            warn!(
                payout_id = %payout.id,
                updated_at = %payout.updated_at,
                "Recovering payout stuck in PROCESSING"
            );
            match self.orchestrator.recover(payout.id).await {
                Ok(Some(status)) => {
                    info!(payout_id = %payout.id, status = %status, "Recovered stuck payout");
                    recovered += 1;
                }
                Ok(None) => {}
                Err(e) => error!(payout_id = %payout.id, error = %e, "Failed to recover payout"),
            }
        }
        Ok(recovered)
    }
}
