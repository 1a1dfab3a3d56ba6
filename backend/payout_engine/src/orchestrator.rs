//! Drives one claimed payout through the executor and books the outcome.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::errors::{PayoutError, Result};
use crate::events::{EventBus, PayoutEvent};
use crate::executor::{TransferExecutor, TransferReceipt, TransferRequest};
use crate::ledger::TxStatus;
use crate::payout::{Payout, PayoutId, PayoutStatus, RetryPolicy};
use crate::store::PayoutStore;

/// Store writes made after a transfer reached the network are retried this
/// many times before giving up.
pub const WRITE_ATTEMPTS: u32 = 3;
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(50);

pub struct Orchestrator {
    store: Arc<dyn PayoutStore>,
    executor: Arc<dyn TransferExecutor>,
    events: EventBus,
    retry_policy: RetryPolicy,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn PayoutStore>,
        executor: Arc<dyn TransferExecutor>,
        events: EventBus,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            executor,
            events,
            retry_policy,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Run [`Self::execute`] in its own task without awaiting it.
    ///
    /// A supervisor task watches the execution; if it panics or is
    /// cancelled, the attempt is booked as failed so the record cannot stay
    /// in `PROCESSING` forever. The returned handle resolves once the
    /// supervisor is done.
    pub fn dispatch(self: &Arc<Self>, id: PayoutId) -> JoinHandle<()> {
        let worker = Arc::clone(self);
        let execution = tokio::spawn(async move { worker.execute(id).await });

        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let reason = match execution.await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => {
                    error!(payout_id = %id, error = %e, "Payout execution aborted");
                    return;
                }
                Err(e) if e.is_panic() => "execution task panicked",
                Err(_) => "execution task cancelled",
            };

            error!(payout_id = %id, reason, "Payout execution crashed");
            if let Err(e) = supervisor.record_failure(id, reason).await {
                error!(payout_id = %id, error = %e, "Could not book crashed execution");
            }
        })
    }

    /// Drive exactly one attempt end-to-end.
    ///
    /// Executor errors never escape: they become retry bookkeeping. Only
    /// store errors and a missing record are returned.
    pub async fn execute(&self, id: PayoutId) -> Result<()> {
        let Some(payout) = self.store.get(id).await? else {
            warn!(payout_id = %id, "Payout to execute not found");
            return Err(PayoutError::NotFound(id.to_string()));
        };

        // Sole concurrency guard: another path already advanced this record.
        if payout.status != PayoutStatus::Processing {
            debug!(payout_id = %id, status = %payout.status, "Skipping stale execution");
            return Ok(());
        }

        let request = TransferRequest {
            destination: payout.recipient_address.clone(),
            amount: payout.amount,
            asset: payout.asset.clone(),
            memo: id.to_string(),
        };

        info!(
            payout_id = %id,
            attempt = payout.retry_count + 1,
            recipient = %payout.recipient_address,
            amount = %payout.amount,
            asset = %payout.asset,
            "Executing payout"
        );

        let hash = match self.executor.submit(&request).await {
            Ok(hash) => hash,
            Err(e) => return self.fail_attempt(payout, e).await,
        };
        let payout = self.record_submission(payout, hash.clone()).await;

        match self.executor.await_confirmation(&hash).await {
            Ok(receipt) => self.complete(payout, receipt).await.map(|_| ()),
            Err(e) => self.fail_attempt(payout, e).await,
        }
    }

    /// Settle a `PROCESSING` record whose execution was lost.
    ///
    /// A record with a submitted hash is checked against the ledger first: a
    /// transfer that already landed is completed, never re-sent. Lookup
    /// errors are returned without booking anything, so the next sweep tries
    /// again.
    pub async fn recover(&self, id: PayoutId) -> Result<Option<PayoutStatus>> {
        let payout = self.load(id).await?;
        if payout.status != PayoutStatus::Processing {
            return Ok(None);
        }
        let Some(hash) = payout.submitted_hash.clone() else {
            return self.book_failure(payout, "execution interrupted").await;
        };

        match self.executor.lookup(&hash).await? {
            TxStatus::Success { ledger } => {
                info!(payout_id = %id, hash = %hash, ledger, "Interrupted payout had already landed");
                let receipt = TransferReceipt {
                    transaction_ref: hash,
                    ledger_ref: ledger,
                };
                Ok(self
                    .complete(payout, receipt)
                    .await?
                    .then_some(PayoutStatus::Completed))
            }
            TxStatus::Failed { result } => {
                let reason = format!("transaction {hash} failed on-chain: {result}");
                self.book_failure(payout, &reason).await
            }
            TxStatus::NotFound => self.book_failure(payout, "execution interrupted").await,
        }
    }

    async fn load(&self, id: PayoutId) -> Result<Payout> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| PayoutError::NotFound(id.to_string()))
    }

    async fn fail_attempt(&self, payout: Payout, e: PayoutError) -> Result<()> {
        warn!(payout_id = %payout.id, kind = e.kind(), error = %e, "Payout attempt failed");
        self.book_failure(payout, &e.to_string()).await.map(|_| ())
    }

    /// Persist the hash before polling so recovery can look it up. Polling
    /// goes ahead even if the write never succeeds.
    async fn record_submission(&self, mut payout: Payout, hash: String) -> Payout {
        let id = payout.id;
        payout.mark_submitted(hash, Utc::now());

        for attempt in 1..=WRITE_ATTEMPTS {
            match self.store.save_if(&payout, PayoutStatus::Processing).await {
                Ok(true) => return payout,
                Ok(false) => {
                    warn!(payout_id = %id, "Payout moved before its submission could be recorded");
                    return payout;
                }
                Err(e) if attempt < WRITE_ATTEMPTS => {
                    warn!(payout_id = %id, attempt, error = %e, "Submission write failed; retrying");
                    tokio::time::sleep(WRITE_RETRY_DELAY * attempt).await;
                }
                Err(e) => error!(payout_id = %id, error = %e, "Could not record submitted hash"),
            }
        }
        payout
    }

    /// Record a confirmed transfer. Returns `false` when another attempt
    /// already completed the record.
    async fn complete(&self, payout: Payout, receipt: TransferReceipt) -> Result<bool> {
        let id = payout.id;
        let mut known = Some(payout);
        let mut attempt = 1;

        let completed = loop {
            match self.write_completion(id, known.take(), &receipt).await {
                Ok(outcome) => break outcome,
                Err(e) if attempt < WRITE_ATTEMPTS => {
                    warn!(payout_id = %id, attempt, error = %e, "Completion write failed; retrying");
                    tokio::time::sleep(WRITE_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        payout_id = %id,
                        transaction_ref = %receipt.transaction_ref,
                        error = %e,
                        "Could not record confirmed transfer"
                    );
                    return Err(e);
                }
            }
        };
        let Some(payout) = completed else {
            return Ok(false);
        };

        info!(
            payout_id = %id,
            transaction_ref = %receipt.transaction_ref,
            ledger_ref = receipt.ledger_ref,
            "Payout completed"
        );
        self.events.publish(PayoutEvent::Processed {
            payout_id: id,
            recipient_address: payout.recipient_address,
            amount: payout.amount,
            transaction_ref: receipt.transaction_ref,
        });
        Ok(true)
    }

    /// Swap the record to `COMPLETED` from whatever status it currently holds.
    ///
    /// The transfer is on-chain regardless of what happened to the row
    /// meanwhile, so completion overrides anything but `COMPLETED`. `known` is
    /// the record as last read; `None` forces a reload.
    async fn write_completion(
        &self,
        id: PayoutId,
        known: Option<Payout>,
        receipt: &TransferReceipt,
    ) -> Result<Option<Payout>> {
        let mut current = match known {
            Some(payout) => payout,
            None => self.load(id).await?,
        };

        for _ in 0..WRITE_ATTEMPTS {
            if current.status == PayoutStatus::Completed {
                // An earlier write of ours may have landed despite reporting an error.
                if current.transaction_ref.as_deref() == Some(receipt.transaction_ref.as_str()) {
                    return Ok(Some(current));
                }
                warn!(payout_id = %id, "Payout already completed by another attempt");
                return Ok(None);
            }

            let expected = current.status;
            if expected != PayoutStatus::Processing {
                warn!(
                    payout_id = %id,
                    status = %expected,
                    "Payout moved during execution; recording confirmed transfer anyway"
                );
            }
            current.mark_completed(receipt.transaction_ref.clone(), receipt.ledger_ref, Utc::now());
            if self.store.save_if(&current, expected).await? {
                return Ok(Some(current));
            }
            current = self.load(id).await?;
        }

        Err(PayoutError::invalid_state(
            id,
            current.status,
            "record kept changing while completion was recorded",
        ))
    }

    /// Book a failed attempt for a `PROCESSING` record found by id.
    ///
    /// Returns the new status, or `None` when the record is no longer in
    /// `PROCESSING` and nothing was written.
    pub async fn record_failure(&self, id: PayoutId, reason: &str) -> Result<Option<PayoutStatus>> {
        let payout = self.load(id).await?;
        if payout.status != PayoutStatus::Processing {
            return Ok(None);
        }
        self.book_failure(payout, reason).await
    }

    /// `payout.failed` goes out only for a failure that was actually written.
    async fn book_failure(&self, mut payout: Payout, reason: &str) -> Result<Option<PayoutStatus>> {
        let id = payout.id;
        let status = payout.record_failure(reason, &self.retry_policy, Utc::now());

        if !self.store.save_if(&payout, PayoutStatus::Processing).await? {
            warn!(payout_id = %id, "Payout changed before failure could be recorded");
            return Ok(None);
        }

        match status {
            PayoutStatus::RetryScheduled => info!(
                payout_id = %id,
                retry_count = payout.retry_count,
                max_retries = payout.max_retries,
                next_retry_at = ?payout.next_retry_at,
                "Payout retry scheduled"
            ),
            _ => error!(
                payout_id = %id,
                retry_count = payout.retry_count,
                reason,
                "Payout failed permanently"
            ),
        }
        self.events.publish(PayoutEvent::Failed {
            payout_id: id,
            recipient_address: payout.recipient_address,
            reason: reason.to_string(),
        });
        Ok(Some(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{new_payout, ContendedStore, ScriptedExecutor, Step};

    struct Harness {
        store: Arc<ContendedStore>,
        executor: Arc<ScriptedExecutor>,
        events: EventBus,
        orchestrator: Arc<Orchestrator>,
    }

    fn harness(steps: Vec<Step>) -> Harness {
        let store = Arc::new(ContendedStore::new());
        let executor = Arc::new(ScriptedExecutor::new(steps));
        let events = EventBus::new(16);
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            executor.clone(),
            events.clone(),
            RetryPolicy::default(),
        ));
        Harness {
            store,
            executor,
            events,
            orchestrator,
        }
    }

    async fn claimed(store: &dyn PayoutStore) -> Payout {
        let mut payout = Payout::new(new_payout("sub-1", "GDEST"), 3, Utc::now());
        payout.mark_claimed(Utc::now()).unwrap();
        store.create(&payout).await.unwrap();
        payout
    }

    #[tokio::test]
    async fn success_completes_and_emits_once() {
        let h = harness(vec![Step::Succeed]);
        let mut rx = h.events.subscribe();
        let payout = claimed(h.store.as_ref()).await;

        h.orchestrator.execute(payout.id).await.unwrap();

        let stored = h.store.get(payout.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PayoutStatus::Completed);
        assert!(stored.transaction_ref.is_some());
        assert!(stored.ledger_ref.is_some());
        assert!(stored.processed_at.is_some());
        assert_eq!(stored.submitted_hash, None);

        match rx.try_recv().unwrap() {
            PayoutEvent::Processed {
                payout_id,
                transaction_ref,
                ..
            } => {
                assert_eq!(payout_id, payout.id);
                assert_eq!(Some(transaction_ref), stored.transaction_ref);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn three_failures_walk_to_terminal_failed() {
        let h = harness(vec![
            Step::Fail("first"),
            Step::Timeout,
            Step::Fail("third"),
        ]);
        let mut rx = h.events.subscribe();
        let payout = claimed(h.store.as_ref()).await;
        let mut seen = vec![PayoutStatus::Processing];

        for _ in 0..3 {
            h.orchestrator.execute(payout.id).await.unwrap();
            let mut stored = h.store.get(payout.id).await.unwrap().unwrap();
            seen.push(stored.status);
            assert!(stored.retry_count <= stored.max_retries);
            if stored.status == PayoutStatus::RetryScheduled {
                stored.requeue(Utc::now()).unwrap();
                h.store.save(&stored).await.unwrap();
                seen.push(PayoutStatus::Processing);
            }
        }

        assert_eq!(
            seen,
            vec![
                PayoutStatus::Processing,
                PayoutStatus::RetryScheduled,
                PayoutStatus::Processing,
                PayoutStatus::RetryScheduled,
                PayoutStatus::Processing,
                PayoutStatus::Failed,
            ]
        );
        let stored = h.store.get(payout.id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 3);
        assert_eq!(stored.next_retry_at, None);
        assert_eq!(stored.transaction_ref, None);
        assert_eq!(
            stored.failure_reason.as_deref(),
            Some("Transaction execution failed: third")
        );

        for _ in 0..3 {
            assert!(matches!(rx.try_recv().unwrap(), PayoutEvent::Failed { .. }));
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stale_execution_is_a_no_op() {
        let h = harness(vec![]);
        let payout = Payout::new(new_payout("sub-1", "GDEST"), 3, Utc::now());
        h.store.create(&payout).await.unwrap();

        h.orchestrator.execute(payout.id).await.unwrap();

        assert_eq!(h.executor.calls(), 0);
        let stored = h.store.get(payout.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PayoutStatus::Pending);
    }

    #[tokio::test]
    async fn completed_payout_is_never_re_executed() {
        let h = harness(vec![]);
        let payout = claimed(h.store.as_ref()).await;
        h.orchestrator.execute(payout.id).await.unwrap();
        h.orchestrator.execute(payout.id).await.unwrap();

        assert_eq!(h.executor.calls(), 1);
        let stored = h.store.get(payout.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PayoutStatus::Completed);
    }

    #[tokio::test]
    async fn missing_payout_is_not_found() {
        let h = harness(vec![]);
        let err = h.orchestrator.execute(PayoutId::new()).await.unwrap_err();
        assert!(matches!(err, PayoutError::NotFound(_)));
    }

    #[tokio::test]
    async fn panicking_execution_is_booked_as_failure() {
        let h = harness(vec![Step::Panic]);
        let mut rx = h.events.subscribe();
        let payout = claimed(h.store.as_ref()).await;

        h.orchestrator.dispatch(payout.id).await.unwrap();

        let stored = h.store.get(payout.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PayoutStatus::RetryScheduled);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.failure_reason.as_deref(), Some("execution task panicked"));

        match rx.try_recv().unwrap() {
            PayoutEvent::Failed { payout_id, reason, .. } => {
                assert_eq!(payout_id, payout.id);
                assert_eq!(reason, "execution task panicked");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn lost_failure_write_emits_nothing() {
        let h = harness(vec![]);
        let mut rx = h.events.subscribe();
        let payout = claimed(h.store.as_ref()).await;

        let mut done = payout.clone();
        done.mark_completed("elsewhere".to_string(), 3, Utc::now());
        h.store.save(&done).await.unwrap();

        let booked = h.orchestrator.book_failure(payout.clone(), "late").await.unwrap();
        assert_eq!(booked, None);
        assert!(rx.try_recv().is_err());
        let stored = h.store.get(payout.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PayoutStatus::Completed);
    }

    #[tokio::test]
    async fn timed_out_attempt_clears_submitted_hash() {
        let h = harness(vec![Step::Timeout]);
        let payout = claimed(h.store.as_ref()).await;

        h.orchestrator.execute(payout.id).await.unwrap();

        let stored = h.store.get(payout.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PayoutStatus::RetryScheduled);
        assert_eq!(stored.submitted_hash, None);
        assert!(stored
            .failure_reason
            .as_deref()
            .is_some_and(|r| r.contains("tx-1")));
    }

    #[tokio::test]
    async fn completion_write_is_retried_after_a_transient_error() {
        let h = harness(vec![Step::Succeed]);
        let mut rx = h.events.subscribe();
        let payout = claimed(h.store.as_ref()).await;
        h.store.fail_completions(1);

        h.orchestrator.execute(payout.id).await.unwrap();

        let stored = h.store.get(payout.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PayoutStatus::Completed);
        assert_eq!(h.executor.calls(), 1);
        assert!(matches!(rx.try_recv().unwrap(), PayoutEvent::Processed { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unrecorded_completion_is_settled_by_recovery_without_resending() {
        let h = harness(vec![Step::Succeed]);
        let payout = claimed(h.store.as_ref()).await;
        h.store.fail_completions(WRITE_ATTEMPTS as usize);

        assert!(h.orchestrator.execute(payout.id).await.is_err());
        let stuck = h.store.get(payout.id).await.unwrap().unwrap();
        assert_eq!(stuck.status, PayoutStatus::Processing);
        let hash = stuck.submitted_hash.clone().unwrap();

        let settled = h.orchestrator.recover(payout.id).await.unwrap();
        assert_eq!(settled, Some(PayoutStatus::Completed));

        let stored = h.store.get(payout.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PayoutStatus::Completed);
        assert_eq!(stored.transaction_ref, Some(hash));
        assert_eq!(stored.retry_count, 0);
        assert_eq!(h.executor.calls(), 1);
    }

    #[tokio::test]
    async fn recovery_books_on_chain_failure() {
        let h = harness(vec![]);
        let mut rx = h.events.subscribe();
        let mut payout = claimed(h.store.as_ref()).await;
        payout.mark_submitted("h-bad".to_string(), Utc::now());
        h.store.save(&payout).await.unwrap();
        h.executor.settle(
            "h-bad",
            TxStatus::Failed {
                result: "op_no_trust".to_string(),
            },
        );

        let settled = h.orchestrator.recover(payout.id).await.unwrap();
        assert_eq!(settled, Some(PayoutStatus::RetryScheduled));

        let stored = h.store.get(payout.id).await.unwrap().unwrap();
        assert!(stored
            .failure_reason
            .as_deref()
            .is_some_and(|r| r.contains("op_no_trust")));
        assert!(matches!(rx.try_recv().unwrap(), PayoutEvent::Failed { .. }));
        assert!(rx.try_recv().is_err());
        assert_eq!(h.executor.calls(), 0);
    }

    #[tokio::test]
    async fn recovery_skips_records_no_longer_processing() {
        let h = harness(vec![]);
        let payout = Payout::new(new_payout("sub-1", "GDEST"), 3, Utc::now());
        h.store.create(&payout).await.unwrap();

        assert_eq!(h.orchestrator.recover(payout.id).await.unwrap(), None);
        let stored = h.store.get(payout.id).await.unwrap().unwrap();
        assert_eq!(stored, payout);
    }

    #[tokio::test]
    async fn completion_wins_over_concurrent_reschedule() {
        let h = harness(vec![]);
        let payout = claimed(h.store.as_ref()).await;

        // The row was rescheduled while the transfer was in flight.
        let mut moved = payout.clone();
        moved.record_failure("interrupted", &RetryPolicy::default(), Utc::now());
        h.store.save(&moved).await.unwrap();

        let written = h
            .orchestrator
            .complete(
                payout.clone(),
                TransferReceipt {
                    transaction_ref: "late".to_string(),
                    ledger_ref: 9,
                },
            )
            .await
            .unwrap();
        assert!(written);

        let stored = h.store.get(payout.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PayoutStatus::Completed);
        assert_eq!(stored.transaction_ref.as_deref(), Some("late"));
        assert_eq!(stored.next_retry_at, None);
    }

    #[tokio::test]
    async fn completion_never_overwrites_a_concurrent_completion() {
        let h = harness(vec![Step::Succeed]);
        let mut rx = h.events.subscribe();
        let payout = claimed(h.store.as_ref()).await;

        // A sweep reschedules the row, then another attempt completes it,
        // each landing just before one of our swaps.
        let mut rescheduled = payout.clone();
        rescheduled.record_failure("interrupted", &RetryPolicy::default(), Utc::now());
        h.store.interleave(rescheduled);
        let mut other = payout.clone();
        other.mark_completed("other".to_string(), 5, Utc::now());
        h.store.interleave(other);

        h.orchestrator.execute(payout.id).await.unwrap();

        let stored = h.store.get(payout.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PayoutStatus::Completed);
        assert_eq!(stored.transaction_ref.as_deref(), Some("other"));
        assert_eq!(stored.ledger_ref, Some(5));
        assert!(rx.try_recv().is_err());
    }
}
