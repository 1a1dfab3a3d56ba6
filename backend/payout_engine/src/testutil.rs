//! Test doubles for the ledger network, the executor and the store.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;

use crate::errors::{PayoutError, Result};
use crate::executor::{TransferExecutor, TransferReceipt, TransferRequest};
use crate::ledger::{
    LedgerClient, SignedTransfer, SimulationOutcome, SubmitOutcome, TransferTransaction, TxStatus,
};
use crate::payout::{NewPayout, Payout, PayoutId, PayoutKind, PayoutStatus};
use crate::store::{InMemoryPayoutStore, PayoutFilter, PayoutStore};

pub const TEST_SEED: &str = "9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60";

pub fn new_payout(submission: &str, recipient: &str) -> NewPayout {
    NewPayout {
        recipient_address: recipient.to_string(),
        amount: Decimal::new(500, 0),
        asset: "X".to_string(),
        kind: PayoutKind::Reward,
        quest_ref: Some("quest-1".to_string()),
        submission_ref: Some(submission.to_string()),
        max_retries: None,
    }
}

/// Scripted ledger. Status polls pop from a queue; `None` entries turn into
/// RPC errors and an empty queue reports `NotFound`.
pub struct MockLedger {
    sequence: i64,
    simulation: Mutex<SimulationOutcome>,
    submit: Mutex<SubmitOutcome>,
    statuses: Mutex<VecDeque<Option<TxStatus>>>,
    submitted: Mutex<Vec<TransferTransaction>>,
    polls: AtomicUsize,
}

impl MockLedger {
    pub const HASH: &'static str = "a1b2c3";

    pub fn new(sequence: i64) -> Self {
        Self {
            sequence,
            simulation: Mutex::new(SimulationOutcome::Valid),
            submit: Mutex::new(SubmitOutcome::Pending {
                hash: Self::HASH.to_string(),
            }),
            statuses: Mutex::new(VecDeque::new()),
            submitted: Mutex::new(Vec::new()),
            polls: AtomicUsize::new(0),
        }
    }

    pub fn set_simulation(&self, outcome: SimulationOutcome) {
        *self.simulation.lock().unwrap() = outcome;
    }

    pub fn set_submit(&self, outcome: SubmitOutcome) {
        *self.submit.lock().unwrap() = outcome;
    }

    pub fn push_status(&self, status: Option<TxStatus>) {
        self.statuses.lock().unwrap().push_back(status);
    }

    pub fn submitted(&self) -> Vec<TransferTransaction> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn status_polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn account_sequence(&self, _account: &str) -> Result<i64> {
        Ok(self.sequence)
    }

    async fn simulate(&self, _tx: &TransferTransaction) -> Result<SimulationOutcome> {
        Ok(self.simulation.lock().unwrap().clone())
    }

    async fn submit(&self, tx: &SignedTransfer) -> Result<SubmitOutcome> {
        let envelope: Value = serde_json::from_slice(&BASE64.decode(&tx.envelope).unwrap())?;
        let payload = BASE64.decode(envelope["tx"].as_str().unwrap_or_default()).unwrap();
        self.submitted
            .lock()
            .unwrap()
            .push(serde_json::from_slice(&payload)?);
        Ok(self.submit.lock().unwrap().clone())
    }

    async fn transaction_status(&self, _hash: &str) -> Result<TxStatus> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        match self.statuses.lock().unwrap().pop_front() {
            Some(Some(status)) => Ok(status),
            Some(None) => Err(PayoutError::Rpc {
                code: -32603,
                message: "internal error".to_string(),
            }),
            None => Ok(TxStatus::NotFound),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Step {
    /// Submit, then confirm.
    Succeed,
    /// Rejected at submit.
    Fail(&'static str),
    /// Submitted but never confirmed.
    Timeout,
    Panic,
}

/// Executor that replays a script of outcomes, then succeeds. Hashes it hands
/// out are remembered so confirmation and lookups agree with the script.
#[derive(Default)]
pub struct ScriptedExecutor {
    steps: Mutex<VecDeque<Step>>,
    outcomes: Mutex<HashMap<String, TxStatus>>,
    calls: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            ..Default::default()
        }
    }

    /// Number of submissions.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Settle `hash` on the fake ledger.
    pub fn settle(&self, hash: &str, status: TxStatus) {
        self.outcomes
            .lock()
            .unwrap()
            .insert(hash.to_string(), status);
    }

    fn outcome(&self, hash: &str) -> TxStatus {
        self.outcomes
            .lock()
            .unwrap()
            .get(hash)
            .cloned()
            .unwrap_or(TxStatus::NotFound)
    }
}

#[async_trait]
impl TransferExecutor for ScriptedExecutor {
    async fn submit(&self, request: &TransferRequest) -> Result<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let step = self.steps.lock().unwrap().pop_front().unwrap_or(Step::Succeed);
        match step {
            Step::Succeed => {
                let hash = format!("tx-{}-{call}", request.memo);
                self.settle(
                    &hash,
                    TxStatus::Success {
                        ledger: 1000 + call as i64,
                    },
                );
                Ok(hash)
            }
            Step::Fail(reason) => Err(PayoutError::ExecutionFailed(reason.to_string())),
            Step::Timeout => Ok(format!("tx-{call}")),
            Step::Panic => panic!("executor blew up"),
        }
    }

    async fn await_confirmation(&self, hash: &str) -> Result<TransferReceipt> {
        match self.outcome(hash) {
            TxStatus::Success { ledger } => Ok(TransferReceipt {
                transaction_ref: hash.to_string(),
                ledger_ref: ledger,
            }),
            TxStatus::Failed { result } => Err(PayoutError::ExecutionFailed(format!(
                "transaction {hash} failed on-chain: {result}"
            ))),
            TxStatus::NotFound => Err(PayoutError::ConfirmationTimeout {
                hash: hash.to_string(),
                attempts: 3,
            }),
        }
    }

    async fn lookup(&self, hash: &str) -> Result<TxStatus> {
        Ok(self.outcome(hash))
    }
}

/// In-memory store whose completion writes can fail or lose a race.
///
/// Before each `save_if` of a `COMPLETED` record, one queued interleaved
/// write is applied, then one pending failure is returned if any are left.
#[derive(Default)]
pub struct ContendedStore {
    inner: InMemoryPayoutStore,
    failing_completions: Mutex<usize>,
    interleaved: Mutex<VecDeque<Payout>>,
}

impl ContendedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_completions(&self, n: usize) {
        *self.failing_completions.lock().unwrap() = n;
    }

    /// Queue a competing write that lands just before the next completion write.
    pub fn interleave(&self, write: Payout) {
        self.interleaved.lock().unwrap().push_back(write);
    }
}

#[async_trait]
impl PayoutStore for ContendedStore {
    async fn create(&self, payout: &Payout) -> Result<()> {
        self.inner.create(payout).await
    }

    async fn get(&self, id: PayoutId) -> Result<Option<Payout>> {
        self.inner.get(id).await
    }

    async fn find_by_submission(&self, submission_ref: &str) -> Result<Option<Payout>> {
        self.inner.find_by_submission(submission_ref).await
    }

    async fn save(&self, payout: &Payout) -> Result<()> {
        self.inner.save(payout).await
    }

    async fn save_if(&self, payout: &Payout, expected: PayoutStatus) -> Result<bool> {
        if payout.status == PayoutStatus::Completed {
            let competing = self.interleaved.lock().unwrap().pop_front();
            if let Some(write) = competing {
                self.inner.save(&write).await?;
            }
            let fail = {
                let mut left = self.failing_completions.lock().unwrap();
                let fail = *left > 0;
                *left = left.saturating_sub(1);
                fail
            };
            if fail {
                return Err(PayoutError::Database(sqlx::Error::PoolTimedOut));
            }
        }
        self.inner.save_if(payout, expected).await
    }

    async fn find_due(
        &self,
        status: PayoutStatus,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Payout>> {
        self.inner.find_due(status, now, limit).await
    }

    async fn find_stale(
        &self,
        status: PayoutStatus,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Payout>> {
        self.inner.find_stale(status, before, limit).await
    }

    async fn list(&self, filter: &PayoutFilter) -> Result<Vec<Payout>> {
        self.inner.list(filter).await
    }
}

/// Poll the store until the payout reaches `status` or two seconds pass.
pub async fn wait_for_status(
    store: &dyn PayoutStore,
    id: PayoutId,
    status: PayoutStatus,
) -> Payout {
    for _ in 0..400 {
        let payout = store.get(id).await.unwrap().unwrap();
        if payout.status == status {
            return payout;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("payout {id} never reached {status}");
}
