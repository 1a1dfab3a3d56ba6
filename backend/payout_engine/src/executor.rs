//! External Transaction Executor.
//!
//! One attempt is one submission: read the signer's sequence, build the
//! payment, optionally simulate it, sign and submit it. Confirmation is a
//! separate step that polls for a terminal on-chain state at a fixed interval
//! up to a bounded number of attempts, so the caller can persist the hash in
//! between.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::errors::{PayoutError, Result};
use crate::ledger::{
    LedgerClient, PaymentOperation, SimulationOutcome, SubmitOutcome, TransferSigner,
    TransferTransaction, TxStatus,
};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Paying account address.
    pub source_account: String,
    pub network_passphrase: String,
    /// Maximum fee per transaction in stroops.
    pub base_fee: u32,
    /// Validity window of a built transaction.
    pub tx_timeout: Duration,
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
    /// Simulate before signing.
    pub simulate: bool,
}

/// What to transfer and to whom.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    pub destination: String,
    pub amount: Decimal,
    pub asset: String,
    /// Attached to the transaction so ledger history can be matched back to a payout.
    pub memo: String,
}

/// A transfer confirmed on-chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub transaction_ref: String,
    pub ledger_ref: i64,
}

#[async_trait]
pub trait TransferExecutor: Send + Sync {
    /// Build, sign and submit one transfer. Returns the transaction hash once
    /// the network has accepted it.
    async fn submit(&self, request: &TransferRequest) -> Result<String>;

    /// Poll until `hash` reaches a terminal state or attempts run out.
    async fn await_confirmation(&self, hash: &str) -> Result<TransferReceipt>;

    /// One status lookup, without waiting.
    async fn lookup(&self, hash: &str) -> Result<TxStatus>;

    async fn execute(&self, request: &TransferRequest) -> Result<TransferReceipt> {
        let hash = self.submit(request).await?;
        self.await_confirmation(&hash).await
    }
}

pub struct TransactionExecutor {
    ledger: Arc<dyn LedgerClient>,
    signer: TransferSigner,
    config: ExecutorConfig,
}

impl TransactionExecutor {
    pub fn new(ledger: Arc<dyn LedgerClient>, signer: TransferSigner, config: ExecutorConfig) -> Self {
        Self {
            ledger,
            signer,
            config,
        }
    }

    fn build(&self, request: &TransferRequest, sequence: i64) -> TransferTransaction {
        let timeout_secs = i64::try_from(self.config.tx_timeout.as_secs()).unwrap_or(i64::MAX);
        TransferTransaction {
            source_account: self.config.source_account.clone(),
            sequence: sequence + 1,
            fee: self.config.base_fee,
            max_time: Utc::now().timestamp().saturating_add(timeout_secs),
            network_passphrase: self.config.network_passphrase.clone(),
            memo: request.memo.clone(),
            operation: PaymentOperation {
                destination: request.destination.clone(),
                amount: request.amount,
                asset: request.asset.clone(),
            },
        }
    }
}

#[async_trait]
impl TransferExecutor for TransactionExecutor {
    async fn submit(&self, request: &TransferRequest) -> Result<String> {
        let sequence = self
            .ledger
            .account_sequence(&self.config.source_account)
            .await?;
        let tx = self.build(request, sequence);

        if self.config.simulate {
            if let SimulationOutcome::Invalid(reason) = self.ledger.simulate(&tx).await? {
                return Err(PayoutError::SimulationFailed(reason));
            }
        }

        let signed = tx.sign(&self.signer)?;
        let hash = match self.ledger.submit(&signed).await? {
            SubmitOutcome::Pending { hash } => hash,
            SubmitOutcome::Rejected { hash, reason } => {
                warn!(hash = ?hash, reason = %reason, "Transaction rejected on submit");
                return Err(PayoutError::ExecutionFailed(reason));
            }
        };

        info!(
            hash = %hash,
            destination = %request.destination,
            amount = %request.amount,
            asset = %request.asset,
            "Transaction submitted"
        );
        Ok(hash)
    }

    async fn await_confirmation(&self, hash: &str) -> Result<TransferReceipt> {
        for attempt in 1..=self.config.max_poll_attempts {
            tokio::time::sleep(self.config.poll_interval).await;

            match self.ledger.transaction_status(hash).await {
                Ok(TxStatus::Success { ledger }) => {
                    info!(hash = %hash, ledger, attempt, "Transaction confirmed");
                    return Ok(TransferReceipt {
                        transaction_ref: hash.to_string(),
                        ledger_ref: ledger,
                    });
                }
                Ok(TxStatus::Failed { result }) => {
                    return Err(PayoutError::ExecutionFailed(format!(
                        "transaction {hash} failed on-chain: {result}"
                    )));
                }
                Ok(TxStatus::NotFound) => {
                    debug!(hash = %hash, attempt, "Transaction not yet visible");
                }
                Err(e) => {
                    warn!(hash = %hash, attempt, error = %e, "Confirmation poll failed");
                }
            }
        }

        Err(PayoutError::ConfirmationTimeout {
            hash: hash.to_string(),
            attempts: self.config.max_poll_attempts,
        })
    }

    async fn lookup(&self, hash: &str) -> Result<TxStatus> {
        self.ledger.transaction_status(hash).await
    }
}
