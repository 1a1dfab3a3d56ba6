//! The payout entity and its state machine.
//!
//! ```text
//! PENDING ──claim──▶ PROCESSING ──success──▶ COMPLETED
//!                      │    ▲
//!              failure │    │ scheduler / recovery
//!                      ▼    │
//!               RETRY_SCHEDULED
//!                      │ retry_count == max_retries
//!                      ▼
//!                   FAILED ──admin retry──▶ PROCESSING
//! ```
//!
//! Every method here is pure bookkeeping on an in-memory [`Payout`]; callers
//! persist the result through a [`crate::store::PayoutStore`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{PayoutError, Result};

/// Opaque payout identifier, generated once at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayoutId(Uuid);

impl PayoutId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PayoutId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PayoutId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PayoutId {
    type Err = PayoutError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| PayoutError::Validation(format!("invalid payout id: {s}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayoutStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    RetryScheduled,
}

impl PayoutStatus {
    /// Identifier stored in the `status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::RetryScheduled => "RETRY_SCHEDULED",
        }
    }

    /// No automatic transition leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PayoutStatus {
    type Err = PayoutError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PROCESSING" => Ok(Self::Processing),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "RETRY_SCHEDULED" => Ok(Self::RetryScheduled),
            other => Err(PayoutError::Validation(format!("unknown payout status: {other}"))),
        }
    }
}

/// Classification tag. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutKind {
    Reward,
    Bonus,
    Referral,
}

impl PayoutKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reward => "reward",
            Self::Bonus => "bonus",
            Self::Referral => "referral",
        }
    }
}

impl FromStr for PayoutKind {
    type Err = PayoutError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "reward" => Ok(Self::Reward),
            "bonus" => Ok(Self::Bonus),
            "referral" => Ok(Self::Referral),
            other => Err(PayoutError::Validation(format!("unknown payout kind: {other}"))),
        }
    }
}

/// Exponential backoff between automatic retries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Multiplied by `2^retry_count` to get the delay.
    pub base_unit: Duration,
    /// `max_retries` given to new payouts and restored by an admin retry.
    pub default_max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_unit: Duration::minutes(5),
            default_max_retries: 3,
        }
    }
}

impl RetryPolicy {
    /// `2^retry_count × base_unit`: 10, 20, 40 minutes for retries 1-3 with
    /// the default five-minute unit.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        self.base_unit * (1i32 << retry_count.min(20))
    }
}

/// Input for creating a payout in `PENDING`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPayout {
    pub recipient_address: String,
    pub amount: Decimal,
    pub asset: String,
    pub kind: PayoutKind,
    #[serde(default)]
    pub quest_ref: Option<String>,
    #[serde(default)]
    pub submission_ref: Option<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl NewPayout {
    pub fn validate(&self) -> Result<()> {
        if self.amount <= Decimal::ZERO {
            return Err(PayoutError::Validation(format!(
                "amount must be positive, got {}",
                self.amount
            )));
        }
        if self.recipient_address.trim().is_empty() {
            return Err(PayoutError::Validation(
                "recipient_address must not be empty".to_string(),
            ));
        }
        if self.asset.trim().is_empty() {
            return Err(PayoutError::Validation("asset must not be empty".to_string()));
        }
        Ok(())
    }
}

/// One owed transfer and its execution state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payout {
    pub id: PayoutId,
    pub recipient_address: String,
    pub amount: Decimal,
    pub asset: String,
    pub status: PayoutStatus,
    pub kind: PayoutKind,
    pub quest_ref: Option<String>,
    pub submission_ref: Option<String>,
    /// Hash of the in-flight attempt, recorded before confirmation polling.
    pub submitted_hash: Option<String>,
    pub transaction_ref: Option<String>,
    pub ledger_ref: Option<i64>,
    pub failure_reason: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payout {
    /// Build a fresh `PENDING` record. The input must already be validated.
    pub fn new(new: NewPayout, default_max_retries: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: PayoutId::new(),
            recipient_address: new.recipient_address,
            amount: new.amount,
            asset: new.asset,
            status: PayoutStatus::Pending,
            kind: new.kind,
            quest_ref: new.quest_ref,
            submission_ref: new.submission_ref,
            submitted_hash: None,
            transaction_ref: None,
            ledger_ref: None,
            failure_reason: None,
            retry_count: 0,
            max_retries: new.max_retries.unwrap_or(default_max_retries),
            next_retry_at: None,
            processed_at: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_claimable(&self) -> bool {
        self.status == PayoutStatus::Pending && self.claimed_at.is_none()
    }

    /// `PENDING → PROCESSING`. `claimed_at` is only ever written here.
    pub fn mark_claimed(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !self.is_claimable() {
            return Err(PayoutError::invalid_state(
                self.id,
                self.status,
                "payout is not claimable",
            ));
        }
        self.claimed_at = Some(now);
        self.status = PayoutStatus::Processing;
        self.updated_at = now;
        Ok(())
    }

    /// The current attempt reached the network as `hash`.
    pub fn mark_submitted(&mut self, hash: String, now: DateTime<Utc>) {
        self.submitted_hash = Some(hash);
        self.updated_at = now;
    }

    /// `PROCESSING → COMPLETED`.
    pub fn mark_completed(&mut self, transaction_ref: String, ledger_ref: i64, now: DateTime<Utc>) {
        self.status = PayoutStatus::Completed;
        self.submitted_hash = None;
        self.transaction_ref = Some(transaction_ref);
        self.ledger_ref = Some(ledger_ref);
        self.processed_at.get_or_insert(now);
        self.failure_reason = None;
        self.next_retry_at = None;
        self.updated_at = now;
    }

    /// Book one failed attempt and decide retry vs. terminal failure.
    pub fn record_failure(
        &mut self,
        reason: impl Into<String>,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> PayoutStatus {
        self.retry_count = (self.retry_count + 1).min(self.max_retries);
        self.failure_reason = Some(reason.into());
        self.submitted_hash = None;
        self.updated_at = now;

        if self.retry_count < self.max_retries {
            self.next_retry_at = Some(now + policy.backoff(self.retry_count));
            self.status = PayoutStatus::RetryScheduled;
        } else {
            self.next_retry_at = None;
            self.status = PayoutStatus::Failed;
        }
        self.status
    }

    /// `RETRY_SCHEDULED → PROCESSING`, done by the scheduler before dispatch.
    pub fn requeue(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != PayoutStatus::RetryScheduled {
            return Err(PayoutError::invalid_state(
                self.id,
                self.status,
                "only RETRY_SCHEDULED payouts can be re-queued",
            ));
        }
        self.status = PayoutStatus::Processing;
        self.next_retry_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// Operator override: `FAILED → PROCESSING` with fresh retry bookkeeping.
    pub fn reset_for_retry(&mut self, default_max_retries: u32, now: DateTime<Utc>) -> Result<()> {
        if self.status != PayoutStatus::Failed {
            return Err(PayoutError::invalid_state(
                self.id,
                self.status,
                "only FAILED payouts can be retried",
            ));
        }
        self.retry_count = 0;
        self.max_retries = default_max_retries;
        self.failure_reason = None;
        self.next_retry_at = None;
        self.status = PayoutStatus::Processing;
        self.updated_at = now;
        Ok(())
    }
}
