//! Claim handling: the one-time `PENDING → PROCESSING` transition, after
//! which the payout is handed to the orchestrator.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::errors::{PayoutError, Result};
use crate::orchestrator::Orchestrator;
use crate::payout::{Payout, PayoutStatus};
use crate::store::PayoutStore;

pub struct ClaimHandler {
    store: Arc<dyn PayoutStore>,
    orchestrator: Arc<Orchestrator>,
}

impl ClaimHandler {
    pub fn new(store: Arc<dyn PayoutStore>, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            store,
            orchestrator,
        }
    }

    /// Claim the payout owed for `submission_ref`.
    ///
    /// Returns as soon as the claim is persisted; execution runs in the
    /// background and its outcome is only visible on the record and the
    /// event bus.
    pub async fn claim(&self, submission_ref: &str, recipient_address: &str) -> Result<Payout> {
        let mut payout = self
            .store
            .find_by_submission(submission_ref)
            .await?
            .ok_or_else(|| PayoutError::NotFound(format!("submission {submission_ref}")))?;

        if !payout.is_claimable() {
            warn!(payout_id = %payout.id, status = %payout.status, "Rejected claim on unclaimable payout");
            return Err(PayoutError::invalid_state(
                payout.id,
                payout.status,
                "payout has already been claimed",
            ));
        }

        let supplied = recipient_address.trim();
        if supplied != payout.recipient_address {
            warn!(payout_id = %payout.id, "Rejected claim with mismatched recipient");
            return Err(PayoutError::Mismatch {
                expected: payout.recipient_address,
                supplied: supplied.to_string(),
            });
        }

        payout.mark_claimed(Utc::now())?;
        if !self.store.save_if(&payout, PayoutStatus::Pending).await? {
            warn!(payout_id = %payout.id, "Lost claim race");
            return Err(PayoutError::invalid_state(
                payout.id,
                PayoutStatus::Processing,
                "payout has already been claimed",
            ));
        }

        info!(payout_id = %payout.id, submission_ref, "Payout claimed");
        self.orchestrator.dispatch(payout.id);
        Ok(payout)
    }
}
