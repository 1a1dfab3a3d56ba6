//! Administrative surface over the engine: create, claim, retry and query
//! payouts. Errors returned here are rejected requests; execution outcomes
//! never surface synchronously.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::claim::ClaimHandler;
use crate::errors::{PayoutError, Result};
use crate::orchestrator::Orchestrator;
use crate::payout::{NewPayout, Payout, PayoutId, PayoutStatus};
use crate::store::{PayoutFilter, PayoutStore};

pub struct PayoutService {
    store: Arc<dyn PayoutStore>,
    orchestrator: Arc<Orchestrator>,
    claims: ClaimHandler,
}

impl PayoutService {
    pub fn new(store: Arc<dyn PayoutStore>, orchestrator: Arc<Orchestrator>) -> Self {
        let claims = ClaimHandler::new(store.clone(), orchestrator.clone());
        Self {
            store,
            orchestrator,
            claims,
        }
    }

    /// Record a new owed payout in `PENDING`.
    pub async fn create_payout(&self, new: NewPayout) -> Result<Payout> {
        new.validate()?;
        let payout = Payout::new(
            new,
            self.orchestrator.retry_policy().default_max_retries,
            Utc::now(),
        );
        self.store.create(&payout).await?;
        info!(
            payout_id = %payout.id,
            kind = payout.kind.as_str(),
            amount = %payout.amount,
            asset = %payout.asset,
            "Payout created"
        );
        Ok(payout)
    }

    pub async fn claim_payout(&self, submission_ref: &str, recipient_address: &str) -> Result<Payout> {
        self.claims.claim(submission_ref, recipient_address).await
    }

    /// Operator override for a terminally `FAILED` payout.
    pub async fn retry_payout(&self, id: PayoutId) -> Result<Payout> {
        let mut payout = self.get_payout(id).await?;
        if let Err(e) = payout.reset_for_retry(
            self.orchestrator.retry_policy().default_max_retries,
            Utc::now(),
        ) {
            warn!(payout_id = %id, status = %payout.status, "Rejected manual retry");
            return Err(e);
        }

        if !self.store.save_if(&payout, PayoutStatus::Failed).await? {
            let current = self.get_payout(id).await?;
            return Err(PayoutError::invalid_state(
                id,
                current.status,
                "only FAILED payouts can be retried",
            ));
        }

        info!(payout_id = %id, "Manual retry accepted");
        self.orchestrator.dispatch(id);
        Ok(payout)
    }

    pub async fn get_payout(&self, id: PayoutId) -> Result<Payout> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| PayoutError::NotFound(id.to_string()))
    }

    pub async fn list_payouts(&self, filter: &PayoutFilter) -> Result<Vec<Payout>> {
        self.store.list(filter).await
    }
}
