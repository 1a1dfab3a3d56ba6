//! Payout Record Store interface.
//!
//! Every state transition is a single read-modify-write on one record. There
//! are no multi-row transactions; [`PayoutStore::save_if`] is the
//! compare-and-swap that decides which writer wins a contested transition.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::errors::{PayoutError, Result};
use crate::payout::{Payout, PayoutId, PayoutKind, PayoutStatus};

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Filters and pagination for [`PayoutStore::list`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PayoutFilter {
    pub status: Option<PayoutStatus>,
    pub recipient: Option<String>,
    pub kind: Option<PayoutKind>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl PayoutFilter {
    pub fn page_size(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
    }

    pub fn page_offset(&self) -> u32 {
        self.offset.unwrap_or(0)
    }

    fn matches(&self, payout: &Payout) -> bool {
        self.status.map_or(true, |s| payout.status == s)
            && self
                .recipient
                .as_deref()
                .map_or(true, |r| payout.recipient_address == r)
            && self.kind.map_or(true, |k| payout.kind == k)
    }
}

#[async_trait]
pub trait PayoutStore: Send + Sync {
    /// Insert a new record. Fails with `Validation` if `submission_ref` is taken.
    async fn create(&self, payout: &Payout) -> Result<()>;

    async fn get(&self, id: PayoutId) -> Result<Option<Payout>>;

    async fn find_by_submission(&self, submission_ref: &str) -> Result<Option<Payout>>;

    /// Unconditional overwrite by id.
    async fn save(&self, payout: &Payout) -> Result<()>;

    /// Overwrite only while the stored status still equals `expected`.
    /// Returns `false` when another writer got there first.
    async fn save_if(&self, payout: &Payout, expected: PayoutStatus) -> Result<bool>;

    /// Records in `status` whose `next_retry_at <= now`, oldest due first.
    async fn find_due(
        &self,
        status: PayoutStatus,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Payout>>;

    /// Records in `status` not touched since `before`.
    async fn find_stale(
        &self,
        status: PayoutStatus,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Payout>>;

    /// Newest first.
    async fn list(&self, filter: &PayoutFilter) -> Result<Vec<Payout>>;
}

/// Mutex-guarded map. Used by tests and local runs without a database.
#[derive(Debug, Default)]
pub struct InMemoryPayoutStore {
    rows: Mutex<HashMap<PayoutId, Payout>>,
}

impl InMemoryPayoutStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<PayoutId, Payout>>> {
        self.rows
            .lock()
            .map_err(|_| PayoutError::Config("payout store lock poisoned".to_string()))
    }
}

#[async_trait]
impl PayoutStore for InMemoryPayoutStore {
    async fn create(&self, payout: &Payout) -> Result<()> {
        let mut rows = self.lock()?;
        if let Some(sub) = payout.submission_ref.as_deref() {
            if rows
                .values()
                .any(|p| p.submission_ref.as_deref() == Some(sub))
            {
                return Err(PayoutError::Validation(format!(
                    "a payout for submission {sub} already exists"
                )));
            }
        }
        rows.insert(payout.id, payout.clone());
        Ok(())
    }

    async fn get(&self, id: PayoutId) -> Result<Option<Payout>> {
        Ok(self.lock()?.get(&id).cloned())
    }

    async fn find_by_submission(&self, submission_ref: &str) -> Result<Option<Payout>> {
        Ok(self
            .lock()?
            .values()
            .find(|p| p.submission_ref.as_deref() == Some(submission_ref))
            .cloned())
    }

    async fn save(&self, payout: &Payout) -> Result<()> {
        let mut rows = self.lock()?;
        match rows.get_mut(&payout.id) {
            Some(row) => {
                *row = payout.clone();
                Ok(())
            }
            None => Err(PayoutError::NotFound(payout.id.to_string())),
        }
    }

    async fn save_if(&self, payout: &Payout, expected: PayoutStatus) -> Result<bool> {
        let mut rows = self.lock()?;
        match rows.get_mut(&payout.id) {
            Some(row) if row.status == expected => {
                *row = payout.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(PayoutError::NotFound(payout.id.to_string())),
        }
    }

    async fn find_due(
        &self,
        status: PayoutStatus,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Payout>> {
        let rows = self.lock()?;
        let mut due: Vec<Payout> = rows
            .values()
            .filter(|p| p.status == status && p.next_retry_at.is_some_and(|at| at <= now))
            .cloned()
            .collect();
        due.sort_by_key(|p| p.next_retry_at);
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn find_stale(
        &self,
        status: PayoutStatus,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Payout>> {
        let rows = self.lock()?;
        let mut stale: Vec<Payout> = rows
            .values()
            .filter(|p| p.status == status && p.updated_at < before)
            .cloned()
            .collect();
        stale.sort_by_key(|p| p.updated_at);
        stale.truncate(limit as usize);
        Ok(stale)
    }

    async fn list(&self, filter: &PayoutFilter) -> Result<Vec<Payout>> {
        let rows = self.lock()?;
        let mut matched: Vec<Payout> = rows.values().filter(|p| filter.matches(p)).cloned().collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(matched
            .into_iter()
            .skip(filter.page_offset() as usize)
            .take(filter.page_size() as usize)
            .collect())
    }
}
