//! SQLite-backed [`PayoutStore`] — pool setup, migrations and queries.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::info;

use crate::errors::{PayoutError, Result};
use crate::payout::{Payout, PayoutId, PayoutStatus};
use crate::store::{PayoutFilter, PayoutStore};

const PAYOUT_COLUMNS: &str = "id, recipient_address, amount, asset, status, kind, quest_ref, \
     submission_ref, submitted_hash, transaction_ref, ledger_ref, failure_reason, retry_count, \
     max_retries, next_retry_at, processed_at, claimed_at, created_at, updated_at";

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    let options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);

    // Every connection to `:memory:` is its own database.
    let max_connections = if url.contains(":memory:") { 1 } else { 5 };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

/// A payout row exactly as stored.
#[derive(Debug, sqlx::FromRow)]
struct PayoutRow {
    id: String,
    recipient_address: String,
    amount: String,
    asset: String,
    status: String,
    kind: String,
    quest_ref: Option<String>,
    submission_ref: Option<String>,
    submitted_hash: Option<String>,
    transaction_ref: Option<String>,
    ledger_ref: Option<i64>,
    failure_reason: Option<String>,
    retry_count: i64,
    max_retries: i64,
    next_retry_at: Option<i64>,
    processed_at: Option<i64>,
    claimed_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<PayoutRow> for Payout {
    type Error = PayoutError;

    fn try_from(row: PayoutRow) -> Result<Self> {
        Ok(Payout {
            id: row.id.parse()?,
            recipient_address: row.recipient_address,
            amount: Decimal::from_str(&row.amount)
                .map_err(|e| PayoutError::Validation(format!("stored amount {}: {e}", row.amount)))?,
            asset: row.asset,
            status: row.status.parse()?,
            kind: row.kind.parse()?,
            quest_ref: row.quest_ref,
            submission_ref: row.submission_ref,
            submitted_hash: row.submitted_hash,
            transaction_ref: row.transaction_ref,
            ledger_ref: row.ledger_ref,
            failure_reason: row.failure_reason,
            retry_count: count_from_db(row.retry_count)?,
            max_retries: count_from_db(row.max_retries)?,
            next_retry_at: row.next_retry_at.map(time_from_db).transpose()?,
            processed_at: row.processed_at.map(time_from_db).transpose()?,
            claimed_at: row.claimed_at.map(time_from_db).transpose()?,
            created_at: time_from_db(row.created_at)?,
            updated_at: time_from_db(row.updated_at)?,
        })
    }
}

fn time_to_db(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn time_from_db(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| PayoutError::Validation(format!("stored timestamp out of range: {ms}")))
}

fn count_from_db(n: i64) -> Result<u32> {
    u32::try_from(n).map_err(|_| PayoutError::Validation(format!("stored count out of range: {n}")))
}

fn map_unique_violation(err: sqlx::Error, payout: &Payout) -> PayoutError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => PayoutError::Validation(format!(
            "a payout for submission {} already exists",
            payout.submission_ref.as_deref().unwrap_or("<none>")
        )),
        _ => PayoutError::Database(err),
    }
}

#[derive(Clone)]
pub struct SqlitePayoutStore {
    pool: SqlitePool,
}

impl SqlitePayoutStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Write every mutable column; `expected` adds the compare-and-swap guard.
    async fn update(&self, payout: &Payout, expected: Option<PayoutStatus>) -> Result<u64> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE payouts SET status = ");
        qb.push_bind(payout.status.as_str())
            .push(", submitted_hash = ")
            .push_bind(payout.submitted_hash.clone())
            .push(", transaction_ref = ")
            .push_bind(payout.transaction_ref.clone())
            .push(", ledger_ref = ")
            .push_bind(payout.ledger_ref)
            .push(", failure_reason = ")
            .push_bind(payout.failure_reason.clone())
            .push(", retry_count = ")
            .push_bind(i64::from(payout.retry_count))
            .push(", max_retries = ")
            .push_bind(i64::from(payout.max_retries))
            .push(", next_retry_at = ")
            .push_bind(payout.next_retry_at.map(time_to_db))
            .push(", processed_at = ")
            .push_bind(payout.processed_at.map(time_to_db))
            .push(", claimed_at = ")
            .push_bind(payout.claimed_at.map(time_to_db))
            .push(", updated_at = ")
            .push_bind(time_to_db(payout.updated_at))
            .push(" WHERE id = ")
            .push_bind(payout.id.to_string());

        if let Some(status) = expected {
            qb.push(" AND status = ").push_bind(status.as_str());
        }

        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }

    async fn fetch_where(
        &self,
        status: PayoutStatus,
        column: &str,
        comparison: &str,
        at: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Payout>> {
        let sql = format!(
            "SELECT {PAYOUT_COLUMNS} FROM payouts \
             WHERE status = ?1 AND {column} IS NOT NULL AND {column} {comparison} ?2 \
             ORDER BY {column} ASC LIMIT ?3"
        );
        let rows = sqlx::query_as::<_, PayoutRow>(&sql)
            .bind(status.as_str())
            .bind(time_to_db(at))
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Payout::try_from).collect()
    }
}

#[async_trait]
impl PayoutStore for SqlitePayoutStore {
    async fn create(&self, payout: &Payout) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO payouts
                (id, recipient_address, amount, asset, status, kind, quest_ref, submission_ref,
                 submitted_hash, transaction_ref, ledger_ref, failure_reason, retry_count,
                 max_retries, next_retry_at, processed_at, claimed_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18,
                    ?19)
            "#,
        )
        .bind(payout.id.to_string())
        .bind(&payout.recipient_address)
        .bind(payout.amount.to_string())
        .bind(&payout.asset)
        .bind(payout.status.as_str())
        .bind(payout.kind.as_str())
        .bind(&payout.quest_ref)
        .bind(&payout.submission_ref)
        .bind(&payout.submitted_hash)
        .bind(&payout.transaction_ref)
        .bind(payout.ledger_ref)
        .bind(&payout.failure_reason)
        .bind(i64::from(payout.retry_count))
        .bind(i64::from(payout.max_retries))
        .bind(payout.next_retry_at.map(time_to_db))
        .bind(payout.processed_at.map(time_to_db))
        .bind(payout.claimed_at.map(time_to_db))
        .bind(time_to_db(payout.created_at))
        .bind(time_to_db(payout.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, payout))?;
        Ok(())
    }

    async fn get(&self, id: PayoutId) -> Result<Option<Payout>> {
        let sql = format!("SELECT {PAYOUT_COLUMNS} FROM payouts WHERE id = ?1");
        sqlx::query_as::<_, PayoutRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(Payout::try_from)
            .transpose()
    }

    async fn find_by_submission(&self, submission_ref: &str) -> Result<Option<Payout>> {
        let sql = format!("SELECT {PAYOUT_COLUMNS} FROM payouts WHERE submission_ref = ?1");
        sqlx::query_as::<_, PayoutRow>(&sql)
            .bind(submission_ref)
            .fetch_optional(&self.pool)
            .await?
            .map(Payout::try_from)
            .transpose()
    }

    async fn save(&self, payout: &Payout) -> Result<()> {
        match self.update(payout, None).await? {
            0 => Err(PayoutError::NotFound(payout.id.to_string())),
            _ => Ok(()),
        }
    }

    async fn save_if(&self, payout: &Payout, expected: PayoutStatus) -> Result<bool> {
        Ok(self.update(payout, Some(expected)).await? == 1)
    }

    async fn find_due(
        &self,
        status: PayoutStatus,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Payout>> {
        self.fetch_where(status, "next_retry_at", "<=", now, limit).await
    }

    async fn find_stale(
        &self,
        status: PayoutStatus,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Payout>> {
        self.fetch_where(status, "updated_at", "<", before, limit).await
    }

    async fn list(&self, filter: &PayoutFilter) -> Result<Vec<Payout>> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {PAYOUT_COLUMNS} FROM payouts WHERE 1 = 1"));
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(recipient) = &filter.recipient {
            qb.push(" AND recipient_address = ").push_bind(recipient.clone());
        }
        if let Some(kind) = filter.kind {
            qb.push(" AND kind = ").push_bind(kind.as_str());
        }
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(i64::from(filter.page_size()))
            .push(" OFFSET ")
            .push_bind(i64::from(filter.page_offset()));

        let rows = qb
            .build_query_as::<PayoutRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Payout::try_from).collect()
    }
}
