//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::errors::{PayoutError, Result};
use crate::executor::ExecutorConfig;
use crate::payout::RetryPolicy;
use crate::scheduler::SchedulerConfig;

#[derive(Debug, Clone)]
pub struct Config {
    /// Stellar RPC endpoint (e.g. https://soroban-testnet.stellar.org)
    pub rpc_url: String,
    /// Horizon endpoint used to read the signer's sequence
    pub horizon_url: String,
    pub network_passphrase: String,
    /// Hex-encoded ed25519 seed of the paying account
    pub signer_secret: String,
    /// Paying account address
    pub source_account: String,
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// Maximum fee per transaction, in stroops
    pub base_fee: u32,
    pub tx_timeout_secs: u64,
    pub confirm_poll_interval_ms: u64,
    pub confirm_max_attempts: u32,
    pub simulate_before_submit: bool,
    /// Per-request timeout of the ledger HTTP client
    pub http_timeout_secs: u64,
    /// Backoff unit: retry n waits 2^n × this many seconds
    pub retry_base_secs: i64,
    pub default_max_retries: u32,
    pub scheduler_interval_secs: u64,
    pub scheduler_batch_size: u32,
    /// PROCESSING records idle this long are treated as interrupted
    pub stuck_after_secs: i64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let config = Config {
            rpc_url: env_or("RPC_URL", "https://soroban-testnet.stellar.org"),
            horizon_url: env_or("HORIZON_URL", "https://horizon-testnet.stellar.org"),
            network_passphrase: env_or("NETWORK_PASSPHRASE", "Test SDF Network ; September 2015"),
            signer_secret: env_var("SIGNER_SECRET").map_err(|_| {
                PayoutError::Config("SIGNER_SECRET environment variable is required".to_string())
            })?,
            source_account: env_var("SOURCE_ACCOUNT").map_err(|_| {
                PayoutError::Config("SOURCE_ACCOUNT environment variable is required".to_string())
            })?,
            database_url: env_or("DATABASE_URL", "sqlite:./payouts.db"),
            api_port: parsed("API_PORT", "3002")?,
            base_fee: parsed("BASE_FEE", "100")?,
            tx_timeout_secs: parsed("TX_TIMEOUT_SECS", "30")?,
            confirm_poll_interval_ms: parsed("CONFIRM_POLL_INTERVAL_MS", "2000")?,
            confirm_max_attempts: parsed("CONFIRM_MAX_ATTEMPTS", "30")?,
            simulate_before_submit: parsed("SIMULATE_BEFORE_SUBMIT", "false")?,
            retry_base_secs: parsed("RETRY_BASE_SECS", "300")?,
            default_max_retries: parsed("DEFAULT_MAX_RETRIES", "3")?,
            scheduler_interval_secs: parsed("SCHEDULER_INTERVAL_SECS", "300")?,
            scheduler_batch_size: parsed("SCHEDULER_BATCH_SIZE", "10")?,
            stuck_after_secs: parsed("STUCK_AFTER_SECS", "1800")?,
            http_timeout_secs: parsed("HTTP_TIMEOUT_SECS", "30")?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Upper bound on one execution: every ledger request may run into the
    /// HTTP timeout, and each confirmation poll also waits one interval.
    pub fn max_execution_time(&self) -> Duration {
        let request = Duration::from_secs(self.http_timeout_secs);
        let before_submit = if self.simulate_before_submit { 3 } else { 2 };
        let per_poll = Duration::from_millis(self.confirm_poll_interval_ms).saturating_add(request);
        request
            .saturating_mul(before_submit)
            .saturating_add(per_poll.saturating_mul(self.confirm_max_attempts))
    }

    /// Stuck recovery must never mistake a live execution for an orphan, and
    /// must only run once the transaction's validity window has closed.
    pub fn validate(&self) -> Result<()> {
        let stuck_after = u64::try_from(self.stuck_after_secs)
            .map(Duration::from_secs)
            .map_err(|_| PayoutError::Config("STUCK_AFTER_SECS must not be negative".to_string()))?;
        let floor = self
            .max_execution_time()
            .max(Duration::from_secs(self.tx_timeout_secs));
        if stuck_after <= floor {
            return Err(PayoutError::Config(format!(
                "STUCK_AFTER_SECS ({}) must exceed the longest execution ({}s)",
                self.stuck_after_secs,
                floor.as_secs()
            )));
        }
        Ok(())
    }

    pub fn executor(&self) -> ExecutorConfig {
        ExecutorConfig {
            source_account: self.source_account.clone(),
            network_passphrase: self.network_passphrase.clone(),
            base_fee: self.base_fee,
            tx_timeout: Duration::from_secs(self.tx_timeout_secs),
            poll_interval: Duration::from_millis(self.confirm_poll_interval_ms),
            max_poll_attempts: self.confirm_max_attempts,
            simulate: self.simulate_before_submit,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_unit: chrono::Duration::seconds(self.retry_base_secs),
            default_max_retries: self.default_max_retries,
        }
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_secs(self.scheduler_interval_secs),
            batch_size: self.scheduler_batch_size,
            stuck_after: chrono::Duration::seconds(self.stuck_after_secs),
        }
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| PayoutError::Config(format!("Missing env var: {key}")))
}

fn env_or(key: &str, default: &str) -> String {
    env_var(key).unwrap_or_else(|_| default.to_string())
}

fn parsed<T: FromStr>(key: &str, default: &str) -> Result<T> {
    env_or(key, default)
        .parse()
        .map_err(|_| PayoutError::Config(format!("Invalid {key}")))
}
