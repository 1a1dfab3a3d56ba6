//! Application-wide error types.

use thiserror::Error;

use crate::payout::PayoutStatus;

#[derive(Debug, Error)]
pub enum PayoutError {
    #[error("Payout not found: {0}")]
    NotFound(String),

    #[error("Payout {id} is {status}: {reason}")]
    InvalidState {
        id: String,
        status: PayoutStatus,
        reason: String,
    },

    #[error("Recipient address mismatch (expected {expected}, got {supplied})")]
    Mismatch { expected: String, supplied: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transaction execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Transaction {hash} not confirmed after {attempts} attempts")]
    ConfirmationTimeout { hash: String, attempts: u32 },

    #[error("Transaction simulation failed: {0}")]
    SimulationFailed(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PayoutError {
    /// Stable classification string, surfaced to API callers.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidState { .. } => "invalid_state",
            Self::Mismatch { .. } => "mismatch",
            Self::Validation(_) => "validation",
            Self::ExecutionFailed(_) => "execution_failed",
            Self::ConfirmationTimeout { .. } => "confirmation_timeout",
            Self::SimulationFailed(_) => "simulation_failed",
            Self::Signing(_) => "signing",
            Self::Rpc { .. } => "rpc",
            Self::Database(_) | Self::Migrate(_) => "database",
            Self::Http(_) => "http",
            Self::Json(_) => "json",
            Self::Config(_) => "config",
        }
    }

    pub(crate) fn invalid_state(
        id: impl ToString,
        status: PayoutStatus,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidState {
            id: id.to_string(),
            status,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PayoutError>;
