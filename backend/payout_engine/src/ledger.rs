//! Ledger network client — builds, signs and submits transfers, and polls
//! their outcome.
//!
//! ## Endpoints
//!
//! * Horizon `GET /accounts/{id}` for the signer's current sequence.
//! * Stellar RPC (JSON-RPC 2.0) `simulateTransaction`, `sendTransaction` and
//!   `getTransaction`.
//!
//! Nothing here retries a submission. A single [`LedgerClient::submit`] call
//! is exactly one network mutation; retry policy lives in the orchestrator.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signer as _, SigningKey};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::errors::{PayoutError, Result};

// ─────────────────────────────────────────────────────────
// Transaction model
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentOperation {
    pub destination: String,
    pub amount: Decimal,
    pub asset: String,
}

/// An unsigned single-payment transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferTransaction {
    pub source_account: String,
    pub sequence: i64,
    /// Maximum fee in stroops.
    pub fee: u32,
    /// Unix seconds after which the network must reject the transaction.
    pub max_time: i64,
    pub network_passphrase: String,
    pub memo: String,
    pub operation: PaymentOperation,
}

impl TransferTransaction {
    /// Base64 of the canonical JSON payload.
    pub fn encode(&self) -> Result<String> {
        Ok(BASE64.encode(serde_json::to_vec(self)?))
    }

    pub fn sign(&self, signer: &TransferSigner) -> Result<SignedTransfer> {
        let payload = serde_json::to_vec(self)?;
        let signature = signer.key.sign(&payload);
        let envelope = json!({
            "tx": BASE64.encode(&payload),
            "signature": hex::encode(signature.to_bytes()),
            "public_key": signer.public_key_hex(),
        });
        Ok(SignedTransfer {
            envelope: BASE64.encode(serde_json::to_vec(&envelope)?),
        })
    }
}

/// Base64 envelope ready for `sendTransaction`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransfer {
    pub envelope: String,
}

/// ed25519 key of the paying account.
#[derive(Clone)]
pub struct TransferSigner {
    key: SigningKey,
}

impl TransferSigner {
    /// Parse a hex-encoded 32-byte seed.
    pub fn from_hex_seed(seed: &str) -> Result<Self> {
        let bytes = hex::decode(seed.trim())
            .map_err(|e| PayoutError::Signing(format!("signer seed is not hex: {e}")))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| PayoutError::Signing("signer seed must be 32 bytes".to_string()))?;
        Ok(Self {
            key: SigningKey::from_bytes(&seed),
        })
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.key.verifying_key().to_bytes())
    }
}

impl std::fmt::Debug for TransferSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferSigner")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────
// Network outcomes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulationOutcome {
    Valid,
    Invalid(String),
}

/// Immediate answer to a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Accepted into the network's queue; confirmation still outstanding.
    Pending { hash: String },
    /// Refused outright. Nothing was applied.
    Rejected { hash: Option<String>, reason: String },
}

/// On-chain state of a submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxStatus {
    Success { ledger: i64 },
    Failed { result: String },
    NotFound,
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn account_sequence(&self, account: &str) -> Result<i64>;

    async fn simulate(&self, tx: &TransferTransaction) -> Result<SimulationOutcome>;

    async fn submit(&self, tx: &SignedTransfer) -> Result<SubmitOutcome>;

    async fn transaction_status(&self, hash: &str) -> Result<TxStatus>;
}

// ─────────────────────────────────────────────────────────
// JSON-RPC response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RpcResponse<T> {
    pub result: Option<T>,
    pub error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct AccountResponse {
    pub sequence: String,
}

#[derive(Debug, Deserialize)]
pub struct SimulateResult {
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SendResult {
    pub status: String,
    pub hash: Option<String>,
    #[serde(rename = "errorResultXdr")]
    pub error_result_xdr: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GetTransactionResult {
    pub status: String,
    pub ledger: Option<i64>,
    #[serde(rename = "resultXdr")]
    pub result_xdr: Option<String>,
}

impl SendResult {
    pub fn into_outcome(self) -> SubmitOutcome {
        match (self.status.as_str(), self.hash) {
            ("PENDING" | "DUPLICATE", Some(hash)) => SubmitOutcome::Pending { hash },
            (status, hash) => SubmitOutcome::Rejected {
                hash,
                reason: match self.error_result_xdr {
                    Some(xdr) => format!("{status}: {xdr}"),
                    None => status.to_string(),
                },
            },
        }
    }
}

impl GetTransactionResult {
    /// A `SUCCESS` without a ledger sequence is a malformed response, not a
    /// confirmation.
    pub fn into_status(self) -> Result<TxStatus> {
        match self.status.as_str() {
            "SUCCESS" => match self.ledger {
                Some(ledger) => Ok(TxStatus::Success { ledger }),
                None => Err(PayoutError::Rpc {
                    code: -32603,
                    message: "getTransaction reported SUCCESS without a ledger".to_string(),
                }),
            },
            "FAILED" => Ok(TxStatus::Failed {
                result: self.result_xdr.unwrap_or_else(|| "FAILED".to_string()),
            }),
            _ => Ok(TxStatus::NotFound),
        }
    }
}

// ─────────────────────────────────────────────────────────
// HTTP client
// ─────────────────────────────────────────────────────────

pub struct StellarRpcClient {
    client: Client,
    rpc_url: String,
    horizon_url: String,
}

impl StellarRpcClient {
    pub fn new(client: Client, rpc_url: impl Into<String>, horizon_url: impl Into<String>) -> Self {
        Self {
            client,
            rpc_url: rpc_url.into(),
            horizon_url: horizon_url.into(),
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let body: RpcResponse<T> = self
            .client
            .post(&self.rpc_url)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": method,
                "params": params,
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(err) = body.error {
            return Err(PayoutError::Rpc {
                code: err.code,
                message: err.message,
            });
        }

        body.result.ok_or_else(|| PayoutError::Rpc {
            code: 0,
            message: format!("empty result from {method}"),
        })
    }
}

#[async_trait]
impl LedgerClient for StellarRpcClient {
    async fn account_sequence(&self, account: &str) -> Result<i64> {
        let url = format!("{}/accounts/{account}", self.horizon_url.trim_end_matches('/'));
        let account: AccountResponse = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        account
            .sequence
            .parse()
            .map_err(|_| PayoutError::ExecutionFailed(format!("bad sequence: {}", account.sequence)))
    }

    async fn simulate(&self, tx: &TransferTransaction) -> Result<SimulationOutcome> {
        let result: SimulateResult = self
            .call("simulateTransaction", json!({ "transaction": tx.encode()? }))
            .await?;
        Ok(match result.error {
            Some(err) => SimulationOutcome::Invalid(err),
            None => SimulationOutcome::Valid,
        })
    }

    async fn submit(&self, tx: &SignedTransfer) -> Result<SubmitOutcome> {
        let result: SendResult = self
            .call("sendTransaction", json!({ "transaction": tx.envelope }))
            .await?;
        debug!("sendTransaction status={}", result.status);
        Ok(result.into_outcome())
    }

    async fn transaction_status(&self, hash: &str) -> Result<TxStatus> {
        let result: GetTransactionResult = self
            .call("getTransaction", json!({ "hash": hash }))
            .await?;
        result.into_status()
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
