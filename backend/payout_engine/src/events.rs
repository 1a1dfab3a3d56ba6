//! Domain events produced by the orchestrator.
//!
//! Delivery is fire-and-forget over a [`tokio::sync::broadcast`] channel.
//! Listeners are best-effort: a slow or missing listener never rolls back
//! payout state.

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::payout::PayoutId;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event")]
pub enum PayoutEvent {
    #[serde(rename = "payout.processed")]
    Processed {
        payout_id: PayoutId,
        recipient_address: String,
        amount: Decimal,
        transaction_ref: String,
    },
    #[serde(rename = "payout.failed")]
    Failed {
        payout_id: PayoutId,
        recipient_address: String,
        reason: String,
    },
}

impl PayoutEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Processed { .. } => "payout.processed",
            Self::Failed { .. } => "payout.failed",
        }
    }

    pub fn payout_id(&self) -> PayoutId {
        match self {
            Self::Processed { payout_id, .. } | Self::Failed { payout_id, .. } => *payout_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PayoutEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns how many listeners received the event.
    pub fn publish(&self, event: PayoutEvent) -> usize {
        let name = event.name();
        let payout_id = event.payout_id();
        match self.sender.send(event) {
            Ok(n) => n,
            Err(_) => {
                debug!(payout_id = %payout_id, event = name, "No event listeners");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PayoutEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Logs every payout event until cancelled or the bus closes.
pub async fn run_audit_listener(
    mut events: broadcast::Receiver<PayoutEvent>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = events.recv() => match received {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => info!(event = event.name(), payload = %json, "Payout event"),
                    Err(e) => warn!(event = event.name(), error = %e, "Unserialisable payout event"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Audit listener lagged behind the event bus");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    info!("Audit listener stopped");
}
