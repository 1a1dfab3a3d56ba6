//! Axum REST API handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::errors::PayoutError;
use crate::payout::{NewPayout, Payout, PayoutId};
use crate::service::PayoutService;
use crate::store::PayoutFilter;

#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<PayoutService>,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/payouts", get(list_payouts).post(create_payout))
        .route("/payouts/claim", post(claim_payout))
        .route("/payouts/:id", get(get_payout))
        .route("/payouts/:id/retry", post(retry_payout))
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub submission_ref: String,
    pub recipient_address: String,
}

#[derive(Serialize)]
pub struct PayoutsResponse {
    pub count: usize,
    pub payouts: Vec<Payout>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: &'static str,
}

impl IntoResponse for PayoutError {
    fn into_response(self) -> Response {
        let status = match &self {
            PayoutError::NotFound(_) => StatusCode::NOT_FOUND,
            PayoutError::InvalidState { .. } => StatusCode::CONFLICT,
            PayoutError::Mismatch { .. } | PayoutError::Validation(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
                kind: self.kind(),
            }),
        )
            .into_response()
    }
}

fn parse_id(raw: &str) -> Result<PayoutId, PayoutError> {
    raw.parse()
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `POST /payouts`
pub async fn create_payout(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<NewPayout>,
) -> Result<impl IntoResponse, PayoutError> {
    let payout = state.service.create_payout(body).await?;
    Ok((StatusCode::CREATED, Json(payout)))
}

/// `GET /payouts?status=&recipient=&kind=&limit=&offset=`
pub async fn list_payouts(
    State(state): State<Arc<ApiState>>,
    Query(filter): Query<PayoutFilter>,
) -> Result<impl IntoResponse, PayoutError> {
    let payouts = state.service.list_payouts(&filter).await?;
    Ok(Json(PayoutsResponse {
        count: payouts.len(),
        payouts,
    }))
}

/// `GET /payouts/:id`
pub async fn get_payout(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, PayoutError> {
    Ok(Json(state.service.get_payout(parse_id(&id)?).await?))
}

/// `POST /payouts/claim`
///
/// Returns `202 Accepted`: the transfer itself runs in the background.
pub async fn claim_payout(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<ClaimRequest>,
) -> Result<impl IntoResponse, PayoutError> {
    let payout = state
        .service
        .claim_payout(&body.submission_ref, &body.recipient_address)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(payout)))
}

/// `POST /payouts/:id/retry`
pub async fn retry_payout(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, PayoutError> {
    let payout = state.service.retry_payout(parse_id(&id)?).await?;
    Ok((StatusCode::ACCEPTED, Json(payout)))
}
