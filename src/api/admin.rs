//! Admin API endpoints
//!
//! Operator actions, all behind `X-Admin-Token`:
//! - POST /api/v1/admin/transfers/execute - Run pending payouts for a tutor
//! - POST /api/v1/admin/transfers/{id}/retry - Requeue a failed payout
//! - POST /api/v1/admin/refunds/retry - Retry a failed cancellation refund
//! - PUT /api/v1/admin/tutors/{id} - Create or update a tutor profile

use axum::{
    extract::{Path, State},
    routing::{post, put},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;

use crate::api::middleware::{ApiError, ApiJson, AppState};
use crate::models::{PendingTransfer, TutorProfile, UpsertTutorProfileInput};
use crate::services::{CancellationOutcome, TransferReport};

#[derive(Debug, Deserialize)]
pub struct ExecuteTransfersRequest {
    pub tutor_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RetryRefundRequest {
    pub session_id: String,
}

/// Build admin router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/transfers/execute", post(execute_transfers))
        .route("/transfers/{id}/retry", post(retry_transfer))
        .route("/refunds/retry", post(retry_refund))
        .route("/tutors/{id}", put(upsert_tutor))
}

/// POST /api/v1/admin/transfers/execute
async fn execute_transfers(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<ExecuteTransfersRequest>,
) -> Result<Json<TransferReport>, ApiError> {
    let report = state.settlement.execute_transfers(&body.tutor_id, Utc::now()).await?;
    Ok(Json(report))
}

/// POST /api/v1/admin/transfers/{id}/retry
async fn retry_transfer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PendingTransfer>, ApiError> {
    let transfer = state.settlement.retry_failed_transfer(&id, Utc::now()).await?;
    Ok(Json(transfer))
}

/// POST /api/v1/admin/refunds/retry
async fn retry_refund(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<RetryRefundRequest>,
) -> Result<Json<CancellationOutcome>, ApiError> {
    let outcome = state.cancellations.retry_refund(&body.session_id, Utc::now()).await?;
    Ok(Json(outcome))
}

/// PUT /api/v1/admin/tutors/{id}
async fn upsert_tutor(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(input): ApiJson<UpsertTutorProfileInput>,
) -> Result<Json<TutorProfile>, ApiError> {
    let profile = state.tutors.upsert(&id, input, Utc::now()).await?;
    Ok(Json(profile))
}
