//! Session API
//!
//! - GET /api/v1/sessions/{id} - Read a session (participants only)
//! - POST /api/v1/sessions/confirm - Confirm attendance for one role
//! - POST /api/v1/sessions/settle - Record the tutor payout (participant or admin)
//! - POST /api/v1/sessions/cancel - Cancel and refund per policy

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Extension, Json,
};
use chrono::Utc;
use serde::Deserialize;

use crate::api::middleware::{caller_from_headers, is_admin, ApiError, ApiJson, AppState, Caller};
use crate::models::{Role, Session};
use crate::services::{Actor, CancellationOutcome, ConfirmationOutcome, SettlementOutcome};

#[derive(Debug, Deserialize)]
pub struct ConfirmBody {
    pub session_id: String,
    pub role: Role,
}

#[derive(Debug, Deserialize)]
pub struct SettleBody {
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CancelBody {
    pub session_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// GET /api/v1/sessions/{id}
pub async fn get_session(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    let session = state
        .sessions
        .get_by_id(&id)
        .await
        .map_err(|e| ApiError::internal_error(e.to_string()))?
        .ok_or_else(|| ApiError::not_found(format!("Session not found: {}", id)))?;
    if !session.is_participant(&caller.0) {
        return Err(ApiError::forbidden("Only session participants can view it"));
    }
    Ok(Json(session))
}

/// POST /api/v1/sessions/confirm
pub async fn confirm(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    ApiJson(body): ApiJson<ConfirmBody>,
) -> Result<Json<ConfirmationOutcome>, ApiError> {
    let outcome = state
        .confirmations
        .confirm(&body.session_id, &caller.0, body.role, Utc::now())
        .await?;
    Ok(Json(outcome))
}

/// POST /api/v1/sessions/settle
///
/// Accepts either a valid admin token or a participant's caller id.
pub async fn settle(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(body): ApiJson<SettleBody>,
) -> Result<Json<SettlementOutcome>, ApiError> {
    let actor = if is_admin(&headers, &state.admin_token) {
        Actor::Admin
    } else {
        let caller = caller_from_headers(&headers)
            .ok_or_else(|| ApiError::unauthorized("Missing X-User-Id header"))?;
        Actor::User(caller.0)
    };
    let outcome = state.settlement.settle(&body.session_id, &actor, Utc::now()).await?;
    Ok(Json(outcome))
}

/// POST /api/v1/sessions/cancel
pub async fn cancel(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    ApiJson(body): ApiJson<CancelBody>,
) -> Result<Json<CancellationOutcome>, ApiError> {
    let outcome = state
        .cancellations
        .cancel(&body.session_id, &caller.0, body.reason, Utc::now())
        .await?;
    Ok(Json(outcome))
}
