//! Payment authorization API
//!
//! - POST /api/v1/payments/authorize - Create or reuse the session's authorization
//!
//! Amounts must say their unit: `{"minor_units": 5000}` or `{"major_units": 50.0}`.

use axum::{extract::State, Extension, Json};
use chrono::Utc;
use serde::Deserialize;

use crate::api::middleware::{ApiError, ApiJson, AppState, Caller};
use crate::models::AmountInput;
use crate::services::{Authorization, AuthorizeRequest};

#[derive(Debug, Deserialize)]
pub struct AuthorizeBody {
    pub session_id: String,
    pub amount: AmountInput,
    pub tutor_id: String,
    pub student_id: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// POST /api/v1/payments/authorize
pub async fn authorize(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    ApiJson(body): ApiJson<AuthorizeBody>,
) -> Result<Json<Authorization>, ApiError> {
    if body.student_id != caller.0 {
        return Err(ApiError::forbidden("Only the paying student can authorize"));
    }
    let amount = body
        .amount
        .to_cents()
        .map_err(|e| ApiError::validation_error(e.to_string()))?;

    let authorization = state
        .payments
        .authorize(
            AuthorizeRequest {
                session_id: body.session_id,
                amount,
                tutor_id: body.tutor_id,
                student_id: body.student_id,
                description: body.description,
            },
            Utc::now(),
        )
        .await?;
    Ok(Json(authorization))
}
