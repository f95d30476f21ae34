//! Processor webhook endpoint
//!
//! - POST /api/v1/webhooks/stripe - Signed event callback

use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use chrono::Utc;

use crate::api::middleware::{ApiError, AppState};
use crate::payments::SIGNATURE_HEADER;
use crate::services::WebhookAck;

/// POST /api/v1/webhooks/stripe
///
/// The raw body is needed for signature verification.
pub async fn stripe(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    let ack = state.webhooks.handle(&body, signature, Utc::now()).await?;
    Ok(Json(ack))
}
