//! Booking API
//!
//! - POST /api/v1/bookings - Book a session and set up its payment

use axum::{extract::State, http::StatusCode, Extension, Json};
use chrono::Utc;

use crate::api::middleware::{ApiError, ApiJson, AppState, Caller};
use crate::models::CreateBookingInput;
use crate::services::BookingOutcome;

/// POST /api/v1/bookings
///
/// The caller must be the booking student.
pub async fn create_booking(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    ApiJson(input): ApiJson<CreateBookingInput>,
) -> Result<(StatusCode, Json<BookingOutcome>), ApiError> {
    if input.student_id != caller.0 {
        return Err(ApiError::forbidden("Only the student can book for themselves"));
    }
    let outcome = state.bookings.create_booking(input, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}
