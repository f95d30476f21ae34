//! Tutor slot queries
//!
//! - GET /api/v1/tutors/{id}/slots?start=YYYY-MM-DD&days=N&duration=M

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;

use crate::api::middleware::{ApiError, ApiQuery, AppState};
use crate::services::SlotResolution;

#[derive(Debug, Deserialize)]
pub struct SlotsQuery {
    /// First day of the window; defaults to today (UTC)
    #[serde(default)]
    pub start: Option<NaiveDate>,
    #[serde(default = "default_days")]
    pub days: i64,
    #[serde(default = "default_duration")]
    pub duration: i64,
}

fn default_days() -> i64 {
    7
}

fn default_duration() -> i64 {
    60
}

/// GET /api/v1/tutors/{id}/slots
pub async fn slots(
    State(state): State<AppState>,
    Path(tutor_id): Path<String>,
    ApiQuery(query): ApiQuery<SlotsQuery>,
) -> Result<Json<SlotResolution>, ApiError> {
    let now = Utc::now();
    let start = query.start.unwrap_or_else(|| now.date_naive());
    let resolution = state
        .availability
        .slots_for(&tutor_id, start, query.days, query.duration, now)
        .await?;
    Ok(Json(resolution))
}
