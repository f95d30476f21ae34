//! Tutor profile model
//!
//! Local mirror of the identity/profile directory: hourly rate, payout
//! account and weekly availability.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Cents, WeeklyAvailability};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TutorProfile {
    pub tutor_id: String,
    pub hourly_rate: Cents,
    /// Connected payout account at the processor
    pub payout_account_id: Option<String>,
    /// Last known onboarding state of the payout account
    pub payout_onboarded: bool,
    pub availability: WeeklyAvailability,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TutorProfile {
    pub fn has_verified_payout(&self) -> bool {
        self.payout_onboarded && self.payout_account_id.is_some()
    }
}

/// Input for creating or replacing a tutor profile
#[derive(Debug, Clone, Deserialize)]
pub struct UpsertTutorProfileInput {
    pub hourly_rate_cents: i64,
    #[serde(default)]
    pub payout_account_id: Option<String>,
    #[serde(default)]
    pub payout_onboarded: bool,
    #[serde(default)]
    pub availability: WeeklyAvailability,
}
