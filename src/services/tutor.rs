//! Tutor profile directory
//!
//! Local mirror of tutor rate, payout account and weekly hours.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::db::repositories::TutorProfileRepository;
use crate::models::{Cents, TutorProfile, UpsertTutorProfileInput};

#[derive(Debug, thiserror::Error)]
pub enum TutorError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub struct TutorDirectory {
    repo: Arc<dyn TutorProfileRepository>,
}

impl TutorDirectory {
    pub fn new(repo: Arc<dyn TutorProfileRepository>) -> Self {
        Self { repo }
    }

    pub async fn get(&self, tutor_id: &str) -> anyhow::Result<Option<TutorProfile>> {
        self.repo.get(tutor_id).await
    }

    pub async fn upsert(
        &self,
        tutor_id: &str,
        input: UpsertTutorProfileInput,
        now: DateTime<Utc>,
    ) -> Result<TutorProfile, TutorError> {
        if tutor_id.trim().is_empty() {
            return Err(TutorError::Validation("tutor id is required".to_string()));
        }
        if input.hourly_rate_cents <= 0 {
            return Err(TutorError::Validation("hourly rate must be positive".to_string()));
        }
        if let Some((day, range)) = input.availability.find_invalid_range() {
            return Err(TutorError::Validation(format!(
                "availability range {}-{} on {} must end after it starts",
                range.start.format("%H:%M"),
                range.end.format("%H:%M"),
                day
            )));
        }

        let profile = TutorProfile {
            tutor_id: tutor_id.to_string(),
            hourly_rate: Cents(input.hourly_rate_cents),
            payout_account_id: input.payout_account_id.filter(|a| !a.trim().is_empty()),
            payout_onboarded: input.payout_onboarded,
            availability: input.availability,
            created_at: now,
            updated_at: now,
        };
        Ok(self.repo.upsert(&profile).await?)
    }

    pub async fn set_onboarding_by_account(
        &self,
        account_id: &str,
        onboarded: bool,
        now: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        self.repo.set_onboarding_by_account(account_id, onboarded, now).await
    }
}
