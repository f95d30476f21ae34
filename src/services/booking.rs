//! Booking
//!
//! Validates the requested slot, persists a pending session and wires up
//! its payment authorization. A session whose authorization failed stays
//! pending without a transaction; the caller retries the authorization.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{error, info};

use crate::config::PolicyConfig;
use crate::db::repositories::{SessionRepository, TutorProfileRepository};
use crate::models::{ratio_half_up, Cents, CreateBookingInput, Session};
use crate::services::notification::{NotificationDispatcher, NotificationEvent};
use crate::services::payment::{AuthorizeRequest, Authorization, PaymentError, PaymentGateway};

#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    #[error("A tutor cannot book their own session")]
    SelfBooking,

    #[error("Start time must be before end time")]
    InvalidTimeRange,

    #[error("Unsupported session duration: {0} minutes")]
    InvalidDuration(i64),

    #[error("Sessions must be booked at least {0} hours in advance")]
    LeadTimeViolation(i64),

    #[error("Sessions can be booked at most {0} days ahead")]
    BeyondHorizon(i64),

    #[error("Tutor not found: {0}")]
    TutorNotFound(String),

    #[error("Slot unavailable: {0}")]
    SlotUnavailable(String),

    #[error("Session {session_id} was created but payment setup failed: {source}")]
    PaymentSetupFailed {
        session_id: String,
        #[source]
        source: PaymentError,
    },

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct BookingOutcome {
    pub session: Session,
    pub authorization: Authorization,
}

pub struct BookingService {
    sessions: Arc<dyn SessionRepository>,
    tutors: Arc<dyn TutorProfileRepository>,
    gateway: Arc<PaymentGateway>,
    notifications: NotificationDispatcher,
    policy: PolicyConfig,
}

impl BookingService {
    pub fn new(
        sessions: Arc<dyn SessionRepository>,
        tutors: Arc<dyn TutorProfileRepository>,
        gateway: Arc<PaymentGateway>,
        notifications: NotificationDispatcher,
        policy: PolicyConfig,
    ) -> Self {
        Self {
            sessions,
            tutors,
            gateway,
            notifications,
            policy,
        }
    }

    /// Synchronous checks that need no lookups
    fn validate(&self, input: &CreateBookingInput, now: DateTime<Utc>) -> Result<i64, BookingError> {
        if input.student_id == input.tutor_id {
            return Err(BookingError::SelfBooking);
        }
        if input.start_time >= input.end_time {
            return Err(BookingError::InvalidTimeRange);
        }
        let minutes = (input.end_time - input.start_time).num_minutes();
        if !self.policy.is_duration_allowed(minutes) {
            return Err(BookingError::InvalidDuration(minutes));
        }
        if input.start_time < now + Duration::hours(self.policy.lead_time_hours) {
            return Err(BookingError::LeadTimeViolation(self.policy.lead_time_hours));
        }
        if input.start_time > now + Duration::days(self.policy.booking_horizon_days) {
            return Err(BookingError::BeyondHorizon(self.policy.booking_horizon_days));
        }
        Ok(minutes)
    }

    pub async fn create_booking(
        &self,
        input: CreateBookingInput,
        now: DateTime<Utc>,
    ) -> Result<BookingOutcome, BookingError> {
        let minutes = self.validate(&input, now)?;

        let tutor = self
            .tutors
            .get(&input.tutor_id)
            .await?
            .ok_or_else(|| BookingError::TutorNotFound(input.tutor_id.clone()))?;
        if !tutor.availability.covers(input.start_time, input.end_time) {
            return Err(BookingError::SlotUnavailable(
                "outside the tutor's weekly availability".to_string(),
            ));
        }
        if self
            .sessions
            .has_overlap(&input.tutor_id, input.start_time, input.end_time)
            .await?
        {
            return Err(BookingError::SlotUnavailable(
                "overlaps an existing session".to_string(),
            ));
        }

        let price = Cents(ratio_half_up(tutor.hourly_rate.get(), minutes, 60));
        let session = Session::new(&input, price, now);
        if !self.sessions.create(&session).await? {
            return Err(BookingError::SlotUnavailable(
                "another booking took this slot".to_string(),
            ));
        }
        info!(
            session_id = %session.id,
            tutor_id = %session.tutor_id,
            student_id = %session.student_id,
            price_cents = price.get(),
            "Session booked"
        );

        let request = AuthorizeRequest {
            session_id: session.id.clone(),
            amount: price,
            tutor_id: session.tutor_id.clone(),
            student_id: session.student_id.clone(),
            description: Some(format!("Tutoring session {}", session.id)),
        };
        let authorization = match self.gateway.authorize(request, now).await {
            Ok(a) => a,
            Err(source) => {
                error!(session_id = %session.id, error = %source, "Payment setup failed for new booking");
                return Err(BookingError::PaymentSetupFailed {
                    session_id: session.id,
                    source,
                });
            }
        };

        let session = self
            .sessions
            .get_by_id(&session.id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Session {} disappeared after booking", session.id))?;
        self.notifications.notify_participants(
            &session,
            NotificationEvent::SessionBooked,
            serde_json::json!({
                "start_time": session.start_time,
                "end_time": session.end_time,
                "price": session.price,
            }),
        );

        Ok(BookingOutcome {
            session,
            authorization,
        })
    }
}
