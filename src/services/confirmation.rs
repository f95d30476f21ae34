//! Dual confirmation
//!
//! Each party sets only its own flag. The transition to `completed` is a
//! single conditional update on `completion_date IS NULL`, so it fires once
//! no matter how many confirmations race; the caller that wins it runs
//! settlement.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::db::repositories::SessionRepository;
use crate::models::{Role, Session, SessionStatus};
use crate::services::notification::{NotificationDispatcher, NotificationEvent};
use crate::services::settlement::{SettlementOutcome, SettlementService};
use crate::services::Actor;

#[derive(Debug, thiserror::Error)]
pub enum ConfirmationError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Session is cancelled")]
    SessionCancelled,

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfirmationOutcome {
    pub session: Session,
    /// True only for the call that completed the session
    pub both_confirmed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settlement: Option<SettlementOutcome>,
    /// Completion stands but settlement needs an out-of-band retry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

pub struct ConfirmationService {
    sessions: Arc<dyn SessionRepository>,
    settlement: Arc<SettlementService>,
    notifications: NotificationDispatcher,
}

impl ConfirmationService {
    pub fn new(
        sessions: Arc<dyn SessionRepository>,
        settlement: Arc<SettlementService>,
        notifications: NotificationDispatcher,
    ) -> Self {
        Self {
            sessions,
            settlement,
            notifications,
        }
    }

    pub async fn confirm(
        &self,
        session_id: &str,
        caller_id: &str,
        role: Role,
        now: DateTime<Utc>,
    ) -> Result<ConfirmationOutcome, ConfirmationError> {
        let session = self.load(session_id).await?;
        if session.participant_id(role) != caller_id {
            return Err(ConfirmationError::Unauthorized(format!(
                "caller is not the {} of this session",
                role
            )));
        }

        match session.status {
            SessionStatus::Cancelled => return Err(ConfirmationError::SessionCancelled),
            // Re-confirming a completed session is a no-op
            SessionStatus::Completed => return Ok(Self::unchanged(session)),
            SessionStatus::Pending | SessionStatus::Confirmed => {}
        }

        if !self.sessions.set_confirmation(session_id, role, now).await? {
            // Closed between the read and the write
            let current = self.load(session_id).await?;
            return match current.status {
                SessionStatus::Cancelled => Err(ConfirmationError::SessionCancelled),
                _ => Ok(Self::unchanged(current)),
            };
        }

        if !self.sessions.mark_completed(session_id, now).await? {
            info!(session_id = %session_id, role = %role, "Confirmation recorded");
            return Ok(Self::unchanged(self.load(session_id).await?));
        }

        info!(session_id = %session_id, role = %role, "Both parties confirmed, session completed");
        let completed = self.load(session_id).await?;
        self.notifications.notify_participants(
            &completed,
            NotificationEvent::SessionCompleted,
            serde_json::json!({ "completion_date": completed.completion_date }),
        );

        let (settlement, warning) = match self.settlement.settle(session_id, &Actor::System, now).await {
            Ok(SettlementOutcome::PaymentNotYetCompleted) => (
                Some(SettlementOutcome::PaymentNotYetCompleted),
                Some("payment not yet completed; settlement will run once it is captured".to_string()),
            ),
            Ok(outcome) => (Some(outcome), None),
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Settlement failed after completion");
                (None, Some(format!("session completed but settlement failed: {}", e)))
            }
        };

        Ok(ConfirmationOutcome {
            session: completed,
            both_confirmed: true,
            settlement,
            warning,
        })
    }

    async fn load(&self, session_id: &str) -> Result<Session, ConfirmationError> {
        self.sessions
            .get_by_id(session_id)
            .await?
            .ok_or_else(|| ConfirmationError::SessionNotFound(session_id.to_string()))
    }

    fn unchanged(session: Session) -> ConfirmationOutcome {
        ConfirmationOutcome {
            session,
            both_confirmed: false,
            settlement: None,
            warning: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Cents, PaymentType, TransferStatus};
    use crate::services::notification::NotificationEvent;
    use crate::services::testing::Harness;

    #[tokio::test]
    async fn test_second_confirmation_completes_once() {
        let h = Harness::new().await;
        let session = h.seed_session("tutor-1", "student-1").await;
        h.seed_payment(&session, PaymentType::TwoStage, 10000).await;
        let service = h.confirmation();

        let first = service.confirm(&session.id, "student-1", Role::Student, Utc::now()).await.unwrap();
        assert!(!first.both_confirmed);
        assert!(first.session.student_confirmed);

        let second = service.confirm(&session.id, "tutor-1", Role::Tutor, Utc::now()).await.unwrap();
        assert!(second.both_confirmed);
        assert_eq!(second.session.status, SessionStatus::Completed);
        assert!(second.session.completion_date.is_some());
        assert!(matches!(second.settlement, Some(SettlementOutcome::Recorded(_))));
        assert!(second.warning.is_none());

        // Repeating the tutor call changes nothing
        let third = service.confirm(&session.id, "tutor-1", Role::Tutor, Utc::now()).await.unwrap();
        assert!(!third.both_confirmed);
        assert_eq!(third.session.completion_date, second.session.completion_date);

        let row = h.transfers.get_by_session(&session.id).await.unwrap().unwrap();
        assert_eq!(row.amount, Cents(8180));
        assert_eq!(row.status, TransferStatus::Pending);
    }

    #[tokio::test]
    async fn test_repeated_confirmation_is_idempotent() {
        let h = Harness::new().await;
        let session = h.seed_session("tutor-1", "student-1").await;
        let service = h.confirmation();

        let a = service.confirm(&session.id, "tutor-1", Role::Tutor, Utc::now()).await.unwrap();
        let b = service.confirm(&session.id, "tutor-1", Role::Tutor, Utc::now()).await.unwrap();
        assert!(!a.both_confirmed && !b.both_confirmed);
        assert!(b.session.tutor_confirmed);
        assert!(!b.session.student_confirmed);
        assert_eq!(b.session.status, a.session.status);
    }

    #[tokio::test]
    async fn test_concurrent_final_confirmations_complete_exactly_once() {
        let h = Harness::new().await;
        let session = h.seed_session("tutor-1", "student-1").await;
        h.seed_payment(&session, PaymentType::TwoStage, 10000).await;
        let service = Arc::new(h.confirmation());
        service.confirm(&session.id, "student-1", Role::Student, Utc::now()).await.unwrap();

        let (a, b) = tokio::join!(
            service.confirm(&session.id, "tutor-1", Role::Tutor, Utc::now()),
            service.confirm(&session.id, "student-1", Role::Student, Utc::now())
        );
        let completions = [a.unwrap(), b.unwrap()]
            .iter()
            .filter(|o| o.both_confirmed)
            .count();
        assert_eq!(completions, 1);
        assert!(h.transfers.get_by_session(&session.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unpaid_completion_warns_but_stands() {
        let h = Harness::new().await;
        let session = h.seed_session("tutor-1", "student-1").await;
        let service = h.confirmation();

        service.confirm(&session.id, "tutor-1", Role::Tutor, Utc::now()).await.unwrap();
        let done = service.confirm(&session.id, "student-1", Role::Student, Utc::now()).await.unwrap();
        assert!(done.both_confirmed);
        assert_eq!(done.session.status, SessionStatus::Completed);
        assert_eq!(done.settlement, Some(SettlementOutcome::PaymentNotYetCompleted));
        assert!(done.warning.is_some());
    }

    #[tokio::test]
    async fn test_completion_notifies_both_parties() {
        let h = Harness::new().await;
        let session = h.seed_session("tutor-1", "student-1").await;
        let service = h.confirmation();

        service.confirm(&session.id, "tutor-1", Role::Tutor, Utc::now()).await.unwrap();
        service.confirm(&session.id, "student-1", Role::Student, Utc::now()).await.unwrap();
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let sent = h.notifier.sent.lock().unwrap();
        let completed: Vec<_> = sent
            .iter()
            .filter(|n| n.event == NotificationEvent::SessionCompleted)
            .map(|n| n.user_id.as_str())
            .collect();
        assert_eq!(completed.len(), 2);
        assert!(completed.contains(&"tutor-1") && completed.contains(&"student-1"));
    }

    #[tokio::test]
    async fn test_wrong_party_rejected() {
        let h = Harness::new().await;
        let session = h.seed_session("tutor-1", "student-1").await;
        let service = h.confirmation();

        assert!(matches!(
            service.confirm(&session.id, "student-1", Role::Tutor, Utc::now()).await,
            Err(ConfirmationError::Unauthorized(_))
        ));
        assert!(matches!(
            service.confirm(&session.id, "stranger", Role::Student, Utc::now()).await,
            Err(ConfirmationError::Unauthorized(_))
        ));
        assert!(matches!(
            service.confirm("missing", "tutor-1", Role::Tutor, Utc::now()).await,
            Err(ConfirmationError::SessionNotFound(_))
        ));
        let reloaded = h.reload(&session).await;
        assert!(!reloaded.tutor_confirmed && !reloaded.student_confirmed);
    }
}
