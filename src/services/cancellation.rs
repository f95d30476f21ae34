//! Cancellation and refunds
//!
//! The cancellation itself is recorded first and always stands. Refund,
//! intent cancellation, meeting teardown and notifications follow; only
//! the refund outcome is reported back, the rest is best-effort.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::PolicyConfig;
use crate::db::repositories::{
    CancellationRecord, PaymentTransactionRepository, PendingTransferRepository, SessionRepository,
    TransitionUpdate,
};
use crate::models::{
    Cents, PaymentTransaction, PaymentType, PendingTransfer, RefundStatus, Role, Session,
    SessionPaymentStatus, SessionStatus, TransactionStatus, TransferStatus,
};
use crate::payments::{DynPaymentProcessor, IntentStatus, RefundParams};
use crate::services::meeting::{room_name_from_url, MeetingProvider};
use crate::services::notification::{NotificationDispatcher, NotificationEvent};
use crate::services::policy::{hours_before_session, refund_split, RefundSplit};

#[derive(Debug, thiserror::Error)]
pub enum CancellationError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Session is already cancelled")]
    AlreadyCancelled,

    #[error("Completed sessions cannot be cancelled")]
    CannotCancelCompleted,

    #[error("Refund cannot be retried: {0}")]
    RefundNotRetryable(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// What happened to the money after the cancellation was recorded
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RefundOutcome {
    NotRequired,
    Processed {
        refund_id: String,
    },
    /// Cancellation stands; retry through the admin refund endpoint
    Failed {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct CancellationOutcome {
    pub session: Session,
    pub cancelled_by_role: Role,
    pub hours_before_session: i64,
    pub refund_amount: Cents,
    pub tutor_payout: Cents,
    pub refund: RefundOutcome,
}

pub struct CancellationService {
    sessions: Arc<dyn SessionRepository>,
    transactions: Arc<dyn PaymentTransactionRepository>,
    transfers: Arc<dyn PendingTransferRepository>,
    processor: DynPaymentProcessor,
    meetings: Arc<dyn MeetingProvider>,
    notifications: NotificationDispatcher,
    policy: PolicyConfig,
}

impl CancellationService {
    pub fn new(
        sessions: Arc<dyn SessionRepository>,
        transactions: Arc<dyn PaymentTransactionRepository>,
        transfers: Arc<dyn PendingTransferRepository>,
        processor: DynPaymentProcessor,
        meetings: Arc<dyn MeetingProvider>,
        notifications: NotificationDispatcher,
        policy: PolicyConfig,
    ) -> Self {
        Self {
            sessions,
            transactions,
            transfers,
            processor,
            meetings,
            notifications,
            policy,
        }
    }

    pub async fn cancel(
        &self,
        session_id: &str,
        caller_id: &str,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<CancellationOutcome, CancellationError> {
        let session = self.load(session_id).await?;
        let role = session
            .role_of(caller_id)
            .ok_or_else(|| CancellationError::Unauthorized("only session participants can cancel".to_string()))?;
        Self::ensure_cancellable(session.status)?;

        let hours = hours_before_session(session.start_time, now);
        let paid = self.transactions.find_completed_by_session(session_id).await?;
        let split = refund_split(role, hours, paid.as_ref().map(|tx| tx.amount).unwrap_or(Cents::ZERO));

        let record = CancellationRecord {
            cancelled_by: caller_id.to_string(),
            role,
            cancelled_at: now,
            reason: reason.filter(|r| !r.trim().is_empty()),
            hours_before_session: hours,
            refund_amount: split.refund,
            refund_status: if split.refund.is_positive() {
                RefundStatus::Pending
            } else {
                RefundStatus::NotRequired
            },
        };
        if !self.sessions.mark_cancelled(session_id, &record).await? {
            // Lost a race with another cancellation or the completion
            let current = self.load(session_id).await?;
            Self::ensure_cancellable(current.status)?;
            return Err(anyhow::anyhow!("Session {} could not be cancelled", session_id).into());
        }

        info!(
            session_id = %session_id,
            cancelled_by = %caller_id,
            role = %role,
            hours_before_session = hours,
            refund_cents = split.refund.get(),
            tutor_payout_cents = split.tutor_payout.get(),
            "Session cancelled"
        );

        let refund = match &paid {
            Some(tx) => self.settle_paid(&session, tx, &split, caller_id, now).await?,
            None => {
                self.abandon_live_authorization(session_id, now).await?;
                RefundOutcome::NotRequired
            }
        };

        self.teardown_meeting(&session).await;
        self.notifications.notify_participants(
            &session,
            NotificationEvent::SessionCancelled,
            serde_json::json!({
                "cancelled_by_role": role,
                "hours_before_session": hours,
                "refund_amount": split.refund,
            }),
        );

        Ok(CancellationOutcome {
            session: self.load(session_id).await?,
            cancelled_by_role: role,
            hours_before_session: hours,
            refund_amount: split.refund,
            tutor_payout: split.tutor_payout,
            refund,
        })
    }

    /// A charge that cleared after its session was cancelled is split by the
    /// cancellation's recorded role and notice.
    pub async fn refund_late_capture(&self, session_id: &str, now: DateTime<Utc>) -> Result<RefundOutcome, CancellationError> {
        let session = self.load(session_id).await?;
        if session.status != SessionStatus::Cancelled {
            return Err(CancellationError::RefundNotRetryable(format!("session is {}", session.status)));
        }
        if session.refund_status == Some(RefundStatus::Processed) {
            return Ok(RefundOutcome::Processed {
                refund_id: session.refund_id.clone().unwrap_or_default(),
            });
        }
        let role = session
            .cancelled_by_role
            .ok_or_else(|| CancellationError::RefundNotRetryable("cancellation details missing".to_string()))?;
        let tx = self
            .transactions
            .find_completed_by_session(session_id)
            .await?
            .ok_or_else(|| CancellationError::RefundNotRetryable("no captured payment".to_string()))?;

        let split = refund_split(role, session.hours_before_session.unwrap_or(0), tx.amount);
        let status = if split.refund.is_positive() {
            RefundStatus::Pending
        } else {
            RefundStatus::NotRequired
        };
        self.sessions.set_refund_amount(session_id, split.refund, status, now).await?;
        warn!(
            session_id = %session_id,
            transaction_id = %tx.id,
            refund_cents = split.refund.get(),
            "Payment captured after cancellation"
        );

        let canceller = session.cancelled_by.clone().unwrap_or_default();
        self.settle_paid(&session, &tx, &split, &canceller, now).await
    }

    /// Re-attempt a refund with the original idempotency key. A `pending`
    /// status covers a refund whose outcome never got recorded.
    pub async fn retry_refund(&self, session_id: &str, now: DateTime<Utc>) -> Result<CancellationOutcome, CancellationError> {
        let session = self.load(session_id).await?;
        if !matches!(session.refund_status, Some(RefundStatus::Failed | RefundStatus::Pending)) {
            return Err(CancellationError::RefundNotRetryable(format!(
                "refund status is {}",
                session
                    .refund_status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "unset".to_string())
            )));
        }
        let (Some(amount), Some(role)) = (session.refund_amount, session.cancelled_by_role) else {
            return Err(CancellationError::RefundNotRetryable("cancellation details missing".to_string()));
        };
        let tx = self
            .transactions
            .find_completed_by_session(session_id)
            .await?
            .ok_or_else(|| CancellationError::RefundNotRetryable("no captured payment".to_string()))?;

        let canceller = session.cancelled_by.clone().unwrap_or_default();
        let refund = self.issue_refund(&session, &tx, amount, &canceller, now).await?;

        Ok(CancellationOutcome {
            session: self.load(session_id).await?,
            cancelled_by_role: role,
            hours_before_session: session.hours_before_session.unwrap_or(0),
            refund_amount: amount,
            tutor_payout: Cents(tx.amount.get() - amount.get()),
            refund,
        })
    }

    /// Refund the student's share of a captured payment and, for two-stage
    /// funds, owe the tutor the rest
    async fn settle_paid(
        &self,
        session: &Session,
        tx: &PaymentTransaction,
        split: &RefundSplit,
        cancelled_by: &str,
        now: DateTime<Utc>,
    ) -> Result<RefundOutcome, CancellationError> {
        let refund = if split.refund.is_positive() {
            self.issue_refund(session, tx, split.refund, cancelled_by, now).await?
        } else {
            self.sessions
                .set_refund_outcome(&session.id, RefundStatus::NotRequired, None, None, now)
                .await?;
            RefundOutcome::NotRequired
        };

        if tx.payment_type == PaymentType::TwoStage && split.tutor_payout.is_positive() {
            self.record_kept_share(tx, split.tutor_payout, now).await?;
        }
        Ok(refund)
    }

    async fn issue_refund(
        &self,
        session: &Session,
        tx: &PaymentTransaction,
        amount: Cents,
        cancelled_by: &str,
        now: DateTime<Utc>,
    ) -> Result<RefundOutcome, CancellationError> {
        let direct = tx.payment_type == PaymentType::ConnectDirect;
        let mut metadata = BTreeMap::new();
        metadata.insert("session_id".to_string(), session.id.clone());
        metadata.insert("cancelled_by".to_string(), cancelled_by.to_string());

        let params = RefundParams {
            payment_intent: tx.payment_intent_id.clone(),
            amount,
            reverse_transfer: direct,
            refund_application_fee: direct,
            metadata,
            idempotency_key: format!("refund:{}", session.id),
        };

        match self.processor.create_refund(&params).await {
            Ok(refund) => {
                let payment_status = if amount >= tx.amount {
                    SessionPaymentStatus::Refunded
                } else {
                    SessionPaymentStatus::PartiallyRefunded
                };
                // The money has moved; a bookkeeping failure leaves the status
                // pending for retry_refund to reconcile
                if let Err(e) = self
                    .sessions
                    .set_refund_outcome(&session.id, RefundStatus::Processed, Some(&refund.id), Some(payment_status), now)
                    .await
                {
                    error!(session_id = %session.id, refund_id = %refund.id, error = %e, "Failed to record processed refund");
                }
                info!(
                    session_id = %session.id,
                    refund_id = %refund.id,
                    amount_cents = amount.get(),
                    idempotency_key = %params.idempotency_key,
                    "Refund processed"
                );
                Ok(RefundOutcome::Processed { refund_id: refund.id })
            }
            Err(e) => {
                error!(
                    session_id = %session.id,
                    amount_cents = amount.get(),
                    idempotency_key = %params.idempotency_key,
                    error = %e,
                    "Refund failed"
                );
                self.sessions
                    .set_refund_outcome(&session.id, RefundStatus::Failed, None, None, now)
                    .await?;
                Ok(RefundOutcome::Failed {
                    message: e.message(),
                    code: e.code().map(str::to_string),
                })
            }
        }
    }

    /// An unpaid authorization is cancelled at the processor and retired
    /// locally. An intent the processor still holds open keeps its live
    /// transaction, so a later success event can refund it.
    async fn abandon_live_authorization(&self, session_id: &str, now: DateTime<Utc>) -> anyhow::Result<()> {
        let Some(live) = self.transactions.find_live_by_session(session_id).await? else {
            return Ok(());
        };
        if let Err(e) = self.processor.cancel_payment_intent(&live.payment_intent_id).await {
            let canceled = match self.processor.retrieve_payment_intent(&live.payment_intent_id).await {
                Ok(intent) => intent.status == IntentStatus::Canceled,
                Err(_) => false,
            };
            if !canceled {
                error!(
                    session_id = %session_id,
                    transaction_id = %live.id,
                    intent_id = %live.payment_intent_id,
                    error = %e,
                    "Failed to cancel payment intent, transaction left live"
                );
                return Ok(());
            }
        }
        let update = TransitionUpdate {
            failure_code: Some("session_cancelled"),
            failure_message: Some("session cancelled before payment"),
            ..Default::default()
        };
        self.transactions
            .transition_status(
                &live.id,
                &[TransactionStatus::Pending, TransactionStatus::Processing],
                TransactionStatus::Failed,
                update,
                now,
            )
            .await?;
        Ok(())
    }

    /// Two-stage funds sit with the platform; owe the tutor their kept share
    async fn record_kept_share(&self, tx: &PaymentTransaction, payout: Cents, now: DateTime<Utc>) -> anyhow::Result<()> {
        let platform_fee = payout.apply_bps(self.policy.platform_fee_bps);
        let row = PendingTransfer {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: tx.session_id.clone(),
            tutor_id: tx.tutor_id.clone(),
            student_id: tx.student_id.clone(),
            amount: Cents(payout.get() - platform_fee.get()),
            platform_fee,
            processor_fee: Cents::ZERO,
            status: TransferStatus::Pending,
            payment_transaction_id: tx.id.clone(),
            transfer_id: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        if self.transfers.create(&row).await? {
            info!(session_id = %tx.session_id, pending_transfer_id = %row.id, amount_cents = row.amount.get(), "Late cancellation payout recorded");
        }
        Ok(())
    }

    async fn teardown_meeting(&self, session: &Session) {
        let Some(room) = session.meeting_url.as_deref().and_then(room_name_from_url) else {
            return;
        };
        if let Err(e) = self.meetings.teardown(room).await {
            warn!(session_id = %session.id, room = %room, error = %e, "Meeting teardown failed");
        }
    }

    async fn load(&self, session_id: &str) -> Result<Session, CancellationError> {
        self.sessions
            .get_by_id(session_id)
            .await?
            .ok_or_else(|| CancellationError::SessionNotFound(session_id.to_string()))
    }

    fn ensure_cancellable(status: SessionStatus) -> Result<(), CancellationError> {
        match status {
            SessionStatus::Cancelled => Err(CancellationError::AlreadyCancelled),
            SessionStatus::Completed => Err(CancellationError::CannotCancelCompleted),
            SessionStatus::Pending | SessionStatus::Confirmed => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::testing::{declined_error, FakeOp};
    use crate::services::payment::AuthorizeRequest;
    use crate::services::testing::Harness;
    use chrono::Duration;

    async fn paid_session_starting_in(h: &Harness, hours: i64, payment_type: PaymentType) -> Session {
        let start = Utc::now() + Duration::hours(hours) + Duration::minutes(30);
        let session = h.seed_session_at("tutor-1", "student-1", start).await;
        h.seed_payment(&session, payment_type, 10000).await;
        session
    }

    #[tokio::test]
    async fn test_refund_table_applied_to_paid_amount() {
        let cases = [
            (Role::Student, 30, 10000, 0),
            (Role::Student, 10, 5000, 5000),
            (Role::Student, 1, 0, 10000),
            (Role::Tutor, 1, 10000, 0),
        ];
        for (role, hours, refund, payout) in cases {
            let h = Harness::new().await;
            let session = paid_session_starting_in(&h, hours, PaymentType::ConnectDirect).await;
            let caller = session.participant_id(role).to_string();

            let outcome = h.cancellation().cancel(&session.id, &caller, None, Utc::now()).await.unwrap();
            assert_eq!(outcome.hours_before_session, hours);
            assert_eq!(outcome.refund_amount, Cents(refund), "{:?} at {}h", role, hours);
            assert_eq!(outcome.tutor_payout, Cents(payout), "{:?} at {}h", role, hours);
            assert_eq!(outcome.session.status, SessionStatus::Cancelled);
        }
    }

    #[tokio::test]
    async fn test_full_refund_on_direct_charge_reverses_transfer() {
        let h = Harness::new().await;
        let session = paid_session_starting_in(&h, 30, PaymentType::ConnectDirect).await;

        let outcome = h
            .cancellation()
            .cancel(&session.id, "student-1", Some("conflict".into()), Utc::now())
            .await
            .unwrap();
        let RefundOutcome::Processed { refund_id } = &outcome.refund else {
            panic!("expected processed refund, got {:?}", outcome.refund);
        };

        let requests = h.processor.refund_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].amount, Cents(10000));
        assert!(requests[0].reverse_transfer && requests[0].refund_application_fee);
        assert_eq!(requests[0].idempotency_key, format!("refund:{}", session.id));

        assert_eq!(outcome.session.refund_status, Some(RefundStatus::Processed));
        assert_eq!(outcome.session.refund_id.as_deref(), Some(refund_id.as_str()));
        assert_eq!(outcome.session.payment_status, SessionPaymentStatus::Refunded);
        assert_eq!(outcome.session.cancellation_reason.as_deref(), Some("conflict"));
    }

    #[tokio::test]
    async fn test_refund_failure_does_not_block_cancellation() {
        let h = Harness::new().await;
        let session = paid_session_starting_in(&h, 10, PaymentType::ConnectDirect).await;
        h.processor.fail(FakeOp::CreateRefund, declined_error(), Some(1));

        let outcome = h.cancellation().cancel(&session.id, "student-1", None, Utc::now()).await.unwrap();
        assert!(matches!(outcome.refund, RefundOutcome::Failed { .. }));
        assert_eq!(outcome.session.status, SessionStatus::Cancelled);
        assert_eq!(outcome.session.refund_amount, Some(Cents(5000)));
        assert_eq!(outcome.session.refund_status, Some(RefundStatus::Failed));

        let retried = h.cancellation().retry_refund(&session.id, Utc::now()).await.unwrap();
        assert!(matches!(retried.refund, RefundOutcome::Processed { .. }));
        assert_eq!(retried.session.payment_status, SessionPaymentStatus::PartiallyRefunded);
        let keys: Vec<_> = h.processor.refund_requests().into_iter().map(|r| r.idempotency_key).collect();
        assert_eq!(keys, vec![format!("refund:{}", session.id)]);

        assert!(matches!(
            h.cancellation().retry_refund(&session.id, Utc::now()).await,
            Err(CancellationError::RefundNotRetryable(_))
        ));
    }

    #[tokio::test]
    async fn test_two_stage_late_cancel_records_tutor_share() {
        let h = Harness::new().await;
        let session = paid_session_starting_in(&h, 10, PaymentType::TwoStage).await;

        let outcome = h.cancellation().cancel(&session.id, "student-1", None, Utc::now()).await.unwrap();
        assert_eq!(outcome.tutor_payout, Cents(5000));
        let requests = h.processor.refund_requests();
        assert!(!requests[0].reverse_transfer);

        let row = h.transfers.get_by_session(&session.id).await.unwrap().unwrap();
        assert_eq!(row.platform_fee, Cents(750));
        assert_eq!(row.amount, Cents(4250));
        assert_eq!(row.status, TransferStatus::Pending);
    }

    #[tokio::test]
    async fn test_unpaid_session_cancels_live_authorization() {
        let h = Harness::new().await;
        let session = h.seed_session("tutor-1", "student-1").await;
        let auth = h
            .gateway()
            .authorize(
                AuthorizeRequest {
                    session_id: session.id.clone(),
                    amount: Cents(10000),
                    tutor_id: "tutor-1".into(),
                    student_id: "student-1".into(),
                    description: None,
                },
                Utc::now(),
            )
            .await
            .unwrap();

        let outcome = h.cancellation().cancel(&session.id, "tutor-1", None, Utc::now()).await.unwrap();
        assert_eq!(outcome.refund, RefundOutcome::NotRequired);
        assert_eq!(outcome.refund_amount, Cents::ZERO);
        assert!(h.processor.refund_requests().is_empty());

        let tx = h.transactions.get_by_id(&auth.transaction_id).await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Failed);
        assert_eq!(
            h.processor.intent(&auth.intent_id).unwrap().status,
            crate::payments::IntentStatus::Canceled
        );
    }

    async fn authorized(h: &Harness) -> (Session, crate::services::payment::Authorization) {
        let session = h.seed_session("tutor-1", "student-1").await;
        let auth = h
            .gateway()
            .authorize(
                AuthorizeRequest {
                    session_id: session.id.clone(),
                    amount: Cents(10000),
                    tutor_id: "tutor-1".into(),
                    student_id: "student-1".into(),
                    description: None,
                },
                Utc::now(),
            )
            .await
            .unwrap();
        (session, auth)
    }

    #[tokio::test]
    async fn test_failed_intent_cancel_keeps_transaction_live() {
        let h = Harness::new().await;
        let (session, auth) = authorized(&h).await;
        h.processor.fail(FakeOp::CancelIntent, declined_error(), None);

        let outcome = h.cancellation().cancel(&session.id, "tutor-1", None, Utc::now()).await.unwrap();
        assert_eq!(outcome.session.status, SessionStatus::Cancelled);
        assert_eq!(outcome.refund, RefundOutcome::NotRequired);

        let tx = h.transactions.get_by_id(&auth.transaction_id).await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Pending);
        assert!(tx.failure_code.is_none());
    }

    #[tokio::test]
    async fn test_intent_already_canceled_is_retired_despite_error() {
        let h = Harness::new().await;
        let (session, auth) = authorized(&h).await;
        h.processor.set_intent_status(&auth.intent_id, IntentStatus::Canceled);
        h.processor.fail(FakeOp::CancelIntent, declined_error(), None);

        h.cancellation().cancel(&session.id, "tutor-1", None, Utc::now()).await.unwrap();
        let tx = h.transactions.get_by_id(&auth.transaction_id).await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Failed);
        assert_eq!(tx.failure_code.as_deref(), Some("session_cancelled"));
    }

    #[tokio::test]
    async fn test_refund_reported_when_bookkeeping_fails() {
        let h = Harness::new().await;
        let session = paid_session_starting_in(&h, 30, PaymentType::ConnectDirect).await;
        h.pool
            .execute(
                "CREATE TRIGGER refund_bookkeeping_down BEFORE UPDATE OF refund_id ON sessions \
                 WHEN NEW.refund_id IS NOT NULL BEGIN SELECT RAISE(ABORT, 'refund bookkeeping unavailable'); END",
            )
            .await
            .unwrap();

        let outcome = h.cancellation().cancel(&session.id, "student-1", None, Utc::now()).await.unwrap();
        let RefundOutcome::Processed { refund_id } = outcome.refund else {
            panic!("expected a processed refund, got {:?}", outcome.refund);
        };
        assert_eq!(h.processor.refund_requests().len(), 1);
        assert_eq!(outcome.session.refund_status, Some(RefundStatus::Pending));

        // Once storage recovers the retry reconciles onto the same refund
        h.pool.execute("DROP TRIGGER refund_bookkeeping_down").await.unwrap();
        let retried = h.cancellation().retry_refund(&session.id, Utc::now()).await.unwrap();
        assert_eq!(retried.refund, RefundOutcome::Processed { refund_id: refund_id.clone() });
        assert_eq!(retried.session.refund_status, Some(RefundStatus::Processed));
        assert_eq!(retried.session.refund_id.as_deref(), Some(refund_id.as_str()));
        let keys: Vec<_> = h.processor.refund_requests().into_iter().map(|r| r.idempotency_key).collect();
        assert_eq!(keys, vec![format!("refund:{}", session.id); 2]);
    }

    #[tokio::test]
    async fn test_guards() {
        let h = Harness::new().await;
        let session = h.seed_session("tutor-1", "student-1").await;
        let service = h.cancellation();

        assert!(matches!(
            service.cancel(&session.id, "stranger", None, Utc::now()).await,
            Err(CancellationError::Unauthorized(_))
        ));
        service.cancel(&session.id, "student-1", None, Utc::now()).await.unwrap();
        assert!(matches!(
            service.cancel(&session.id, "tutor-1", None, Utc::now()).await,
            Err(CancellationError::AlreadyCancelled)
        ));

        let other = h.seed_session("tutor-1", "student-1").await;
        h.complete(&other).await;
        assert!(matches!(
            service.cancel(&other.id, "student-1", None, Utc::now()).await,
            Err(CancellationError::CannotCancelCompleted)
        ));
    }
}
