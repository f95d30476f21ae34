//! Payment authorization gateway
//!
//! Creates at most one live processor authorization per session and keeps a
//! local ledger row mirroring it. Tutors with an onboarded payout account
//! get a direct charge (destination + application fee); everyone else gets
//! a two-stage charge that the platform pays out later.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::PolicyConfig;
use crate::db::repositories::{
    PaymentTransactionRepository, SessionRepository, TransitionUpdate, TutorProfileRepository,
};
use crate::models::{
    Cents, PaymentTransaction, PaymentType, Session, SessionPaymentStatus, SessionStatus,
    TransactionStatus,
};
use crate::payments::{CreateIntentParams, DynPaymentProcessor, IntentStatus, PaymentIntent, ProcessorError};
use crate::services::policy::application_fee;

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Session is {0} and cannot be paid")]
    SessionClosed(SessionStatus),

    #[error("Session is already paid")]
    AlreadyPaid,

    #[error("Payment authorization failed: {0}")]
    AuthorizationFailed(#[source] ProcessorError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct AuthorizeRequest {
    pub session_id: String,
    pub amount: Cents,
    pub tutor_id: String,
    pub student_id: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Authorization {
    pub intent_id: String,
    pub client_secret: Option<String>,
    pub transaction_id: String,
    pub payment_type: PaymentType,
    pub amount: Cents,
    /// An existing live authorization was returned instead of a new one
    pub reused: bool,
}

/// How the tutor gets paid for this charge
enum PaymentPath {
    Direct { destination: String, fee: Cents },
    TwoStage { fee: Cents },
}

pub struct PaymentGateway {
    sessions: Arc<dyn SessionRepository>,
    transactions: Arc<dyn PaymentTransactionRepository>,
    tutors: Arc<dyn TutorProfileRepository>,
    processor: DynPaymentProcessor,
    policy: PolicyConfig,
    currency: String,
}

impl PaymentGateway {
    pub fn new(
        sessions: Arc<dyn SessionRepository>,
        transactions: Arc<dyn PaymentTransactionRepository>,
        tutors: Arc<dyn TutorProfileRepository>,
        processor: DynPaymentProcessor,
        policy: PolicyConfig,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            sessions,
            transactions,
            tutors,
            processor,
            policy,
            currency: currency.into(),
        }
    }

    pub async fn authorize(&self, req: AuthorizeRequest, now: DateTime<Utc>) -> Result<Authorization, PaymentError> {
        if !req.amount.is_positive() {
            return Err(PaymentError::InvalidAmount(format!(
                "amount must be positive minor units, got {}",
                req.amount
            )));
        }

        let session = self
            .sessions
            .get_by_id(&req.session_id)
            .await?
            .ok_or_else(|| PaymentError::SessionNotFound(req.session_id.clone()))?;
        if session.tutor_id != req.tutor_id || session.student_id != req.student_id {
            return Err(PaymentError::Unauthorized(
                "tutor and student do not match the session".to_string(),
            ));
        }
        if !session.status.is_open() {
            return Err(PaymentError::SessionClosed(session.status));
        }

        if self.transactions.find_completed_by_session(&session.id).await?.is_some() {
            return Err(PaymentError::AlreadyPaid);
        }

        if let Some(live) = self.transactions.find_live_by_session(&session.id).await? {
            if let Some(existing) = self.reuse_live(&live, now).await? {
                return Ok(existing);
            }
        }

        let path = self.choose_path(&session, req.amount).await;
        let attempt = self.transactions.count_by_session(&session.id).await?;
        let idempotency_key = format!("authorize:{}:{}", session.id, attempt);

        let mut metadata = BTreeMap::new();
        metadata.insert("session_id".to_string(), session.id.clone());
        metadata.insert("tutor_id".to_string(), session.tutor_id.clone());
        metadata.insert("student_id".to_string(), session.student_id.clone());

        let (destination, application_fee, payment_type, fee) = match &path {
            PaymentPath::Direct { destination, fee } => {
                (Some(destination.clone()), Some(*fee), PaymentType::ConnectDirect, *fee)
            }
            PaymentPath::TwoStage { fee } => (None, None, PaymentType::TwoStage, *fee),
        };

        let params = CreateIntentParams {
            amount: req.amount,
            currency: self.currency.clone(),
            description: req.description.clone(),
            destination,
            application_fee,
            metadata,
            idempotency_key: idempotency_key.clone(),
        };

        let intent = self.processor.create_payment_intent(&params).await.map_err(|e| {
            error!(
                session_id = %session.id,
                amount_cents = req.amount.get(),
                idempotency_key = %idempotency_key,
                error = %e,
                "Payment authorization failed"
            );
            PaymentError::AuthorizationFailed(e)
        })?;

        let tx = PaymentTransaction {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session.id.clone(),
            student_id: session.student_id.clone(),
            tutor_id: session.tutor_id.clone(),
            amount: req.amount,
            currency: self.currency.clone(),
            status: TransactionStatus::Pending,
            payment_intent_id: intent.id.clone(),
            charge_id: None,
            platform_fee: fee,
            payment_type,
            requires_transfer: payment_type == PaymentType::TwoStage,
            transfer_id: None,
            failure_code: None,
            failure_message: None,
            created_at: now,
            updated_at: now,
        };

        if !self.transactions.create(&tx).await? {
            // A concurrent request recorded its authorization first
            let winner = self
                .transactions
                .find_live_by_session(&session.id)
                .await?
                .or(self.transactions.get_by_intent_id(&intent.id).await?)
                .ok_or_else(|| anyhow::anyhow!("Live transaction vanished after unique violation"))?;
            warn!(session_id = %session.id, transaction_id = %winner.id, "Concurrent authorization, reusing existing transaction");
            let intent = if winner.payment_intent_id == intent.id {
                intent
            } else {
                self.retrieve_intent(&winner.payment_intent_id).await?
            };
            return Ok(Authorization {
                intent_id: intent.id,
                client_secret: intent.client_secret,
                transaction_id: winner.id,
                payment_type: winner.payment_type,
                amount: winner.amount,
                reused: true,
            });
        }

        self.sessions
            .set_payment_status(&session.id, SessionPaymentStatus::Authorized, now)
            .await?;

        info!(
            session_id = %session.id,
            transaction_id = %tx.id,
            intent_id = %intent.id,
            amount_cents = req.amount.get(),
            payment_type = %payment_type,
            idempotency_key = %idempotency_key,
            "Payment authorized"
        );

        Ok(Authorization {
            intent_id: intent.id,
            client_secret: intent.client_secret,
            transaction_id: tx.id,
            payment_type,
            amount: req.amount,
            reused: false,
        })
    }

    async fn retrieve_intent(&self, intent_id: &str) -> Result<PaymentIntent, PaymentError> {
        self.processor
            .retrieve_payment_intent(intent_id)
            .await
            .map_err(PaymentError::AuthorizationFailed)
    }

    /// Decide what to do with a live transaction: hand it back, report the
    /// session as paid, or supersede it so a fresh one can be created.
    async fn reuse_live(
        &self,
        live: &PaymentTransaction,
        now: DateTime<Utc>,
    ) -> Result<Option<Authorization>, PaymentError> {
        let intent = self.retrieve_intent(&live.payment_intent_id).await?;

        if intent.status.is_usable() || intent.status.is_in_flight() {
            info!(
                session_id = %live.session_id,
                transaction_id = %live.id,
                intent_id = %intent.id,
                "Reusing live authorization"
            );
            return Ok(Some(Authorization {
                intent_id: intent.id,
                client_secret: intent.client_secret,
                transaction_id: live.id.clone(),
                payment_type: live.payment_type,
                amount: live.amount,
                reused: true,
            }));
        }

        if intent.status == IntentStatus::Succeeded {
            // The success webhook has not arrived yet
            let update = TransitionUpdate {
                charge_id: intent.latest_charge.as_deref(),
                ..Default::default()
            };
            self.transactions
                .transition_status(
                    &live.id,
                    &[TransactionStatus::Pending, TransactionStatus::Processing],
                    TransactionStatus::Completed,
                    update,
                    now,
                )
                .await?;
            self.sessions.mark_paid(&live.session_id, now).await?;
            return Err(PaymentError::AlreadyPaid);
        }

        let update = TransitionUpdate {
            failure_code: Some("superseded"),
            failure_message: Some("authorization no longer usable"),
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
        warn!(
            session_id = %live.session_id,
            transaction_id = %live.id,
            intent_status = ?intent.status,
            "Superseding unusable authorization"
        );
        Ok(None)
    }

    /// Direct charge when the tutor's payout account is onboarded,
    /// otherwise two-stage. A missing payout profile is not an error.
    async fn choose_path(&self, session: &Session, amount: Cents) -> PaymentPath {
        let fee = application_fee(amount, &self.policy);

        let account_id = match self.tutors.get(&session.tutor_id).await {
            Ok(Some(profile)) => profile.payout_account_id,
            Ok(None) => None,
            Err(e) => {
                warn!(tutor_id = %session.tutor_id, error = %e, "Tutor profile lookup failed");
                None
            }
        };
        let Some(account_id) = account_id else {
            info!(tutor_id = %session.tutor_id, "Tutor payout not configured, using two-stage payment");
            return PaymentPath::TwoStage { fee };
        };

        match self.processor.retrieve_account(&account_id).await {
            Ok(account) if account.is_onboarded() => PaymentPath::Direct {
                destination: account.id,
                fee,
            },
            Ok(_) => {
                info!(tutor_id = %session.tutor_id, account_id = %account_id, "Payout account not onboarded, using two-stage payment");
                PaymentPath::TwoStage { fee }
            }
            Err(e) => {
                warn!(tutor_id = %session.tutor_id, account_id = %account_id, error = %e, "Payout account lookup failed, using two-stage payment");
                PaymentPath::TwoStage { fee }
            }
        }
    }
}
