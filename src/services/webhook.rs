//! Processor webhook ingestion
//!
//! Each event id is claimed once in `webhook_events`; a redelivery of a
//! processed event is acknowledged without touching the ledger. A failed
//! handler releases its claim so the processor's retry gets another go.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::db::repositories::{
    PaymentTransactionRepository, SessionRepository, TransitionUpdate, TutorProfileRepository,
    WebhookEventRepository,
};
use crate::models::{SessionPaymentStatus, SessionStatus, TransactionStatus};
use crate::payments::{verify_signature, Account, PaymentIntent, SignatureError, StripeEvent};
use crate::services::cancellation::{CancellationError, CancellationService};
use crate::services::settlement::SettlementService;
use crate::services::Actor;

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error("Malformed event payload: {0}")]
    MalformedPayload(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookAck {
    pub event_id: String,
    pub event_type: String,
    /// Already processed earlier; nothing was done
    pub duplicate: bool,
    /// False for event types this service ignores
    pub handled: bool,
}

pub struct WebhookService {
    events: Arc<dyn WebhookEventRepository>,
    transactions: Arc<dyn PaymentTransactionRepository>,
    sessions: Arc<dyn SessionRepository>,
    tutors: Arc<dyn TutorProfileRepository>,
    settlement: Arc<SettlementService>,
    cancellations: Arc<CancellationService>,
    secret: String,
    tolerance_seconds: i64,
}

impl WebhookService {
    pub fn new(
        events: Arc<dyn WebhookEventRepository>,
        transactions: Arc<dyn PaymentTransactionRepository>,
        sessions: Arc<dyn SessionRepository>,
        tutors: Arc<dyn TutorProfileRepository>,
        settlement: Arc<SettlementService>,
        cancellations: Arc<CancellationService>,
        secret: impl Into<String>,
        tolerance_seconds: i64,
    ) -> Self {
        Self {
            events,
            transactions,
            sessions,
            tutors,
            settlement,
            cancellations,
            secret: secret.into(),
            tolerance_seconds,
        }
    }

    pub async fn handle(
        &self,
        payload: &[u8],
        signature: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<WebhookAck, WebhookError> {
        verify_signature(payload, signature, &self.secret, self.tolerance_seconds, now.timestamp())?;
        let event: StripeEvent =
            serde_json::from_slice(payload).map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;

        let mut ack = WebhookAck {
            event_id: event.id.clone(),
            event_type: event.event_type.clone(),
            duplicate: false,
            handled: false,
        };
        if !self.events.claim(&event.id, &event.event_type, now).await? {
            info!(event_id = %event.id, event_type = %event.event_type, "Duplicate webhook event ignored");
            ack.duplicate = true;
            return Ok(ack);
        }

        match self.dispatch(&event, now).await {
            Ok(handled) => {
                ack.handled = handled;
                Ok(ack)
            }
            Err(e) => {
                if let Err(release) = self.events.release(&event.id).await {
                    warn!(event_id = %event.id, error = %release, "Failed to release webhook claim");
                }
                Err(e)
            }
        }
    }

    async fn dispatch(&self, event: &StripeEvent, now: DateTime<Utc>) -> Result<bool, WebhookError> {
        match event.event_type.as_str() {
            "payment_intent.processing" => {
                let intent = Self::object::<PaymentIntent>(event)?;
                self.on_processing(&intent, now).await
            }
            "payment_intent.succeeded" => {
                let intent = Self::object::<PaymentIntent>(event)?;
                self.on_succeeded(&intent, now).await
            }
            "payment_intent.payment_failed" | "payment_intent.canceled" => {
                let intent = Self::object::<PaymentIntent>(event)?;
                self.on_failed(&intent, now).await
            }
            "account.updated" => {
                let account = Self::object::<Account>(event)?;
                let updated = self
                    .tutors
                    .set_onboarding_by_account(&account.id, account.is_onboarded(), now)
                    .await?;
                info!(account_id = %account.id, onboarded = account.is_onboarded(), profiles = updated, "Payout account updated");
                Ok(true)
            }
            other => {
                info!(event_id = %event.id, event_type = %other, "Unhandled webhook event type");
                Ok(false)
            }
        }
    }

    fn object<T: serde::de::DeserializeOwned>(event: &StripeEvent) -> Result<T, WebhookError> {
        serde_json::from_value(event.data.object.clone())
            .map_err(|e| WebhookError::MalformedPayload(format!("{}: {}", event.event_type, e)))
    }

    async fn on_processing(&self, intent: &PaymentIntent, now: DateTime<Utc>) -> Result<bool, WebhookError> {
        let Some(tx) = self.transactions.get_by_intent_id(&intent.id).await? else {
            warn!(intent_id = %intent.id, "Webhook for unknown payment intent");
            return Ok(false);
        };
        self.transactions
            .transition_status(
                &tx.id,
                &[TransactionStatus::Pending],
                TransactionStatus::Processing,
                TransitionUpdate::default(),
                now,
            )
            .await?;
        Ok(true)
    }

    async fn on_succeeded(&self, intent: &PaymentIntent, now: DateTime<Utc>) -> Result<bool, WebhookError> {
        let Some(tx) = self.transactions.get_by_intent_id(&intent.id).await? else {
            warn!(intent_id = %intent.id, "Webhook for unknown payment intent");
            return Ok(false);
        };
        let update = TransitionUpdate {
            charge_id: intent.latest_charge.as_deref(),
            ..Default::default()
        };
        let captured = self
            .transactions
            .transition_status(
                &tx.id,
                &[TransactionStatus::Pending, TransactionStatus::Processing],
                TransactionStatus::Completed,
                update,
                now,
            )
            .await?;
        if !captured && tx.status != TransactionStatus::Completed {
            error!(transaction_id = %tx.id, status = %tx.status, "Success event for a retired transaction");
            return Ok(true);
        }
        self.sessions.mark_paid(&tx.session_id, now).await?;
        info!(
            session_id = %tx.session_id,
            transaction_id = %tx.id,
            intent_id = %intent.id,
            amount_cents = tx.amount.get(),
            "Payment captured"
        );

        // A session that finished or was cancelled before the charge
        // cleared is settled or refunded now
        let status = self.sessions.get_by_id(&tx.session_id).await?.map(|s| s.status);
        match status {
            Some(SessionStatus::Completed) => {
                if let Err(e) = self.settlement.settle(&tx.session_id, &Actor::System, now).await {
                    warn!(session_id = %tx.session_id, error = %e, "Settlement after capture failed");
                }
            }
            Some(SessionStatus::Cancelled) => match self.cancellations.refund_late_capture(&tx.session_id, now).await {
                Ok(refund) => info!(session_id = %tx.session_id, refund = ?refund, "Late capture on cancelled session handled"),
                Err(CancellationError::Internal(e)) => return Err(e.into()),
                Err(e) => warn!(session_id = %tx.session_id, error = %e, "Refund after capture skipped"),
            },
            _ => {}
        }
        Ok(true)
    }

    async fn on_failed(&self, intent: &PaymentIntent, now: DateTime<Utc>) -> Result<bool, WebhookError> {
        let Some(tx) = self.transactions.get_by_intent_id(&intent.id).await? else {
            warn!(intent_id = %intent.id, "Webhook for unknown payment intent");
            return Ok(false);
        };
        let error = intent.last_payment_error.as_ref();
        let update = TransitionUpdate {
            failure_code: error.and_then(|e| e.code.as_deref()),
            failure_message: error.and_then(|e| e.message.as_deref()),
            ..Default::default()
        };
        let failed = self
            .transactions
            .transition_status(
                &tx.id,
                &[TransactionStatus::Pending, TransactionStatus::Processing],
                TransactionStatus::Failed,
                update,
                now,
            )
            .await?;
        if failed {
            self.sessions
                .set_payment_status(&tx.session_id, SessionPaymentStatus::Failed, now)
                .await?;
            warn!(session_id = %tx.session_id, transaction_id = %tx.id, intent_id = %intent.id, "Payment failed");
        }
        Ok(true)
    }
}
