//! Settlement engine
//!
//! `settle` records the tutor's payout obligation for a completed, paid
//! session exactly once (unique `session_id` on pending transfers).
//! `execute_transfers` moves the money for two-stage payments and is safe
//! to re-run: rows only leave `pending` through a conditional update, and
//! each processor transfer carries a per-row idempotency key.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::PolicyConfig;
use crate::db::repositories::{
    PaymentTransactionRepository, PendingTransferRepository, SessionRepository, TutorProfileRepository,
};
use crate::models::{
    Cents, PaymentTransaction, PaymentType, PendingTransfer, SessionStatus, TransferStatus,
};
use crate::payments::{DynPaymentProcessor, ProcessorError, TransferParams};
use crate::services::policy::{compute_fees, FeesExceedAmount};
use crate::services::Actor;

#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Session is {0}; only completed sessions settle")]
    SessionNotCompleted(SessionStatus),

    #[error(transparent)]
    FeesExceedAmount(#[from] FeesExceedAmount),

    #[error("Tutor payout not configured: {0}")]
    TutorPayoutNotConfigured(String),

    #[error("Pending transfer not found: {0}")]
    TransferNotFound(String),

    #[error("Transfer is {0}; only failed transfers can be retried")]
    TransferNotFailed(TransferStatus),

    #[error("Payment processor error: {0}")]
    Processor(#[source] ProcessorError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SettlementOutcome {
    /// This call recorded the payout
    Recorded(PendingTransfer),
    /// An earlier call already recorded it
    AlreadySettled(PendingTransfer),
    /// The charge has not been captured yet; try again after it is
    PaymentNotYetCompleted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferFailure {
    pub pending_transfer_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransferReport {
    pub tutor_id: String,
    /// Rows paid out and verified
    pub completed: Vec<PendingTransfer>,
    /// Rows the processor rejected, kept for operator review
    pub failed: Vec<TransferFailure>,
    /// Rows left pending after a transient error
    pub deferred: Vec<String>,
}

pub struct SettlementService {
    sessions: Arc<dyn SessionRepository>,
    transactions: Arc<dyn PaymentTransactionRepository>,
    transfers: Arc<dyn PendingTransferRepository>,
    tutors: Arc<dyn TutorProfileRepository>,
    processor: DynPaymentProcessor,
    policy: PolicyConfig,
    currency: String,
}

impl SettlementService {
    pub fn new(
        sessions: Arc<dyn SessionRepository>,
        transactions: Arc<dyn PaymentTransactionRepository>,
        transfers: Arc<dyn PendingTransferRepository>,
        tutors: Arc<dyn TutorProfileRepository>,
        processor: DynPaymentProcessor,
        policy: PolicyConfig,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            sessions,
            transactions,
            transfers,
            tutors,
            processor,
            policy,
            currency: currency.into(),
        }
    }

    pub async fn settle(
        &self,
        session_id: &str,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<SettlementOutcome, SettlementError> {
        let session = self
            .sessions
            .get_by_id(session_id)
            .await?
            .ok_or_else(|| SettlementError::SessionNotFound(session_id.to_string()))?;
        if let Actor::User(user_id) = actor {
            if !session.is_participant(user_id) {
                return Err(SettlementError::Unauthorized(
                    "only session participants can settle".to_string(),
                ));
            }
        }
        if session.status != SessionStatus::Completed {
            return Err(SettlementError::SessionNotCompleted(session.status));
        }

        if let Some(existing) = self.transfers.get_by_session(session_id).await? {
            return Ok(SettlementOutcome::AlreadySettled(existing));
        }

        let Some(tx) = self.transactions.find_completed_by_session(session_id).await? else {
            info!(session_id = %session_id, "Payment not yet completed, settlement deferred");
            return Ok(SettlementOutcome::PaymentNotYetCompleted);
        };

        let transfer = self.ledger_row(&tx, now)?;
        if !self.transfers.create(&transfer).await? {
            let existing = self
                .transfers
                .get_by_session(session_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("Pending transfer vanished after unique violation"))?;
            return Ok(SettlementOutcome::AlreadySettled(existing));
        }

        info!(
            session_id = %session_id,
            pending_transfer_id = %transfer.id,
            amount_cents = transfer.amount.get(),
            platform_fee = transfer.platform_fee.get(),
            processor_fee = transfer.processor_fee.get(),
            payment_type = %tx.payment_type,
            "Settlement recorded"
        );
        Ok(SettlementOutcome::Recorded(transfer))
    }

    /// Payout row for a captured transaction.
    ///
    /// Direct charges already paid the tutor through the processor, so the
    /// row is recorded as completed for the at-most-once guard only.
    fn ledger_row(&self, tx: &PaymentTransaction, now: DateTime<Utc>) -> Result<PendingTransfer, SettlementError> {
        let (amount, platform_fee, processor_fee, status) = match tx.payment_type {
            PaymentType::ConnectDirect => {
                let net = tx
                    .amount
                    .checked_sub(tx.platform_fee)
                    .filter(|n| n.get() >= 0)
                    .ok_or(FeesExceedAmount {
                        amount: tx.amount,
                        platform_fee: tx.platform_fee,
                        processor_fee: Cents::ZERO,
                    })?;
                (net, tx.platform_fee, Cents::ZERO, TransferStatus::Completed)
            }
            PaymentType::TwoStage => {
                let fees = compute_fees(tx.amount, &self.policy)?;
                (fees.tutor_net, fees.platform_fee, fees.processor_fee, TransferStatus::Pending)
            }
        };

        Ok(PendingTransfer {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: tx.session_id.clone(),
            tutor_id: tx.tutor_id.clone(),
            student_id: tx.student_id.clone(),
            amount,
            platform_fee,
            processor_fee,
            status,
            payment_transaction_id: tx.id.clone(),
            transfer_id: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Pay out every pending row for a tutor
    pub async fn execute_transfers(&self, tutor_id: &str, now: DateTime<Utc>) -> Result<TransferReport, SettlementError> {
        let pending = self.transfers.list_pending_for_tutor(tutor_id).await?;
        let mut report = TransferReport {
            tutor_id: tutor_id.to_string(),
            ..Default::default()
        };
        if pending.is_empty() {
            return Ok(report);
        }

        let destination = self.verified_payout_account(tutor_id).await?;

        for row in pending {
            match self.execute_one(&row, &destination, now).await {
                Ok(RowOutcome::Completed(done)) => report.completed.push(done),
                Ok(RowOutcome::Deferred) => report.deferred.push(row.id),
                Ok(RowOutcome::Failed(reason)) => report.failed.push(TransferFailure {
                    pending_transfer_id: row.id,
                    reason,
                }),
                Err(e) => {
                    // Ledger write failed; the row stays pending and the
                    // keyed transfer is replayed on the next run
                    error!(pending_transfer_id = %row.id, error = %e, "Transfer bookkeeping failed");
                    report.deferred.push(row.id);
                }
            }
        }

        info!(
            tutor_id = %tutor_id,
            completed = report.completed.len(),
            failed = report.failed.len(),
            deferred = report.deferred.len(),
            "Transfer execution finished"
        );
        Ok(report)
    }

    async fn verified_payout_account(&self, tutor_id: &str) -> Result<String, SettlementError> {
        let account_id = self
            .tutors
            .get(tutor_id)
            .await?
            .and_then(|p| p.payout_account_id)
            .ok_or_else(|| SettlementError::TutorPayoutNotConfigured(format!("tutor {} has no payout account", tutor_id)))?;

        let account = self
            .processor
            .retrieve_account(&account_id)
            .await
            .map_err(SettlementError::Processor)?;
        if !account.is_onboarded() {
            return Err(SettlementError::TutorPayoutNotConfigured(format!(
                "payout account {} has not completed onboarding",
                account_id
            )));
        }
        Ok(account.id)
    }

    async fn execute_one(
        &self,
        row: &PendingTransfer,
        destination: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<RowOutcome> {
        let charge = self
            .transactions
            .get_by_id(&row.payment_transaction_id)
            .await?
            .and_then(|tx| tx.charge_id);

        let mut metadata = BTreeMap::new();
        metadata.insert("session_id".to_string(), row.session_id.clone());
        metadata.insert("pending_transfer_id".to_string(), row.id.clone());

        let params = TransferParams {
            amount: row.amount,
            currency: self.currency.clone(),
            destination: destination.to_string(),
            source_transaction: charge,
            metadata,
            idempotency_key: format!("transfer:{}", row.id),
        };

        let transfer = match self.processor.create_transfer(&params).await {
            Ok(t) => t,
            Err(e) => return self.record_processor_error(row, "create", e, now).await,
        };
        let verified = match self.processor.retrieve_transfer(&transfer.id).await {
            Ok(t) => t,
            Err(e) => return self.record_processor_error(row, "verify", e, now).await,
        };

        if !verified.is_settled(row.amount, destination) {
            let reason = format!(
                "transfer {} failed verification: amount={} reversed={} destination={}",
                verified.id, verified.amount, verified.reversed, verified.destination
            );
            error!(pending_transfer_id = %row.id, transfer_id = %verified.id, "Transfer verification failed");
            self.transfers.mark_failed(&row.id, &reason, now).await?;
            return Ok(RowOutcome::Failed(reason));
        }

        if !self.transfers.mark_completed(&row.id, &verified.id, now).await? {
            // Another run finished this row first
            warn!(pending_transfer_id = %row.id, "Transfer already recorded by a concurrent run");
        }
        self.transactions
            .set_transfer_id(&row.payment_transaction_id, &verified.id, now)
            .await?;

        info!(
            session_id = %row.session_id,
            pending_transfer_id = %row.id,
            transfer_id = %verified.id,
            amount_cents = row.amount.get(),
            "Transfer completed"
        );

        let done = self
            .transfers
            .get_by_id(&row.id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Pending transfer {} disappeared", row.id))?;
        Ok(RowOutcome::Completed(done))
    }

    async fn record_processor_error(
        &self,
        row: &PendingTransfer,
        stage: &str,
        err: ProcessorError,
        now: DateTime<Utc>,
    ) -> anyhow::Result<RowOutcome> {
        if err.is_transient() {
            warn!(pending_transfer_id = %row.id, stage = stage, error = %err, "Transient transfer error, leaving pending");
            return Ok(RowOutcome::Deferred);
        }
        let reason = err.message();
        error!(pending_transfer_id = %row.id, stage = stage, error = %err, "Transfer rejected by processor");
        self.transfers.mark_failed(&row.id, &reason, now).await?;
        Ok(RowOutcome::Failed(reason))
    }

    /// Operator retry: move a failed row back to pending
    pub async fn retry_failed_transfer(&self, id: &str, now: DateTime<Utc>) -> Result<PendingTransfer, SettlementError> {
        let row = self
            .transfers
            .get_by_id(id)
            .await?
            .ok_or_else(|| SettlementError::TransferNotFound(id.to_string()))?;
        if row.status != TransferStatus::Failed || !self.transfers.reset_failed(id, now).await? {
            return Err(SettlementError::TransferNotFailed(row.status));
        }
        info!(pending_transfer_id = %id, "Failed transfer reset to pending");
        Ok(self
            .transfers
            .get_by_id(id)
            .await?
            .ok_or_else(|| SettlementError::TransferNotFound(id.to_string()))?)
    }
}

enum RowOutcome {
    Completed(PendingTransfer),
    Deferred,
    Failed(String),
}
