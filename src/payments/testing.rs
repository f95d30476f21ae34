//! Scripted in-process processor for tests
//!
//! Honors idempotency keys the way the real API does: a replayed key
//! returns the object created by the first request.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::errors::StripeErrorType;
use super::types::{
    Account, CreateIntentParams, IntentStatus, PaymentIntent, Refund, RefundParams, Transfer,
    TransferParams,
};
use super::{PaymentProcessor, ProcessorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    CreateIntent,
    RetrieveIntent,
    CancelIntent,
    CreateRefund,
    CreateTransfer,
    RetrieveTransfer,
    RetrieveAccount,
}

#[derive(Default)]
struct FakeState {
    intents: HashMap<String, PaymentIntent>,
    transfers: HashMap<String, Transfer>,
    accounts: HashMap<String, Account>,
    by_key: HashMap<String, String>,
    intent_requests: Vec<CreateIntentParams>,
    refund_requests: Vec<RefundParams>,
    transfer_requests: Vec<TransferParams>,
    failures: HashMap<FakeOp, (ProcessorError, Option<u32>)>,
    counter: u32,
    /// Amount reported by retrieve_transfer instead of the real one
    misreported_transfer_amount: Option<i64>,
}

#[derive(Clone, Default)]
pub struct FakeProcessor {
    state: Arc<Mutex<FakeState>>,
}

pub fn transient_error() -> ProcessorError {
    ProcessorError::Stripe {
        type_: StripeErrorType::ApiError,
        message: Some("upstream unavailable".into()),
        code: None,
        param: None,
        status: Some(503),
    }
}

pub fn declined_error() -> ProcessorError {
    ProcessorError::Stripe {
        type_: StripeErrorType::InvalidRequestError,
        message: Some("Insufficient funds in platform balance".into()),
        code: Some("balance_insufficient".into()),
        param: None,
        status: Some(400),
    }
}

impl FakeProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn add_account(&self, account_id: &str, onboarded: bool) {
        self.lock().accounts.insert(
            account_id.to_string(),
            Account {
                id: account_id.to_string(),
                charges_enabled: onboarded,
                payouts_enabled: onboarded,
                details_submitted: onboarded,
            },
        );
    }

    /// Fail `op` for the next `times` calls (`None` = until cleared)
    pub fn fail(&self, op: FakeOp, err: ProcessorError, times: Option<u32>) {
        self.lock().failures.insert(op, (err, times));
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    pub fn misreport_transfer_amount(&self, amount: i64) {
        self.lock().misreported_transfer_amount = Some(amount);
    }

    pub fn set_intent_status(&self, intent_id: &str, status: IntentStatus) {
        if let Some(intent) = self.lock().intents.get_mut(intent_id) {
            intent.status = status;
        }
    }

    pub fn intent_requests(&self) -> Vec<CreateIntentParams> {
        self.lock().intent_requests.clone()
    }

    pub fn refund_requests(&self) -> Vec<RefundParams> {
        self.lock().refund_requests.clone()
    }

    pub fn transfer_requests(&self) -> Vec<TransferParams> {
        self.lock().transfer_requests.clone()
    }

    pub fn intent(&self, intent_id: &str) -> Option<PaymentIntent> {
        self.lock().intents.get(intent_id).cloned()
    }

    fn check_failure(state: &mut FakeState, op: FakeOp) -> Result<(), ProcessorError> {
        let (err, exhausted) = match state.failures.get_mut(&op) {
            None => return Ok(()),
            Some((err, None)) => (err.clone(), false),
            Some((err, Some(remaining))) => {
                *remaining = remaining.saturating_sub(1);
                (err.clone(), *remaining == 0)
            }
        };
        if exhausted {
            state.failures.remove(&op);
        }
        Err(err)
    }

    fn next_id(state: &mut FakeState, prefix: &str) -> String {
        state.counter += 1;
        format!("{}_{}", prefix, state.counter)
    }

    fn not_found(what: &str) -> ProcessorError {
        ProcessorError::Stripe {
            type_: StripeErrorType::InvalidRequestError,
            message: Some(format!("No such {}", what)),
            code: Some("resource_missing".into()),
            param: None,
            status: Some(404),
        }
    }
}

#[async_trait]
impl PaymentProcessor for FakeProcessor {
    async fn create_payment_intent(&self, params: &CreateIntentParams) -> Result<PaymentIntent, ProcessorError> {
        let mut state = self.lock();
        Self::check_failure(&mut state, FakeOp::CreateIntent)?;
        state.intent_requests.push(params.clone());
        if let Some(id) = state.by_key.get(&params.idempotency_key).cloned() {
            return state.intents.get(&id).cloned().ok_or_else(|| Self::not_found("intent"));
        }
        let id = Self::next_id(&mut state, "pi");
        let intent = PaymentIntent {
            id: id.clone(),
            status: IntentStatus::RequiresPaymentMethod,
            amount: params.amount.get(),
            currency: params.currency.clone(),
            client_secret: Some(format!("{}_secret", id)),
            latest_charge: None,
            last_payment_error: None,
            metadata: params.metadata.clone(),
        };
        state.by_key.insert(params.idempotency_key.clone(), id.clone());
        state.intents.insert(id, intent.clone());
        Ok(intent)
    }

    async fn retrieve_payment_intent(&self, intent_id: &str) -> Result<PaymentIntent, ProcessorError> {
        let mut state = self.lock();
        Self::check_failure(&mut state, FakeOp::RetrieveIntent)?;
        state.intents.get(intent_id).cloned().ok_or_else(|| Self::not_found("intent"))
    }

    async fn cancel_payment_intent(&self, intent_id: &str) -> Result<PaymentIntent, ProcessorError> {
        let mut state = self.lock();
        Self::check_failure(&mut state, FakeOp::CancelIntent)?;
        let intent = state.intents.get_mut(intent_id).ok_or_else(|| Self::not_found("intent"))?;
        intent.status = IntentStatus::Canceled;
        Ok(intent.clone())
    }

    async fn create_refund(&self, params: &RefundParams) -> Result<Refund, ProcessorError> {
        let mut state = self.lock();
        Self::check_failure(&mut state, FakeOp::CreateRefund)?;
        state.refund_requests.push(params.clone());
        let id = match state.by_key.get(&params.idempotency_key).cloned() {
            Some(id) => id,
            None => {
                let id = Self::next_id(&mut state, "re");
                state.by_key.insert(params.idempotency_key.clone(), id.clone());
                id
            }
        };
        Ok(Refund {
            id,
            status: "succeeded".into(),
            amount: params.amount.get(),
            payment_intent: Some(params.payment_intent.clone()),
        })
    }

    async fn create_transfer(&self, params: &TransferParams) -> Result<Transfer, ProcessorError> {
        let mut state = self.lock();
        Self::check_failure(&mut state, FakeOp::CreateTransfer)?;
        state.transfer_requests.push(params.clone());
        if let Some(id) = state.by_key.get(&params.idempotency_key).cloned() {
            return state.transfers.get(&id).cloned().ok_or_else(|| Self::not_found("transfer"));
        }
        let id = Self::next_id(&mut state, "tr");
        let transfer = Transfer {
            id: id.clone(),
            amount: params.amount.get(),
            currency: params.currency.clone(),
            destination: params.destination.clone(),
            reversed: false,
            amount_reversed: 0,
        };
        state.by_key.insert(params.idempotency_key.clone(), id.clone());
        state.transfers.insert(id, transfer.clone());
        Ok(transfer)
    }

    async fn retrieve_transfer(&self, transfer_id: &str) -> Result<Transfer, ProcessorError> {
        let mut state = self.lock();
        Self::check_failure(&mut state, FakeOp::RetrieveTransfer)?;
        let mut transfer = state
            .transfers
            .get(transfer_id)
            .cloned()
            .ok_or_else(|| Self::not_found("transfer"))?;
        if let Some(amount) = state.misreported_transfer_amount {
            transfer.amount = amount;
        }
        Ok(transfer)
    }

    async fn retrieve_account(&self, account_id: &str) -> Result<Account, ProcessorError> {
        let mut state = self.lock();
        Self::check_failure(&mut state, FakeOp::RetrieveAccount)?;
        state.accounts.get(account_id).cloned().ok_or_else(|| Self::not_found("account"))
    }
}
