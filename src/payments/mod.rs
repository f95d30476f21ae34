//! Payment processor integration
//!
//! The booking core talks to the processor only through [`PaymentProcessor`].
//! [`StripeClient`] is the production implementation; all amounts crossing
//! this boundary are integer minor units.

pub mod errors;
pub mod retry;
pub mod stripe;
pub mod types;
pub mod webhook;

#[cfg(test)]
pub mod testing;

use std::sync::Arc;

use async_trait::async_trait;

pub use errors::{ProcessorError, StripeErrorType};
pub use retry::RetryPolicy;
pub use stripe::StripeClient;
pub use types::{
    Account, CreateIntentParams, IntentStatus, PaymentIntent, Refund, RefundParams, StripeEvent,
    Transfer, TransferParams,
};
pub use webhook::{verify_signature, SignatureError, SIGNATURE_HEADER};

#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn create_payment_intent(&self, params: &CreateIntentParams) -> Result<PaymentIntent, ProcessorError>;

    async fn retrieve_payment_intent(&self, intent_id: &str) -> Result<PaymentIntent, ProcessorError>;

    async fn cancel_payment_intent(&self, intent_id: &str) -> Result<PaymentIntent, ProcessorError>;

    async fn create_refund(&self, params: &RefundParams) -> Result<Refund, ProcessorError>;

    async fn create_transfer(&self, params: &TransferParams) -> Result<Transfer, ProcessorError>;

    async fn retrieve_transfer(&self, transfer_id: &str) -> Result<Transfer, ProcessorError>;

    async fn retrieve_account(&self, account_id: &str) -> Result<Account, ProcessorError>;
}

pub type DynPaymentProcessor = Arc<dyn PaymentProcessor>;
