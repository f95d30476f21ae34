//! Minimal processor DTOs and request parameters

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::Cents;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresAction,
    Processing,
    RequiresCapture,
    Canceled,
    Succeeded,
    #[serde(other)]
    Unknown,
}

impl IntentStatus {
    /// The client can still complete payment against this intent
    pub fn is_usable(self) -> bool {
        matches!(
            self,
            IntentStatus::RequiresPaymentMethod
                | IntentStatus::RequiresConfirmation
                | IntentStatus::RequiresAction
        )
    }

    /// Payment submitted, outcome not yet known
    pub fn is_in_flight(self) -> bool {
        matches!(self, IntentStatus::Processing | IntentStatus::RequiresCapture)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastPaymentError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub status: IntentStatus,
    pub amount: i64,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_charge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_payment_error: Option<LastPaymentError>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Refund {
    pub id: String,
    pub status: String,
    pub amount: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_intent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    pub destination: String,
    #[serde(default)]
    pub reversed: bool,
    #[serde(default)]
    pub amount_reversed: i64,
}

impl Transfer {
    /// The transfer landed in full at the expected destination
    pub fn is_settled(&self, amount: Cents, destination: &str) -> bool {
        !self.reversed && self.amount_reversed == 0 && self.amount == amount.get() && self.destination == destination
    }
}

/// Connected payout account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    #[serde(default)]
    pub charges_enabled: bool,
    #[serde(default)]
    pub payouts_enabled: bool,
    #[serde(default)]
    pub details_submitted: bool,
}

impl Account {
    pub fn is_onboarded(&self) -> bool {
        self.charges_enabled && self.payouts_enabled && self.details_submitted
    }
}

/// Webhook event envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: StripeEventData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeEventData {
    pub object: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateIntentParams {
    pub amount: Cents,
    pub currency: String,
    pub description: Option<String>,
    /// Connected account receiving the automatic transfer
    pub destination: Option<String>,
    pub application_fee: Option<Cents>,
    pub metadata: BTreeMap<String, String>,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefundParams {
    pub payment_intent: String,
    pub amount: Cents,
    /// Pull the tutor's share back from the connected account
    pub reverse_transfer: bool,
    pub refund_application_fee: bool,
    pub metadata: BTreeMap<String, String>,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferParams {
    pub amount: Cents,
    pub currency: String,
    pub destination: String,
    /// Charge whose funds back the transfer
    pub source_transaction: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub idempotency_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_status_parsing() {
        let intent: PaymentIntent = serde_json::from_str(
            r#"{"id":"pi_1","status":"requires_payment_method","amount":5000,"currency":"usd","client_secret":"pi_1_secret"}"#,
        )
        .unwrap();
        assert!(intent.status.is_usable());
        assert!(intent.metadata.is_empty());

        let status: IntentStatus = serde_json::from_str(r#""some_new_status""#).unwrap();
        assert_eq!(status, IntentStatus::Unknown);
        assert!(!status.is_usable());
        assert!(IntentStatus::Processing.is_in_flight());
    }

    #[test]
    fn test_transfer_settled_check() {
        let transfer = Transfer {
            id: "tr_1".into(),
            amount: 8180,
            currency: "usd".into(),
            destination: "acct_1".into(),
            reversed: false,
            amount_reversed: 0,
        };
        assert!(transfer.is_settled(Cents(8180), "acct_1"));
        assert!(!transfer.is_settled(Cents(8000), "acct_1"));
        assert!(!transfer.is_settled(Cents(8180), "acct_2"));

        let reversed = Transfer { reversed: true, ..transfer };
        assert!(!reversed.is_settled(Cents(8180), "acct_1"));
    }

    #[test]
    fn test_account_onboarding() {
        let mut account = Account {
            id: "acct_1".into(),
            charges_enabled: true,
            payouts_enabled: true,
            details_submitted: true,
        };
        assert!(account.is_onboarded());
        account.payouts_enabled = false;
        assert!(!account.is_onboarded());
    }
}
