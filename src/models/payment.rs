//! Payment ledger models
//!
//! `PaymentTransaction` mirrors one processor authorization for one
//! session. `PendingTransfer` records the tutor payout owed once a session
//! is settled (or partially kept after a late cancellation).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Cents;

/// Local status of a processor authorization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TransactionStatus {
    /// Non-terminal: the authorization may still be paid
    pub fn is_live(self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for TransactionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(anyhow::anyhow!("Invalid transaction status: {}", s)),
        }
    }
}

/// How funds reach the tutor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    /// Charge carries a destination; the processor transfers the tutor's share
    ConnectDirect,
    /// Platform keeps the funds until an explicit transfer is executed
    TwoStage,
}

impl std::fmt::Display for PaymentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectDirect => write!(f, "connect_direct"),
            Self::TwoStage => write!(f, "two_stage"),
        }
    }
}

impl std::str::FromStr for PaymentType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "connect_direct" => Ok(Self::ConnectDirect),
            "two_stage" => Ok(Self::TwoStage),
            _ => Err(anyhow::anyhow!("Invalid payment type: {}", s)),
        }
    }
}

/// Local mirror of a processor payment intent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub id: String,
    pub session_id: String,
    pub student_id: String,
    pub tutor_id: String,
    pub amount: Cents,
    pub currency: String,
    pub status: TransactionStatus,
    pub payment_intent_id: String,
    pub charge_id: Option<String>,
    /// Application fee on direct charges, computed platform share otherwise
    pub platform_fee: Cents,
    pub payment_type: PaymentType,
    pub requires_transfer: bool,
    pub transfer_id: Option<String>,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Status of a tutor payout obligation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Completed,
    Failed,
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for TransferStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(anyhow::anyhow!("Invalid transfer status: {}", s)),
        }
    }
}

/// A tutor payout owed for one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTransfer {
    pub id: String,
    pub session_id: String,
    pub tutor_id: String,
    pub student_id: String,
    /// Tutor net, in minor units
    pub amount: Cents,
    pub platform_fee: Cents,
    pub processor_fee: Cents,
    pub status: TransferStatus,
    pub payment_transaction_id: String,
    pub transfer_id: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
