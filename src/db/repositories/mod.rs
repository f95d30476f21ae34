//! Database repositories
//!
//! Repository pattern implementations for database access.
//! Each repository handles one table of the booking ledger.

pub mod payment_transaction;
pub mod pending_transfer;
pub mod session;
pub mod tutor_profile;
pub mod webhook_event;

pub use payment_transaction::{
    PaymentTransactionRepository, SqlxPaymentTransactionRepository, TransitionUpdate,
};
pub use pending_transfer::{PendingTransferRepository, SqlxPendingTransferRepository};
pub use session::{CancellationRecord, SessionRepository, SqlxSessionRepository};
pub use tutor_profile::{SqlxTutorProfileRepository, TutorProfileRepository};
pub use webhook_event::{SqlxWebhookEventRepository, WebhookEventRepository};
