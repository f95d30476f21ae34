//! Services layer - Business logic
//!
//! This module contains the booking and settlement core:
//! - Availability resolution and booking validation
//! - Payment authorization, dual confirmation and settlement
//! - Cancellation refunds and processor webhook ingestion
//!
//! Services own the business rules and talk to persistence only through
//! the repository traits and to the processor only through
//! `PaymentProcessor`.

pub mod availability;
pub mod booking;
pub mod cancellation;
pub mod confirmation;
pub mod meeting;
pub mod notification;
pub mod payment;
pub mod policy;
pub mod settlement;
pub mod tutor;
pub mod webhook;

#[cfg(test)]
pub(crate) mod testing;

pub use availability::{resolve_slots, AvailabilityError, AvailabilityService, SlotQuery, SlotResolution};
pub use booking::{BookingError, BookingOutcome, BookingService};
pub use cancellation::{CancellationError, CancellationOutcome, CancellationService, RefundOutcome};
pub use confirmation::{ConfirmationError, ConfirmationOutcome, ConfirmationService};
pub use meeting::{create_meeting_provider, HttpMeetings, MeetingProvider, NoopMeetings};
pub use notification::{
    create_notifier, LogNotifier, Notification, NotificationDispatcher, NotificationEvent, Notifier,
    WebhookNotifier,
};
pub use payment::{Authorization, AuthorizeRequest, PaymentError, PaymentGateway};
pub use policy::{compute_fees, refund_split, FeeBreakdown, FeesExceedAmount, RefundSplit};
pub use settlement::{SettlementError, SettlementOutcome, SettlementService, TransferFailure, TransferReport};
pub use tutor::{TutorDirectory, TutorError};
pub use webhook::{WebhookAck, WebhookError, WebhookService};

/// Who is invoking an operation that participants and operators share
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    /// An authenticated participant
    User(String),
    /// An operator holding the admin token
    Admin,
    /// Internal trigger: completion or a processor webhook
    System,
}
