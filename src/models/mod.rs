//! Data models
//!
//! This module contains the data structures of the booking and settlement core:
//! - Database entities (Session, PaymentTransaction, PendingTransfer, TutorProfile)
//! - Availability and slot types
//! - Money (`Cents`) and tagged amount input

mod availability;
mod money;
mod payment;
mod session;
mod tutor;

pub use availability::{BookingSlot, TimeRange, WeeklyAvailability};
pub use money::{ratio_half_up, AmountInput, Cents, InvalidAmount};
pub use payment::{PaymentTransaction, PaymentType, PendingTransfer, TransactionStatus, TransferStatus};
pub use session::{
    CreateBookingInput, RefundStatus, Role, Session, SessionPaymentStatus, SessionStatus,
    SessionType,
};
pub use tutor::{TutorProfile, UpsertTutorProfileInput};
