//! Service error to HTTP error mapping
//!
//! Validation 400, missing caller 401, wrong party 403, unknown record 404,
//! state conflicts 409, processor and persistence failures 500.

use serde_json::json;
use tracing::error;

use crate::api::middleware::ApiError;
use crate::payments::ProcessorError;
use crate::services::{
    AvailabilityError, BookingError, CancellationError, ConfirmationError, PaymentError,
    SettlementError, TutorError, WebhookError,
};

fn internal(e: anyhow::Error) -> ApiError {
    error!(error = ?e, "Internal error");
    ApiError::internal_error(e.to_string())
}

/// Upstream failures carry the processor's own message and code
fn upstream(e: &ProcessorError) -> ApiError {
    error!(error = %e, "Payment processor error");
    ApiError::upstream(e.message()).with_details(json!({
        "processor_code": e.code(),
        "transient": e.is_transient(),
    }))
}

impl From<PaymentError> for ApiError {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::InvalidAmount(_) => ApiError::validation_error(err.to_string()),
            PaymentError::SessionNotFound(_) => ApiError::not_found(err.to_string()),
            PaymentError::Unauthorized(_) => ApiError::forbidden(err.to_string()),
            PaymentError::SessionClosed(_) | PaymentError::AlreadyPaid => ApiError::conflict(err.to_string()),
            PaymentError::AuthorizationFailed(ref e) => upstream(e),
            PaymentError::Internal(e) => internal(e),
        }
    }
}

impl From<BookingError> for ApiError {
    fn from(err: BookingError) -> Self {
        match err {
            BookingError::SelfBooking
            | BookingError::InvalidTimeRange
            | BookingError::InvalidDuration(_)
            | BookingError::LeadTimeViolation(_)
            | BookingError::BeyondHorizon(_) => ApiError::validation_error(err.to_string()),
            BookingError::TutorNotFound(_) => ApiError::not_found(err.to_string()),
            BookingError::SlotUnavailable(_) => ApiError::conflict(err.to_string()),
            BookingError::PaymentSetupFailed { session_id, source } => {
                let message = format!("Session {} created but payment setup failed: {}", session_id, source);
                let mut api = ApiError::from(source);
                let mut details = api.details.take().unwrap_or_else(|| json!({}));
                details["session_id"] = json!(session_id);
                details["retryable"] = json!(true);
                api.message = message;
                api.with_details(details)
            }
            BookingError::Internal(e) => internal(e),
        }
    }
}

impl From<ConfirmationError> for ApiError {
    fn from(err: ConfirmationError) -> Self {
        match err {
            ConfirmationError::SessionNotFound(_) => ApiError::not_found(err.to_string()),
            ConfirmationError::Unauthorized(_) => ApiError::forbidden(err.to_string()),
            ConfirmationError::SessionCancelled => ApiError::conflict(err.to_string()),
            ConfirmationError::Internal(e) => internal(e),
        }
    }
}

impl From<SettlementError> for ApiError {
    fn from(err: SettlementError) -> Self {
        match err {
            SettlementError::SessionNotFound(_) | SettlementError::TransferNotFound(_) => {
                ApiError::not_found(err.to_string())
            }
            SettlementError::Unauthorized(_) => ApiError::forbidden(err.to_string()),
            SettlementError::SessionNotCompleted(_)
            | SettlementError::TransferNotFailed(_)
            | SettlementError::TutorPayoutNotConfigured(_) => ApiError::conflict(err.to_string()),
            SettlementError::FeesExceedAmount(ref e) => ApiError::validation_error(err.to_string()).with_details(json!({
                "amount": e.amount,
                "platform_fee": e.platform_fee,
                "processor_fee": e.processor_fee,
            })),
            SettlementError::Processor(ref e) => upstream(e),
            SettlementError::Internal(e) => internal(e),
        }
    }
}

impl From<CancellationError> for ApiError {
    fn from(err: CancellationError) -> Self {
        match err {
            CancellationError::SessionNotFound(_) => ApiError::not_found(err.to_string()),
            CancellationError::Unauthorized(_) => ApiError::forbidden(err.to_string()),
            CancellationError::AlreadyCancelled
            | CancellationError::CannotCancelCompleted
            | CancellationError::RefundNotRetryable(_) => ApiError::conflict(err.to_string()),
            CancellationError::Internal(e) => internal(e),
        }
    }
}

impl From<WebhookError> for ApiError {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::Signature(_) | WebhookError::MalformedPayload(_) => {
                ApiError::validation_error(err.to_string())
            }
            WebhookError::Internal(e) => internal(e),
        }
    }
}

impl From<AvailabilityError> for ApiError {
    fn from(err: AvailabilityError) -> Self {
        match err {
            AvailabilityError::TutorNotFound(_) => ApiError::not_found(err.to_string()),
            AvailabilityError::InvalidDuration(_) | AvailabilityError::InvalidWindow(_) => {
                ApiError::validation_error(err.to_string())
            }
            AvailabilityError::Internal(e) => internal(e),
        }
    }
}

impl From<TutorError> for ApiError {
    fn from(err: TutorError) -> Self {
        match err {
            TutorError::Validation(_) => ApiError::validation_error(err.to_string()),
            TutorError::Internal(e) => internal(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::testing::declined_error;
    use axum::http::StatusCode;

    #[test]
    fn test_booking_payment_failure_keeps_session_id() {
        let err = BookingError::PaymentSetupFailed {
            session_id: "sess-1".into(),
            source: PaymentError::AuthorizationFailed(declined_error()),
        };
        let api = ApiError::from(err);
        assert_eq!(api.error, "UPSTREAM_ERROR");
        assert_eq!(api.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let details = api.details.unwrap();
        assert_eq!(details["session_id"], "sess-1");
        assert_eq!(details["processor_code"], "balance_insufficient");
        assert_eq!(details["retryable"], true);
    }

    #[test]
    fn test_conflicts_and_validation() {
        assert_eq!(ApiError::from(PaymentError::AlreadyPaid).status(), StatusCode::CONFLICT);
        assert_eq!(ApiError::from(CancellationError::CannotCancelCompleted).status(), StatusCode::CONFLICT);
        assert_eq!(ApiError::from(BookingError::LeadTimeViolation(3)).status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::from(ConfirmationError::Unauthorized("no".into())).status(),
            StatusCode::FORBIDDEN
        );
    }
}
