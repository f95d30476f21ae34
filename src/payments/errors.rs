//! Processor error taxonomy

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StripeErrorType {
    ApiConnectionError,
    ApiError,
    AuthenticationError,
    CardError,
    IdempotencyError,
    InvalidRequestError,
    RateLimitError,
    Unknown,
}

impl From<&str> for StripeErrorType {
    fn from(s: &str) -> Self {
        match s {
            "api_connection_error" => StripeErrorType::ApiConnectionError,
            "api_error" => StripeErrorType::ApiError,
            "authentication_error" => StripeErrorType::AuthenticationError,
            "card_error" => StripeErrorType::CardError,
            "idempotency_error" => StripeErrorType::IdempotencyError,
            "invalid_request_error" => StripeErrorType::InvalidRequestError,
            "rate_limit_error" => StripeErrorType::RateLimitError,
            _ => StripeErrorType::Unknown,
        }
    }
}

// REST error envelope: { error: { type, code, message, param } }
#[derive(Debug, Clone, Deserialize)]
pub struct StripeErrorEnvelope {
    pub error: StripeErrorDetails,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeErrorDetails {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub param: Option<String>,
}

impl StripeErrorEnvelope {
    pub fn into_error(self, status: Option<u16>) -> ProcessorError {
        ProcessorError::Stripe {
            type_: StripeErrorType::from(self.error.type_.as_str()),
            message: self.error.message,
            code: self.error.code,
            param: self.error.param,
            status,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ProcessorError {
    #[error("http error: {0}")]
    Http(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("stripe error: {type_:?} message={message:?} code={code:?} param={param:?}")]
    Stripe {
        type_: StripeErrorType,
        message: Option<String>,
        code: Option<String>,
        param: Option<String>,
        status: Option<u16>,
    },
    #[error("precondition failed: {0}")]
    Precondition(&'static str),
}

impl ProcessorError {
    /// Network failures, 5xx and the processor's own transient types
    pub fn is_transient(&self) -> bool {
        match self {
            ProcessorError::Http(_) => true,
            ProcessorError::Stripe { status, type_, .. } => is_transient(*status, Some(type_)),
            ProcessorError::Decode(_) | ProcessorError::Precondition(_) => false,
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            ProcessorError::Stripe { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Human readable message, preferring the processor's own wording
    pub fn message(&self) -> String {
        match self {
            ProcessorError::Stripe {
                message: Some(message),
                ..
            } => message.clone(),
            other => other.to_string(),
        }
    }
}

pub fn is_transient(http_status: Option<u16>, type_: Option<&StripeErrorType>) -> bool {
    if let Some(s) = http_status {
        if (500..600).contains(&s) {
            return true;
        }
    }
    matches!(
        type_,
        Some(StripeErrorType::ApiConnectionError | StripeErrorType::ApiError | StripeErrorType::RateLimitError)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_maps_to_stripe_error() {
        let body = r#"{"error":{"type":"card_error","code":"card_declined","message":"Your card was declined."}}"#;
        let env: StripeErrorEnvelope = serde_json::from_str(body).unwrap();
        let err = env.into_error(Some(402));

        assert!(!err.is_transient());
        assert_eq!(err.code(), Some("card_declined"));
        assert_eq!(err.message(), "Your card was declined.");
    }

    #[test]
    fn test_transient_classification() {
        assert!(ProcessorError::Http("connection reset".into()).is_transient());
        assert!(is_transient(Some(503), None));
        assert!(is_transient(Some(429), Some(&StripeErrorType::RateLimitError)));
        assert!(!is_transient(Some(400), Some(&StripeErrorType::InvalidRequestError)));
        assert!(!ProcessorError::Decode("eof".into()).is_transient());
    }
}
