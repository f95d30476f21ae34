//! API middleware
//!
//! Contains middleware for:
//! - Caller identity forwarded by the authentication gateway (`X-User-Id`)
//! - Operator access (`X-Admin-Token`)
//! - Request statistics

use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, FromRequest, FromRequestParts, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::db::repositories::{
    SessionRepository, SqlxPaymentTransactionRepository, SqlxPendingTransferRepository, SqlxSessionRepository,
    SqlxTutorProfileRepository, SqlxWebhookEventRepository,
};
use crate::db::DynDatabasePool;
use crate::payments::DynPaymentProcessor;
use crate::services::{
    AvailabilityService, BookingService, CancellationService, ConfirmationService, MeetingProvider,
    NotificationDispatcher, Notifier, PaymentGateway, SettlementService, TutorDirectory,
    WebhookService,
};

type HmacSha256 = Hmac<Sha256>;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

// ============================================================================
// Request Statistics
// ============================================================================

/// Lightweight request statistics using atomic operations (no locks)
pub struct RequestStats {
    total_requests: AtomicU64,
    /// Total response time in microseconds (for calculating average)
    total_response_time_us: AtomicU64,
    start_time: Instant,
}

impl RequestStats {
    pub fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            total_response_time_us: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record(&self, duration_us: u64) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_response_time_us.fetch_add(duration_us, Ordering::Relaxed);
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn avg_response_time_us(&self) -> f64 {
        let total = self.total_requests.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        self.total_response_time_us.load(Ordering::Relaxed) as f64 / total as f64
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl Default for RequestStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Application state containing shared services
#[derive(Clone)]
pub struct AppState {
    pub pool: DynDatabasePool,
    pub admin_token: Arc<str>,
    pub sessions: Arc<dyn SessionRepository>,
    pub availability: Arc<AvailabilityService>,
    pub bookings: Arc<BookingService>,
    pub payments: Arc<PaymentGateway>,
    pub confirmations: Arc<ConfirmationService>,
    pub settlement: Arc<SettlementService>,
    pub cancellations: Arc<CancellationService>,
    pub webhooks: Arc<WebhookService>,
    pub tutors: Arc<TutorDirectory>,
    pub request_stats: Arc<RequestStats>,
}

impl AppState {
    /// Wire repositories and services over one pool and processor
    pub fn build(
        pool: DynDatabasePool,
        config: &Config,
        processor: DynPaymentProcessor,
        notifier: Arc<dyn Notifier>,
        meetings: Arc<dyn MeetingProvider>,
    ) -> Self {
        let sessions = SqlxSessionRepository::boxed(pool.clone());
        let transactions = SqlxPaymentTransactionRepository::boxed(pool.clone());
        let transfers = SqlxPendingTransferRepository::boxed(pool.clone());
        let tutors = SqlxTutorProfileRepository::boxed(pool.clone());
        let events = SqlxWebhookEventRepository::boxed(pool.clone());
        let notifications = NotificationDispatcher::new(notifier);
        let policy = config.policy.clone();
        let currency = config.stripe.currency.clone();

        let payments = Arc::new(PaymentGateway::new(
            sessions.clone(),
            transactions.clone(),
            tutors.clone(),
            processor.clone(),
            policy.clone(),
            currency.clone(),
        ));
        let settlement = Arc::new(SettlementService::new(
            sessions.clone(),
            transactions.clone(),
            transfers.clone(),
            tutors.clone(),
            processor.clone(),
            policy.clone(),
            currency,
        ));
        let cancellations = Arc::new(CancellationService::new(
            sessions.clone(),
            transactions.clone(),
            transfers,
            processor,
            meetings,
            notifications.clone(),
            policy.clone(),
        ));

        Self {
            availability: Arc::new(AvailabilityService::new(tutors.clone(), sessions.clone(), policy.clone())),
            bookings: Arc::new(BookingService::new(
                sessions.clone(),
                tutors.clone(),
                payments.clone(),
                notifications.clone(),
                policy.clone(),
            )),
            confirmations: Arc::new(ConfirmationService::new(sessions.clone(), settlement.clone(), notifications)),
            webhooks: Arc::new(WebhookService::new(
                events,
                transactions,
                sessions.clone(),
                tutors.clone(),
                settlement.clone(),
                cancellations.clone(),
                config.stripe.webhook_secret.clone(),
                config.stripe.webhook_tolerance_seconds,
            )),
            tutors: Arc::new(TutorDirectory::new(tutors)),
            cancellations,
            sessions,
            payments,
            settlement,
            admin_token: Arc::from(config.server.admin_token.as_str()),
            pool,
            request_stats: Arc::new(RequestStats::new()),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Error body: `{ "error": CODE, "message": text, "details": {..} }`
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new("UNAUTHORIZED", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new("FORBIDDEN", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("NOT_FOUND", message)
    }

    pub fn validation_error(message: impl Into<String>) -> Self {
        Self::new("VALIDATION_ERROR", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new("CONFLICT", message)
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new("UPSTREAM_ERROR", message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new("INTERNAL_ERROR", message)
    }

    pub fn status(&self) -> StatusCode {
        match self.error.as_str() {
            "UNAUTHORIZED" => StatusCode::UNAUTHORIZED,
            "FORBIDDEN" => StatusCode::FORBIDDEN,
            "NOT_FOUND" => StatusCode::NOT_FOUND,
            "VALIDATION_ERROR" => StatusCode::BAD_REQUEST,
            "CONFLICT" => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::validation_error(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::validation_error(rejection.body_text())
    }
}

/// JSON body whose rejections are reported as `VALIDATION_ERROR`
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

/// Query string whose rejections are reported as `VALIDATION_ERROR`
#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(ApiError))]
pub struct ApiQuery<T>(pub T);

// ============================================================================
// Identity
// ============================================================================

/// Caller id forwarded by the authentication gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller(pub String);

pub fn caller_from_headers(headers: &HeaderMap) -> Option<Caller> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| Caller(v.to_string()))
}

/// Whether the request carries the configured admin token.
/// An empty configured token never matches.
pub fn is_admin(headers: &HeaderMap, admin_token: &str) -> bool {
    if admin_token.is_empty() {
        return false;
    }
    headers
        .get(ADMIN_TOKEN_HEADER)
        .map(|v| token_matches(v.as_bytes(), admin_token))
        .unwrap_or(false)
}

/// Both sides are MACed under the configured token, so the comparison runs
/// over fixed-length tags whatever the presented length
fn token_matches(presented: &[u8], admin_token: &str) -> bool {
    let Ok(mac) = HmacSha256::new_from_slice(admin_token.as_bytes()) else {
        return false;
    };
    let expected = mac.clone().chain_update(admin_token.as_bytes()).finalize().into_bytes();
    mac.chain_update(presented).verify_slice(&expected).is_ok()
}

/// Reject requests without a caller id
pub async fn require_caller(mut request: Request, next: Next) -> Result<Response, ApiError> {
    let caller = caller_from_headers(request.headers())
        .ok_or_else(|| ApiError::unauthorized("Missing X-User-Id header"))?;
    request.extensions_mut().insert(caller);
    Ok(next.run(request).await)
}

/// Operator authorization middleware
pub async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !is_admin(request.headers(), &state.admin_token) {
        return Err(ApiError::forbidden("Admin token required"));
    }
    Ok(next.run(request).await)
}

/// Request statistics middleware
pub async fn request_stats_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let response = next.run(request).await;
    state.request_stats.record(start.elapsed().as_micros() as u64);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(ApiError::unauthorized("x").status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::forbidden("x").status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::not_found("x").status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::validation_error("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::conflict("x").status(), StatusCode::CONFLICT);
        assert_eq!(ApiError::upstream("x").status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_error_body_is_flat() {
        let body = serde_json::to_value(ApiError::conflict("taken").with_details(serde_json::json!({"a": 1}))).unwrap();
        assert_eq!(body["error"], "CONFLICT");
        assert_eq!(body["message"], "taken");
        assert_eq!(body["details"]["a"], 1);

        let bare = serde_json::to_value(ApiError::not_found("gone")).unwrap();
        assert!(bare.get("details").is_none());
    }

    #[test]
    fn test_admin_token_check() {
        let mut headers = HeaderMap::new();
        headers.insert(ADMIN_TOKEN_HEADER, HeaderValue::from_static("s3cret"));
        assert!(is_admin(&headers, "s3cret"));
        assert!(!is_admin(&headers, "s3cre7"));
        assert!(!is_admin(&headers, "s3cret-longer"));
        assert!(!is_admin(&headers, "s3"));
        assert!(token_matches(b"s3cret", "s3cret"));
        assert!(!token_matches(b"s3cret\0", "s3cret"));
        assert!(!token_matches(b"", "s3cret"));
        // Empty configured token disables admin access entirely
        headers.insert(ADMIN_TOKEN_HEADER, HeaderValue::from_static(""));
        assert!(!is_admin(&headers, ""));
    }

    #[test]
    fn test_caller_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(caller_from_headers(&headers), None);
        headers.insert(USER_ID_HEADER, HeaderValue::from_static("  "));
        assert_eq!(caller_from_headers(&headers), None);
        headers.insert(USER_ID_HEADER, HeaderValue::from_static("student-1"));
        assert_eq!(caller_from_headers(&headers), Some(Caller("student-1".into())));
    }

    #[test]
    fn test_request_stats() {
        let stats = RequestStats::new();
        assert_eq!(stats.avg_response_time_us(), 0.0);
        stats.record(100);
        stats.record(300);
        assert_eq!(stats.total_requests(), 2);
        assert_eq!(stats.avg_response_time_us(), 200.0);
    }
}
