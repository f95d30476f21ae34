//! API layer - HTTP handlers and routing
//!
//! This module contains all HTTP API endpoints for the tutoring marketplace.
//! It includes:
//! - Tutor slot queries
//! - Booking and payment authorization
//! - Session confirmation, settlement and cancellation
//! - Operator (admin) payout and refund recovery
//! - Processor webhook ingestion
//!
//! Identity comes from the upstream authentication gateway as `X-User-Id`.

pub mod admin;
pub mod bookings;
pub mod errors;
pub mod health;
pub mod middleware;
pub mod payments;
pub mod sessions;
pub mod tutors;
pub mod webhooks;

use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

pub use middleware::{ApiError, AppState, Caller, RequestStats};

/// Build the main API router
pub fn build_api_router(state: AppState) -> Router<AppState> {
    // Operator routes (need the admin token)
    let admin_routes = Router::new()
        .nest("/admin", admin::router())
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_admin,
        ));

    // Participant routes (need a caller id)
    let participant_routes = Router::new()
        .route("/bookings", post(bookings::create_booking))
        .route("/payments/authorize", post(payments::authorize))
        .route("/sessions/confirm", post(sessions::confirm))
        .route("/sessions/cancel", post(sessions::cancel))
        .route("/sessions/{id}", get(sessions::get_session))
        .route_layer(axum_middleware::from_fn(middleware::require_caller));

    // Public routes; settle resolves its own actor
    Router::new()
        .route("/health", get(health::health))
        .route("/tutors/{id}/slots", get(tutors::slots))
        .route("/sessions/settle", post(sessions::settle))
        .route("/webhooks/stripe", post(webhooks::stripe))
        .merge(admin_routes)
        .merge(participant_routes)
}

/// Build the complete router with middleware
pub fn build_router(state: AppState, cors_origin: &str) -> Router {
    let origin = match cors_origin.parse::<HeaderValue>() {
        Ok(origin) if cors_origin != "*" => AllowOrigin::exact(origin),
        _ => {
            if cors_origin != "*" {
                tracing::warn!(cors_origin, "Invalid CORS origin, allowing any origin");
            }
            AllowOrigin::any()
        }
    };
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static(middleware::USER_ID_HEADER),
            HeaderName::from_static(middleware::ADMIN_TOKEN_HEADER),
        ]);

    Router::new()
        .nest("/api/v1", build_api_router(state.clone()))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        // Request stats middleware (outermost layer, runs for all requests)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::request_stats_middleware,
        ))
        .with_state(state)
}
