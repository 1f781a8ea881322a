//! API routes

pub mod billing;
pub mod health;
pub mod subscriptions;

use axum::{
    http::HeaderMap,
    routing::{delete, get, post},
    Router,
};
use uuid::Uuid;

use crate::{error::ApiError, state::AppState};

/// Extract the authenticated user id from the `x-user-id` header.
///
/// Identity is established by the gateway in front of this service, which
/// strips any client-supplied value before setting its own.
pub fn require_user(headers: &HeaderMap) -> Result<Uuid, ApiError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or(ApiError::Unauthorized)
}

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Public API routes (webhook authenticates via signature verification)
    let public_api_routes = Router::new()
        .route("/billing/webhook", post(billing::webhook))
        .route("/billing/tiers", get(billing::list_tiers));

    // User-scoped API routes (identity from the gateway header)
    let user_api_routes = Router::new()
        .route("/billing/payments", post(billing::create_standalone_payment))
        .route("/subscriptions", get(subscriptions::list_subscriptions))
        .route("/subscriptions", delete(subscriptions::cancel))
        .route("/subscriptions/free", post(subscriptions::activate_free))
        .route("/subscriptions/upgrade", post(subscriptions::upgrade))
        .route("/subscriptions/downgrade", post(subscriptions::downgrade))
        .route(
            "/subscriptions/:subscription_id/payments",
            get(subscriptions::list_payments),
        );

    Router::new()
        .merge(health_routes)
        .nest("/api/v1", public_api_routes.merge(user_api_routes))
        .with_state(state)
}
