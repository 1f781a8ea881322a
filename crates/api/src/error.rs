//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use vlabs_billing::BillingError;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication errors
    #[error("Authentication required")]
    Unauthorized,

    // Validation errors
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Resource errors
    #[error("Resource not found")]
    NotFound,
    #[error("Resource already exists")]
    Conflict(String),

    // Billing errors
    #[error("Webhook signature verification failed")]
    InvalidSignature,
    #[error("Payment gateway error")]
    PaymentGateway(String),

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error")]
    Internal,
    #[error("Service unavailable")]
    ServiceUnavailable,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // Authentication
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),

            // Validation
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),

            // Resources
            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),

            // Billing
            ApiError::InvalidSignature => {
                (StatusCode::BAD_REQUEST, "INVALID_SIGNATURE", self.to_string())
            }
            ApiError::PaymentGateway(_) => (
                StatusCode::BAD_GATEWAY,
                "PAYMENT_GATEWAY_ERROR",
                "Payment gateway error".to_string(),
            ),

            // Internal
            ApiError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "Database error".to_string(),
            ),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", self.to_string()),
            ApiError::ServiceUnavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", self.to_string())
            }
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound,
            sqlx::Error::Database(db_err) => {
                if let Some(code) = db_err.code() {
                    // PostgreSQL unique violation
                    if code == "23505" {
                        return ApiError::Conflict("Resource already exists".to_string());
                    }
                }
                ApiError::Database(db_err.to_string())
            }
            _ => ApiError::Database(err.to_string()),
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        tracing::error!("Billing error: {:?}", err);
        match err {
            BillingError::SignatureInvalid => ApiError::InvalidSignature,
            BillingError::MalformedEvent(msg) => ApiError::BadRequest(msg),
            BillingError::InvalidAmount(amount) => {
                ApiError::BadRequest(format!("Invalid payment amount: {amount}"))
            }
            BillingError::TierNotFound(msg) => ApiError::BadRequest(msg),
            BillingError::SubscriptionNotFound(_) => ApiError::NotFound,
            BillingError::AlreadySubscribed(msg) => ApiError::Conflict(msg),
            BillingError::StripeApi(msg) => ApiError::PaymentGateway(msg),
            BillingError::Database(msg) => ApiError::Database(msg),
            BillingError::NoActiveFreeTier => ApiError::ServiceUnavailable,
            // Duplicate deliveries are acknowledged in the webhook handler
            // before conversion; reaching here means a non-webhook code path
            // surfaced one.
            BillingError::DuplicateEvent(msg) => ApiError::Conflict(msg),
            // Non-2xx keeps gateway redelivery alive for events that outran
            // the local subscription row.
            BillingError::MissingSubscriptionReference(_) => ApiError::NotFound,
            BillingError::Accounting(_)
            | BillingError::Directory(_)
            | BillingError::Config(_)
            | BillingError::Internal(_) => ApiError::Internal,
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billing_error_mapping() {
        assert!(matches!(
            ApiError::from(BillingError::SignatureInvalid),
            ApiError::InvalidSignature
        ));
        assert!(matches!(
            ApiError::from(BillingError::AlreadySubscribed("u1".to_string())),
            ApiError::Conflict(_)
        ));
        assert!(matches!(
            ApiError::from(BillingError::SubscriptionNotFound("u1".to_string())),
            ApiError::NotFound
        ));
        assert!(matches!(
            ApiError::from(BillingError::InvalidAmount(-5)),
            ApiError::BadRequest(_)
        ));
    }
}
