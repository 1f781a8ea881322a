//! Billing error types

use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Webhook signature verification failed")]
    SignatureInvalid,

    #[error("Malformed webhook event: {0}")]
    MalformedEvent(String),

    /// Internal signal only; mapped to an idempotent success at the
    /// webhook boundary, never surfaced to the event sender.
    #[error("Event already processed: {0}")]
    DuplicateEvent(String),

    /// Payment event references a subscription this service has no record
    /// of. Acknowledged to the sender (a redelivery would not help), logged
    /// as a data inconsistency.
    #[error("No subscription record for external id: {0}")]
    MissingSubscriptionReference(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("User already has an active subscription: {0}")]
    AlreadySubscribed(String),

    #[error("Subscription tier not found: {0}")]
    TierNotFound(String),

    /// The downgrade path requires an active FREE tier row to exist.
    #[error("No active FREE tier configured")]
    NoActiveFreeTier,

    #[error("Invalid payment amount: {0}")]
    InvalidAmount(i64),

    #[error("Accounting service error: {0}")]
    Accounting(String),

    #[error("Identity directory error: {0}")]
    Directory(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        BillingError::Accounting(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
