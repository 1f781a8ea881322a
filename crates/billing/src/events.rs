//! Append-only billing audit trail
//!
//! Every state-changing billing operation leaves one row here, so "why is
//! this user on this plan?" is answerable from the database alone. Rows are
//! never updated or deleted.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Types of billing audit events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingEventType {
    // Subscription lifecycle
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionCanceled,
    DowngradedToFree,
    FreeSubscriptionPaused,
    FreeSubscriptionReactivated,

    // Payments
    PaymentSucceeded,
    PaymentFailed,
    PaymentRefunded,
    DisputeCreated,
    StandaloneTopUp,

    // Credits
    CreditsGranted,
    WelcomeCreditsGranted,

    // Webhook bookkeeping
    WebhookIgnored,
    WebhookOrphaned,
}

impl std::fmt::Display for BillingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BillingEventType::SubscriptionCreated => "SUBSCRIPTION_CREATED",
            BillingEventType::SubscriptionUpdated => "SUBSCRIPTION_UPDATED",
            BillingEventType::SubscriptionCanceled => "SUBSCRIPTION_CANCELED",
            BillingEventType::DowngradedToFree => "DOWNGRADED_TO_FREE",
            BillingEventType::FreeSubscriptionPaused => "FREE_SUBSCRIPTION_PAUSED",
            BillingEventType::FreeSubscriptionReactivated => "FREE_SUBSCRIPTION_REACTIVATED",
            BillingEventType::PaymentSucceeded => "PAYMENT_SUCCEEDED",
            BillingEventType::PaymentFailed => "PAYMENT_FAILED",
            BillingEventType::PaymentRefunded => "PAYMENT_REFUNDED",
            BillingEventType::DisputeCreated => "DISPUTE_CREATED",
            BillingEventType::StandaloneTopUp => "STANDALONE_TOP_UP",
            BillingEventType::CreditsGranted => "CREDITS_GRANTED",
            BillingEventType::WelcomeCreditsGranted => "WELCOME_CREDITS_GRANTED",
            BillingEventType::WebhookIgnored => "WEBHOOK_IGNORED",
            BillingEventType::WebhookOrphaned => "WEBHOOK_ORPHANED",
        };
        write!(f, "{}", s)
    }
}

/// Who triggered the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorType {
    /// End user through the API
    User,
    /// Operational script
    Script,
    /// System automation
    System,
    /// Stripe webhook
    Stripe,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::User => write!(f, "user"),
            ActorType::Script => write!(f, "script"),
            ActorType::System => write!(f, "system"),
            ActorType::Stripe => write!(f, "stripe"),
        }
    }
}

/// A billing audit event record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingEvent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub stripe_event_id: Option<String>,
    pub stripe_invoice_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub actor_type: String,
    pub created_at: OffsetDateTime,
}

/// Builder for audit events
pub struct BillingEventBuilder {
    user_id: Uuid,
    event_type: BillingEventType,
    event_data: serde_json::Value,
    stripe_event_id: Option<String>,
    stripe_invoice_id: Option<String>,
    stripe_subscription_id: Option<String>,
    actor_type: ActorType,
}

impl BillingEventBuilder {
    pub fn new(user_id: Uuid, event_type: BillingEventType) -> Self {
        Self {
            user_id,
            event_type,
            event_data: serde_json::json!({}),
            stripe_event_id: None,
            stripe_invoice_id: None,
            stripe_subscription_id: None,
            actor_type: ActorType::System,
        }
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.event_data = data;
        self
    }

    pub fn stripe_event(mut self, event_id: impl Into<String>) -> Self {
        self.stripe_event_id = Some(event_id.into());
        self
    }

    pub fn stripe_invoice(mut self, invoice_id: impl Into<String>) -> Self {
        self.stripe_invoice_id = Some(invoice_id.into());
        self
    }

    pub fn stripe_subscription(mut self, subscription_id: impl Into<String>) -> Self {
        self.stripe_subscription_id = Some(subscription_id.into());
        self
    }

    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }
}

/// Service for recording and querying audit events
#[derive(Clone)]
pub struct BillingEventLogger {
    pool: PgPool,
}

impl BillingEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn log_event(&self, builder: BillingEventBuilder) -> BillingResult<Uuid> {
        let event_id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO billing_events (
                user_id,
                event_type,
                event_data,
                stripe_event_id,
                stripe_invoice_id,
                stripe_subscription_id,
                actor_type
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(builder.user_id)
        .bind(builder.event_type.to_string())
        .bind(&builder.event_data)
        .bind(&builder.stripe_event_id)
        .bind(&builder.stripe_invoice_id)
        .bind(&builder.stripe_subscription_id)
        .bind(builder.actor_type.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(event_id.0)
    }

    /// Audit writes never fail the surrounding operation; a lost audit row
    /// is logged and dropped.
    pub async fn log_event_best_effort(&self, builder: BillingEventBuilder) {
        let event_type = builder.event_type;
        if let Err(e) = self.log_event(builder).await {
            tracing::warn!(%event_type, error = %e, "Failed to record billing audit event");
        }
    }

    pub async fn get_events_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<BillingEvent>> {
        let events: Vec<BillingEvent> = sqlx::query_as(
            r#"
            SELECT id, user_id, event_type, event_data, stripe_event_id,
                   stripe_invoice_id, stripe_subscription_id, actor_type, created_at
            FROM billing_events
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    pub async fn get_events_for_subscription(
        &self,
        stripe_subscription_id: &str,
        limit: i64,
    ) -> BillingResult<Vec<BillingEvent>> {
        let events: Vec<BillingEvent> = sqlx::query_as(
            r#"
            SELECT id, user_id, event_type, event_data, stripe_event_id,
                   stripe_invoice_id, stripe_subscription_id, actor_type, created_at
            FROM billing_events
            WHERE stripe_subscription_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(stripe_subscription_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for BillingEvent {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            event_type: row.try_get("event_type")?,
            event_data: row.try_get("event_data")?,
            stripe_event_id: row.try_get("stripe_event_id")?,
            stripe_invoice_id: row.try_get("stripe_invoice_id")?,
            stripe_subscription_id: row.try_get("stripe_subscription_id")?,
            actor_type: row.try_get("actor_type")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billing_event_type_display() {
        assert_eq!(
            BillingEventType::SubscriptionCreated.to_string(),
            "SUBSCRIPTION_CREATED"
        );
        assert_eq!(
            BillingEventType::DowngradedToFree.to_string(),
            "DOWNGRADED_TO_FREE"
        );
        assert_eq!(
            BillingEventType::StandaloneTopUp.to_string(),
            "STANDALONE_TOP_UP"
        );
    }

    #[test]
    fn test_actor_type_display() {
        assert_eq!(ActorType::User.to_string(), "user");
        assert_eq!(ActorType::Script.to_string(), "script");
        assert_eq!(ActorType::System.to_string(), "system");
        assert_eq!(ActorType::Stripe.to_string(), "stripe");
    }

    #[test]
    fn test_event_builder() {
        let user_id = Uuid::new_v4();
        let builder = BillingEventBuilder::new(user_id, BillingEventType::PaymentSucceeded)
            .data(serde_json::json!({"amount": 1000}))
            .stripe_subscription("sub_123")
            .actor_type(ActorType::Stripe);

        assert_eq!(builder.user_id, user_id);
        assert_eq!(builder.event_type, BillingEventType::PaymentSucceeded);
        assert_eq!(builder.stripe_subscription_id, Some("sub_123".to_string()));
        assert_eq!(builder.actor_type, ActorType::Stripe);
    }
}
