//! Subscription domain records
//!
//! A subscription is one row in `subscriptions` plus exactly one extension
//! row keyed by the same id: `free_subscriptions` or `paid_subscriptions`.
//! The extension is modeled as a tagged variant ([`SubscriptionDetails`]),
//! discriminated by the `kind` column.

use serde::{Deserialize, Serialize};
use sqlx::Row;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingError;

/// Subscription status, mirroring the Stripe status vocabulary.
///
/// `PastDue` and the `Incomplete*` pair exist for gateway parity but are
/// never produced by this service's own transitions: payment is synchronous
/// at subscription creation, so no grace-period states occur locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Unpaid,
    Canceled,
    Incomplete,
    IncompleteExpired,
    Paused,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            SubscriptionStatus::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Result<Self, BillingError> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "unpaid" => Ok(SubscriptionStatus::Unpaid),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            "incomplete" => Ok(SubscriptionStatus::Incomplete),
            "incomplete_expired" => Ok(SubscriptionStatus::IncompleteExpired),
            "paused" => Ok(SubscriptionStatus::Paused),
            other => Err(BillingError::Internal(format!(
                "unknown subscription status: {other}"
            ))),
        }
    }

    /// Map a Stripe subscription status onto ours. `Trialing` counts as
    /// active (the gateway bills it as a live subscription).
    pub fn from_stripe(status: stripe::SubscriptionStatus) -> Self {
        match status {
            stripe::SubscriptionStatus::Active | stripe::SubscriptionStatus::Trialing => {
                SubscriptionStatus::Active
            }
            stripe::SubscriptionStatus::PastDue => SubscriptionStatus::PastDue,
            stripe::SubscriptionStatus::Unpaid => SubscriptionStatus::Unpaid,
            stripe::SubscriptionStatus::Canceled => SubscriptionStatus::Canceled,
            stripe::SubscriptionStatus::Incomplete => SubscriptionStatus::Incomplete,
            stripe::SubscriptionStatus::IncompleteExpired => SubscriptionStatus::IncompleteExpired,
            stripe::SubscriptionStatus::Paused => SubscriptionStatus::Paused,
        }
    }

    /// A status under which the paid subscription no longer grants access.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Canceled
                | SubscriptionStatus::Unpaid
                | SubscriptionStatus::IncompleteExpired
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a subscription row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionSource {
    /// Created through the API (user action)
    Api,
    /// Created by an operational script
    Script,
    /// Manual SQL repair
    Sql,
}

impl SubscriptionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionSource::Api => "api",
            SubscriptionSource::Script => "script",
            SubscriptionSource::Sql => "sql",
        }
    }

    pub fn parse(s: &str) -> Result<Self, BillingError> {
        match s {
            "api" => Ok(SubscriptionSource::Api),
            "script" => Ok(SubscriptionSource::Script),
            "sql" => Ok(SubscriptionSource::Sql),
            other => Err(BillingError::Internal(format!(
                "unknown subscription source: {other}"
            ))),
        }
    }
}

/// Payment status. A payment is immutable once `Succeeded`; that row is
/// the idempotency boundary for credit grants and ledger top-ups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Succeeded,
    Pending,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Pending => "pending",
            PaymentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, BillingError> {
        match s {
            "succeeded" => Ok(PaymentStatus::Succeeded),
            "pending" => Ok(PaymentStatus::Pending),
            "failed" => Ok(PaymentStatus::Failed),
            other => Err(BillingError::Internal(format!(
                "unknown payment status: {other}"
            ))),
        }
    }

    /// Side effects for this payment must not be repeated.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentStatus::Succeeded)
    }
}

/// Billing interval for paid subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    #[default]
    Month,
    Year,
}

impl BillingInterval {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "month" | "monthly" => Some(Self::Month),
            "year" | "yearly" | "annual" => Some(Self::Year),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Month => "month",
            BillingInterval::Year => "year",
        }
    }
}

/// Stripe-side details of a paid subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaidDetails {
    pub stripe_subscription_id: String,
    pub stripe_price_id: String,
    pub stripe_customer_id: String,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<OffsetDateTime>,
    pub auto_renew: bool,
    /// Amount in minor currency units per billing interval
    pub amount: i64,
    pub currency: String,
    pub interval: BillingInterval,
}

/// Free-tier details
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreeDetails {
    /// How many times this free subscription has been (re)activated by a
    /// downgrade. Starts at 0.
    pub usage_count: i32,
}

/// Extension data, discriminated by the `kind` column
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SubscriptionDetails {
    Free(FreeDetails),
    Paid(PaidDetails),
}

impl SubscriptionDetails {
    pub fn kind(&self) -> &'static str {
        match self {
            SubscriptionDetails::Free(_) => "free",
            SubscriptionDetails::Paid(_) => "paid",
        }
    }
}

/// A subscription record (base row + extension variant)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub virtual_lab_id: Option<Uuid>,
    pub tier_id: Uuid,
    pub status: SubscriptionStatus,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub source: SubscriptionSource,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub details: SubscriptionDetails,
}

impl Subscription {
    pub fn is_paid(&self) -> bool {
        matches!(self.details, SubscriptionDetails::Paid(_))
    }

    pub fn paid(&self) -> Option<&PaidDetails> {
        match &self.details {
            SubscriptionDetails::Paid(d) => Some(d),
            _ => None,
        }
    }

    pub fn free(&self) -> Option<&FreeDetails> {
        match &self.details {
            SubscriptionDetails::Free(d) => Some(d),
            _ => None,
        }
    }
}

// Assembled from the LEFT-JOINed query in the repository: base columns plus
// nullable extension columns from both side tables.
impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for Subscription {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        let kind: String = row.try_get("kind")?;
        let status: String = row.try_get("status")?;
        let source: String = row.try_get("source")?;

        let details = match kind.as_str() {
            "free" => SubscriptionDetails::Free(FreeDetails {
                usage_count: row.try_get("usage_count")?,
            }),
            "paid" => {
                let interval: String = row.try_get("billing_interval")?;
                SubscriptionDetails::Paid(PaidDetails {
                    stripe_subscription_id: row.try_get("stripe_subscription_id")?,
                    stripe_price_id: row.try_get("stripe_price_id")?,
                    stripe_customer_id: row.try_get("stripe_customer_id")?,
                    cancel_at_period_end: row.try_get("cancel_at_period_end")?,
                    canceled_at: row.try_get("canceled_at")?,
                    auto_renew: row.try_get("auto_renew")?,
                    amount: row.try_get("amount")?,
                    currency: row.try_get("currency")?,
                    interval: BillingInterval::from_str(&interval).unwrap_or_default(),
                })
            }
            other => {
                return Err(sqlx::Error::ColumnDecode {
                    index: "kind".to_string(),
                    source: format!("unknown subscription kind: {other}").into(),
                })
            }
        };

        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            virtual_lab_id: row.try_get("virtual_lab_id")?,
            tier_id: row.try_get("tier_id")?,
            status: SubscriptionStatus::parse(&status).map_err(|e| sqlx::Error::ColumnDecode {
                index: "status".to_string(),
                source: e.to_string().into(),
            })?,
            current_period_start: row.try_get("current_period_start")?,
            current_period_end: row.try_get("current_period_end")?,
            source: SubscriptionSource::parse(&source).map_err(|e| sqlx::Error::ColumnDecode {
                index: "source".to_string(),
                source: e.to_string().into(),
            })?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            details,
        })
    }
}

/// One row per payment event, subscription-linked or standalone top-up
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionPayment {
    pub id: Uuid,
    /// Absent for standalone top-ups that could not be tied to a
    /// subscription
    pub subscription_id: Option<Uuid>,
    pub virtual_lab_id: Option<Uuid>,
    pub stripe_invoice_id: Option<String>,
    pub stripe_payment_intent_id: Option<String>,
    pub stripe_charge_id: Option<String>,
    pub card_brand: Option<String>,
    pub card_last4: Option<String>,
    /// Amount in minor currency units
    pub amount: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
    /// One-time top-up rather than a billing-cycle payment
    pub standalone: bool,
    pub receipt_url: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for SubscriptionPayment {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        Ok(Self {
            id: row.try_get("id")?,
            subscription_id: row.try_get("subscription_id")?,
            virtual_lab_id: row.try_get("virtual_lab_id")?,
            stripe_invoice_id: row.try_get("stripe_invoice_id")?,
            stripe_payment_intent_id: row.try_get("stripe_payment_intent_id")?,
            stripe_charge_id: row.try_get("stripe_charge_id")?,
            card_brand: row.try_get("card_brand")?,
            card_last4: row.try_get("card_last4")?,
            amount: row.try_get("amount")?,
            currency: row.try_get("currency")?,
            status: PaymentStatus::parse(&status).map_err(|e| sqlx::Error::ColumnDecode {
                index: "status".to_string(),
                source: e.to_string().into(),
            })?,
            period_start: row.try_get("period_start")?,
            period_end: row.try_get("period_end")?,
            standalone: row.try_get("standalone")?,
            receipt_url: row.try_get("receipt_url")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for s in [
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Unpaid,
            SubscriptionStatus::Canceled,
            SubscriptionStatus::Incomplete,
            SubscriptionStatus::IncompleteExpired,
            SubscriptionStatus::Paused,
        ] {
            assert_eq!(SubscriptionStatus::parse(s.as_str()).unwrap(), s);
        }
        assert!(SubscriptionStatus::parse("bogus").is_err());
    }

    #[test]
    fn test_stripe_status_mapping() {
        assert_eq!(
            SubscriptionStatus::from_stripe(stripe::SubscriptionStatus::Trialing),
            SubscriptionStatus::Active
        );
        assert_eq!(
            SubscriptionStatus::from_stripe(stripe::SubscriptionStatus::Unpaid),
            SubscriptionStatus::Unpaid
        );
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(SubscriptionStatus::Canceled.is_terminal());
        assert!(SubscriptionStatus::Unpaid.is_terminal());
        assert!(!SubscriptionStatus::Active.is_terminal());
        assert!(!SubscriptionStatus::Paused.is_terminal());
    }

    #[test]
    fn test_payment_terminal_is_succeeded_only() {
        assert!(PaymentStatus::Succeeded.is_terminal());
        assert!(!PaymentStatus::Pending.is_terminal());
        assert!(!PaymentStatus::Failed.is_terminal());
    }

    #[test]
    fn test_billing_interval_aliases() {
        assert_eq!(BillingInterval::from_str("yearly"), Some(BillingInterval::Year));
        assert_eq!(BillingInterval::from_str("annual"), Some(BillingInterval::Year));
        assert_eq!(BillingInterval::from_str("month"), Some(BillingInterval::Month));
        assert_eq!(BillingInterval::from_str("weekly"), None);
    }
}
