//! Subscription tier catalog
//!
//! Tiers are rows, not code: each carries its Stripe price ids, amounts and
//! credit grants, and the webhook path resolves a price id back to a tier at
//! event time. Only rows with `active = true` participate in resolution, so
//! a price rotation is a row update rather than a deploy.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingError;

/// Well-known tier names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
    Free,
    Pro,
    Premium,
}

impl TierKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TierKind::Free => "free",
            TierKind::Pro => "pro",
            TierKind::Premium => "premium",
        }
    }

    pub fn parse(s: &str) -> Result<Self, BillingError> {
        match s.to_lowercase().as_str() {
            "free" => Ok(TierKind::Free),
            "pro" => Ok(TierKind::Pro),
            "premium" => Ok(TierKind::Premium),
            other => Err(BillingError::TierNotFound(other.to_string())),
        }
    }
}

impl std::fmt::Display for TierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tier catalog row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SubscriptionTier {
    pub id: Uuid,
    /// Tier name, one of the [`TierKind`] values
    pub tier: String,
    pub stripe_monthly_price_id: Option<String>,
    pub stripe_yearly_price_id: Option<String>,
    /// Minor currency units per month; 0 for the free tier
    pub monthly_amount: i64,
    /// Minor currency units per year; 0 for the free tier
    pub yearly_amount: i64,
    pub currency: String,
    /// Credits granted on a successful monthly-cycle payment
    pub monthly_credits: i64,
    /// Credits granted on a successful yearly-cycle payment
    pub yearly_credits: i64,
    pub active: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl SubscriptionTier {
    pub fn kind(&self) -> Result<TierKind, BillingError> {
        TierKind::parse(&self.tier)
    }

    /// Whether `price_id` is this tier's yearly price.
    pub fn is_yearly_price(&self, price_id: &str) -> bool {
        self.stripe_yearly_price_id.as_deref() == Some(price_id)
    }

    /// Whether `price_id` belongs to this tier at all.
    pub fn matches_price(&self, price_id: &str) -> bool {
        self.stripe_monthly_price_id.as_deref() == Some(price_id)
            || self.stripe_yearly_price_id.as_deref() == Some(price_id)
    }

    /// Credit grant for a payment against `price_id`. Yearly prices grant
    /// the yearly figure, anything else the monthly one.
    pub fn credits_for_price(&self, price_id: &str) -> i64 {
        if self.is_yearly_price(price_id) {
            self.yearly_credits
        } else {
            self.monthly_credits
        }
    }

    /// Price id for the requested interval, if the tier sells one.
    pub fn price_id_for_interval(&self, yearly: bool) -> Option<&str> {
        if yearly {
            self.stripe_yearly_price_id.as_deref()
        } else {
            self.stripe_monthly_price_id.as_deref()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pro_tier() -> SubscriptionTier {
        SubscriptionTier {
            id: Uuid::new_v4(),
            tier: "pro".to_string(),
            stripe_monthly_price_id: Some("price_pro_month".to_string()),
            stripe_yearly_price_id: Some("price_pro_year".to_string()),
            monthly_amount: 1400,
            yearly_amount: 13000,
            currency: "chf".to_string(),
            monthly_credits: 70,
            yearly_credits: 650,
            active: true,
            created_at: OffsetDateTime::UNIX_EPOCH,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn test_credits_follow_billing_interval() {
        let tier = pro_tier();
        assert_eq!(tier.credits_for_price("price_pro_year"), 650);
        assert_eq!(tier.credits_for_price("price_pro_month"), 70);
        // Unknown price falls back to monthly
        assert_eq!(tier.credits_for_price("price_other"), 70);
    }

    #[test]
    fn test_price_matching() {
        let tier = pro_tier();
        assert!(tier.matches_price("price_pro_month"));
        assert!(tier.matches_price("price_pro_year"));
        assert!(!tier.matches_price("price_premium_month"));
        assert!(tier.is_yearly_price("price_pro_year"));
        assert!(!tier.is_yearly_price("price_pro_month"));
    }

    #[test]
    fn test_tier_kind_parse() {
        assert_eq!(TierKind::parse("PRO").unwrap(), TierKind::Pro);
        assert_eq!(TierKind::parse("free").unwrap(), TierKind::Free);
        assert!(TierKind::parse("platinum").is_err());
    }
}
