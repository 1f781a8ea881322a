//! Subscription lifecycle service
//!
//! Orchestrates the free/paid transitions: lab onboarding, upgrades,
//! cancellation and the downgrade back to free. Local database writes are
//! durable and come first; ledger and directory updates run afterwards and
//! never fail the operation.

use std::collections::HashMap;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::accounting::AccountingClient;
use crate::client::StripeClient;
use crate::credits::WELCOME_CREDITS;
use crate::directory::{set_plan_best_effort, DirectoryClient};
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::model::{
    BillingInterval, PaymentStatus, Subscription, SubscriptionSource, SubscriptionStatus,
};
use crate::repo::{NewPaidSubscription, PaymentRecord, SubscriptionRepository};
use crate::tier::{SubscriptionTier, TierKind};

/// A paid subscription snapshot pulled out of a gateway subscription object.
#[derive(Debug, Clone)]
pub struct GatewaySubscription {
    pub stripe_subscription_id: String,
    pub stripe_customer_id: String,
    pub stripe_price_id: String,
    pub status: SubscriptionStatus,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<OffsetDateTime>,
    pub amount: i64,
    pub currency: String,
    pub interval: BillingInterval,
}

impl GatewaySubscription {
    /// Flatten the fields this service needs out of the gateway object.
    /// The price comes from the first subscription item; plans here always
    /// have exactly one.
    pub fn from_stripe(sub: &stripe::Subscription) -> BillingResult<Self> {
        let customer_id = match &sub.customer {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(customer) => customer.id.to_string(),
        };

        let item = sub
            .items
            .data
            .first()
            .ok_or_else(|| BillingError::MalformedEvent("subscription has no items".to_string()))?;
        let price = item
            .price
            .as_ref()
            .ok_or_else(|| BillingError::MalformedEvent("subscription item has no price".to_string()))?;

        let interval = match price.recurring.as_ref().map(|r| r.interval) {
            Some(stripe::RecurringInterval::Year) => BillingInterval::Year,
            _ => BillingInterval::Month,
        };

        Ok(Self {
            stripe_subscription_id: sub.id.to_string(),
            stripe_customer_id: customer_id,
            stripe_price_id: price.id.to_string(),
            status: SubscriptionStatus::from_stripe(sub.status),
            current_period_start: timestamp(sub.current_period_start)?,
            current_period_end: timestamp(sub.current_period_end)?,
            cancel_at_period_end: sub.cancel_at_period_end,
            canceled_at: sub.canceled_at.map(timestamp).transpose()?,
            amount: price.unit_amount.unwrap_or(0),
            currency: price
                .currency
                .map(|c| c.to_string())
                .unwrap_or_else(|| "chf".to_string()),
            interval,
        })
    }
}

pub(crate) fn expandable_id<T: stripe::Object>(expandable: &stripe::Expandable<T>) -> String
where
    T::Id: ToString,
{
    match expandable {
        stripe::Expandable::Id(id) => id.to_string(),
        stripe::Expandable::Object(obj) => obj.id().to_string(),
    }
}

pub(crate) fn timestamp(ts: i64) -> BillingResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts)
        .map_err(|_| BillingError::MalformedEvent(format!("timestamp out of range: {ts}")))
}

/// Status for a free subscription created while the user may already hold a
/// paid one. A live paid subscription keeps the free row dormant from day
/// one.
pub(crate) fn initial_free_status(has_active_paid: bool) -> SubscriptionStatus {
    if has_active_paid {
        SubscriptionStatus::Paused
    } else {
        SubscriptionStatus::Active
    }
}

#[derive(Clone)]
pub struct SubscriptionService {
    repo: SubscriptionRepository,
    stripe: StripeClient,
    accounting: AccountingClient,
    directory: DirectoryClient,
    events: BillingEventLogger,
}

impl SubscriptionService {
    pub fn new(
        repo: SubscriptionRepository,
        stripe: StripeClient,
        accounting: AccountingClient,
        directory: DirectoryClient,
        events: BillingEventLogger,
    ) -> Self {
        Self {
            repo,
            stripe,
            accounting,
            directory,
            events,
        }
    }

    pub fn repo(&self) -> &SubscriptionRepository {
        &self.repo
    }

    pub fn stripe(&self) -> &StripeClient {
        &self.stripe
    }

    pub fn accounting(&self) -> &AccountingClient {
        &self.accounting
    }

    pub fn directory(&self) -> &DirectoryClient {
        &self.directory
    }

    pub fn events(&self) -> &BillingEventLogger {
        &self.events
    }

    /// Onboard a virtual lab: open its ledger account, create the user's
    /// free subscription and grant the welcome credits. The subscription
    /// row is the durable part; ledger and directory calls are best-effort.
    pub async fn activate_free_subscription(
        &self,
        user_id: Uuid,
        virtual_lab_id: Uuid,
        lab_name: &str,
    ) -> BillingResult<Subscription> {
        if self.repo.get_free_by_user(user_id).await?.is_some() {
            return Err(BillingError::AlreadySubscribed(user_id.to_string()));
        }

        let has_paid = self.repo.get_active_paid_by_user(user_id).await?.is_some();
        let status = initial_free_status(has_paid);
        let subscription = self
            .repo
            .create_free_subscription(user_id, Some(virtual_lab_id), status, SubscriptionSource::Api)
            .await?;

        if let Err(e) = self.accounting.create_account(virtual_lab_id, lab_name).await {
            tracing::warn!(%virtual_lab_id, error = %e, "Failed to open ledger account for new lab");
        } else if let Err(e) = self.accounting.top_up(virtual_lab_id, WELCOME_CREDITS).await {
            tracing::warn!(%virtual_lab_id, error = %e, "Failed to grant welcome credits");
        } else {
            self.events
                .log_event_best_effort(
                    BillingEventBuilder::new(user_id, BillingEventType::WelcomeCreditsGranted)
                        .data(serde_json::json!({
                            "virtual_lab_id": virtual_lab_id,
                            "credits": WELCOME_CREDITS,
                        }))
                        .actor_type(ActorType::System),
                )
                .await;
        }

        if !has_paid {
            set_plan_best_effort(&self.directory, user_id, TierKind::Free.as_str()).await;
        }

        self.events
            .log_event_best_effort(
                BillingEventBuilder::new(user_id, BillingEventType::SubscriptionCreated)
                    .data(serde_json::json!({
                        "kind": "free",
                        "status": subscription.status,
                    }))
                    .actor_type(ActorType::User),
            )
            .await;

        Ok(subscription)
    }

    /// Upgrade a user to a paid tier. The gateway charge is synchronous;
    /// if it fails, nothing is persisted locally. On success the free
    /// subscription is paused, not deleted.
    pub async fn upgrade_to_paid(
        &self,
        user_id: Uuid,
        virtual_lab_id: Option<Uuid>,
        email: &str,
        tier_kind: TierKind,
        yearly: bool,
    ) -> BillingResult<Subscription> {
        if tier_kind == TierKind::Free {
            return Err(BillingError::TierNotFound("free is not a paid tier".to_string()));
        }
        if let Some(existing) = self.repo.get_active_paid_by_user(user_id).await? {
            return Err(BillingError::AlreadySubscribed(existing.id.to_string()));
        }

        let tier = self
            .repo
            .get_tier_by_kind(tier_kind)
            .await?
            .ok_or_else(|| BillingError::TierNotFound(tier_kind.to_string()))?;
        let price_id = tier
            .price_id_for_interval(yearly)
            .ok_or_else(|| {
                BillingError::TierNotFound(format!(
                    "tier {tier_kind} has no {} price",
                    if yearly { "yearly" } else { "monthly" }
                ))
            })?
            .to_string();

        let customer_id = self.stripe.create_customer(email, &user_id.to_string()).await?;

        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), user_id.to_string());
        if let Some(lab_id) = virtual_lab_id {
            metadata.insert("virtual_lab_id".to_string(), lab_id.to_string());
        }
        let gateway_sub = self
            .stripe
            .create_subscription(customer_id.as_str(), &price_id, metadata)
            .await?;
        let snapshot = GatewaySubscription::from_stripe(&gateway_sub)?;

        let subscription = self
            .repo
            .create_paid_subscription(NewPaidSubscription {
                user_id,
                virtual_lab_id,
                tier_id: tier.id,
                status: snapshot.status,
                current_period_start: snapshot.current_period_start,
                current_period_end: snapshot.current_period_end,
                source: SubscriptionSource::Api,
                stripe_subscription_id: snapshot.stripe_subscription_id.clone(),
                stripe_price_id: snapshot.stripe_price_id.clone(),
                stripe_customer_id: snapshot.stripe_customer_id.clone(),
                cancel_at_period_end: snapshot.cancel_at_period_end,
                auto_renew: !snapshot.cancel_at_period_end,
                amount: snapshot.amount,
                currency: snapshot.currency.clone(),
                interval: snapshot.interval,
            })
            .await?;

        // The first invoice was charged synchronously. Record it and grant
        // the cycle credits now instead of waiting for the payment webhook:
        // the webhook can arrive before the local row above exists, in which
        // case its delivery is acked and never retried. The payment row is
        // the idempotency gate either way, so whichever writer lands first
        // grants exactly once.
        if snapshot.status == SubscriptionStatus::Active {
            if let Some(invoice) = &gateway_sub.latest_invoice {
                self.settle_initial_invoice(&subscription, &snapshot, expandable_id(invoice))
                    .await?;
            }
        }

        if self.repo.pause_free_subscription(user_id).await? {
            self.events
                .log_event_best_effort(
                    BillingEventBuilder::new(user_id, BillingEventType::FreeSubscriptionPaused)
                        .actor_type(ActorType::System),
                )
                .await;
        }

        set_plan_best_effort(&self.directory, user_id, tier_kind.as_str()).await;

        self.events
            .log_event_best_effort(
                BillingEventBuilder::new(user_id, BillingEventType::SubscriptionCreated)
                    .data(serde_json::json!({
                        "kind": "paid",
                        "tier": tier_kind,
                        "interval": snapshot.interval,
                    }))
                    .stripe_subscription(snapshot.stripe_subscription_id)
                    .actor_type(ActorType::User),
            )
            .await;

        Ok(subscription)
    }

    /// Record the first invoice of a newly created paid subscription as a
    /// succeeded payment and apply its credit grant.
    async fn settle_initial_invoice(
        &self,
        subscription: &Subscription,
        snapshot: &GatewaySubscription,
        invoice_id: String,
    ) -> BillingResult<()> {
        let outcome = self
            .repo
            .record_payment(PaymentRecord {
                subscription_id: Some(subscription.id),
                virtual_lab_id: subscription.virtual_lab_id,
                stripe_invoice_id: Some(invoice_id),
                stripe_payment_intent_id: None,
                stripe_charge_id: None,
                card_brand: None,
                card_last4: None,
                amount: snapshot.amount,
                currency: snapshot.currency.clone(),
                status: PaymentStatus::Succeeded,
                period_start: snapshot.current_period_start,
                period_end: snapshot.current_period_end,
                standalone: false,
                receipt_url: None,
            })
            .await?;
        if outcome.newly_succeeded {
            self.grant_cycle_credits(subscription, None).await;
        }
        Ok(())
    }

    /// Apply the tier's credit grant for a successful billing-cycle
    /// payment. Yearly prices grant the yearly figure. Best-effort: the
    /// payment row is already durable, a ledger failure only logs.
    pub(crate) async fn grant_cycle_credits(
        &self,
        subscription: &Subscription,
        stripe_event_id: Option<&str>,
    ) {
        let Some(paid) = subscription.paid() else {
            return;
        };
        let Some(lab_id) = subscription.virtual_lab_id else {
            tracing::warn!(
                subscription_id = %subscription.id,
                "Successful payment for subscription without a virtual lab, no credits granted"
            );
            return;
        };

        let tier = match self.repo.get_tier_by_id(subscription.tier_id).await {
            Ok(Some(tier)) => tier,
            Ok(None) => {
                tracing::warn!(tier_id = %subscription.tier_id, "Tier missing for credit grant");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Tier lookup failed for credit grant");
                return;
            }
        };
        let credits = tier.credits_for_price(&paid.stripe_price_id);

        match self.accounting.top_up(lab_id, credits).await {
            Ok(response) => {
                let actor = if stripe_event_id.is_some() {
                    ActorType::Stripe
                } else {
                    ActorType::System
                };
                let mut builder =
                    BillingEventBuilder::new(subscription.user_id, BillingEventType::CreditsGranted)
                        .data(serde_json::json!({
                            "virtual_lab_id": lab_id,
                            "credits": credits,
                            "balance": response.balance,
                        }))
                        .actor_type(actor);
                if let Some(event_id) = stripe_event_id {
                    builder = builder.stripe_event(event_id);
                }
                self.events.log_event_best_effort(builder).await;
            }
            Err(e) => {
                tracing::warn!(%lab_id, credits, error = %e, "Failed to grant subscription credits");
            }
        }
    }

    /// Cancel the user's paid subscription. Default is at period end, which
    /// flips auto-renew on the gateway; `immediate` cancels now. In both
    /// cases the local downgrade happens when the gateway's deletion webhook
    /// arrives, keeping one source of truth for the transition.
    pub async fn cancel_paid_subscription(
        &self,
        user_id: Uuid,
        immediate: bool,
    ) -> BillingResult<Subscription> {
        let subscription = self
            .repo
            .get_active_paid_by_user(user_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(user_id.to_string()))?;
        let paid = subscription
            .paid()
            .ok_or_else(|| BillingError::Internal("paid subscription without details".to_string()))?;

        if immediate {
            self.stripe
                .cancel_subscription(&paid.stripe_subscription_id)
                .await?;
        } else {
            self.stripe
                .set_cancel_at_period_end(&paid.stripe_subscription_id, true)
                .await?;
        }

        self.events
            .log_event_best_effort(
                BillingEventBuilder::new(user_id, BillingEventType::SubscriptionCanceled)
                    .data(serde_json::json!({ "immediate": immediate }))
                    .stripe_subscription(paid.stripe_subscription_id.clone())
                    .actor_type(ActorType::User),
            )
            .await;

        // Return the current local record; its status changes once the
        // gateway webhook lands.
        self.repo
            .get_by_id(subscription.id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(subscription.id.to_string()))
    }

    /// Put the user back on the free tier. Reactivates the existing free
    /// subscription (bumping its usage count) or creates one if the user
    /// never had one.
    pub async fn downgrade_to_free(&self, user_id: Uuid, actor: ActorType) -> BillingResult<Subscription> {
        let subscription = self.repo.downgrade_to_free(user_id).await?;

        set_plan_best_effort(&self.directory, user_id, TierKind::Free.as_str()).await;

        self.events
            .log_event_best_effort(
                BillingEventBuilder::new(user_id, BillingEventType::DowngradedToFree)
                    .data(serde_json::json!({
                        "usage_count": subscription.free().map(|f| f.usage_count),
                    }))
                    .actor_type(actor),
            )
            .await;

        Ok(subscription)
    }

    /// Start a one-time credit top-up purchase. The credits land when the
    /// payment webhook confirms the charge.
    pub async fn create_standalone_payment(
        &self,
        user_id: Uuid,
        virtual_lab_id: Uuid,
        email: &str,
        amount_minor: i64,
        currency: &str,
    ) -> BillingResult<stripe::PaymentIntent> {
        if amount_minor <= 0 {
            return Err(BillingError::InvalidAmount(amount_minor));
        }

        let customer_id = self.stripe.create_customer(email, &user_id.to_string()).await?;
        self.stripe
            .create_standalone_payment_intent(
                amount_minor,
                currency,
                customer_id.as_str(),
                &virtual_lab_id.to_string(),
            )
            .await
    }

    pub async fn list_subscriptions(&self, user_id: Uuid) -> BillingResult<Vec<Subscription>> {
        self.repo.list_by_user(user_id).await
    }

    pub async fn list_tiers(&self) -> BillingResult<Vec<SubscriptionTier>> {
        self.repo.list_active_tiers().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_free_status() {
        assert_eq!(initial_free_status(false), SubscriptionStatus::Active);
        assert_eq!(initial_free_status(true), SubscriptionStatus::Paused);
    }

    #[test]
    fn test_timestamp_conversion() {
        let ts = timestamp(1_700_000_000).unwrap();
        assert_eq!(ts.unix_timestamp(), 1_700_000_000);
        assert!(timestamp(i64::MAX).is_err());
    }

    use crate::client::StripeConfig;

    async fn test_service(accounting_url: String) -> SubscriptionService {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for DB tests");
        let pool = vlabs_shared::db::create_pool(&url, 2)
            .await
            .expect("failed to connect");
        let repo = SubscriptionRepository::new(pool.clone());
        let stripe = StripeClient::new(StripeConfig {
            secret_key: "sk_test_offline".to_string(),
            webhook_secret: "whsec_test".to_string(),
        });
        let accounting = AccountingClient::new(accounting_url);
        // Unroutable; directory updates are best-effort and only warn.
        let directory = DirectoryClient::new("http://127.0.0.1:9".to_string());
        let events = BillingEventLogger::new(pool);
        SubscriptionService::new(repo, stripe, accounting, directory, events)
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_initial_invoice_settles_exactly_once() {
        let mut server = mockito::Server::new_async().await;
        let lab_id = Uuid::new_v4();
        let top_up = server
            .mock("POST", "/budget/top-up")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(format!(
                r#"{{"virtual_lab_id": "{lab_id}", "balance": 70}}"#
            ))
            .expect(1)
            .create_async()
            .await;
        let service = test_service(server.url()).await;

        let user_id = Uuid::new_v4();
        let tier = service
            .repo()
            .get_tier_by_kind(TierKind::Pro)
            .await
            .expect("tier lookup")
            .expect("pro tier seeded");
        let now = OffsetDateTime::now_utc();
        let snapshot = GatewaySubscription {
            stripe_subscription_id: format!("sub_test_{}", Uuid::new_v4()),
            stripe_customer_id: format!("cus_test_{}", Uuid::new_v4()),
            stripe_price_id: tier
                .stripe_monthly_price_id
                .clone()
                .expect("pro monthly price"),
            status: SubscriptionStatus::Active,
            current_period_start: now,
            current_period_end: now,
            cancel_at_period_end: false,
            canceled_at: None,
            amount: tier.monthly_amount,
            currency: tier.currency.clone(),
            interval: BillingInterval::Month,
        };
        let subscription = service
            .repo()
            .create_paid_subscription(NewPaidSubscription {
                user_id,
                virtual_lab_id: Some(lab_id),
                tier_id: tier.id,
                status: snapshot.status,
                current_period_start: snapshot.current_period_start,
                current_period_end: snapshot.current_period_end,
                source: SubscriptionSource::Api,
                stripe_subscription_id: snapshot.stripe_subscription_id.clone(),
                stripe_price_id: snapshot.stripe_price_id.clone(),
                stripe_customer_id: snapshot.stripe_customer_id.clone(),
                cancel_at_period_end: false,
                auto_renew: true,
                amount: snapshot.amount,
                currency: snapshot.currency.clone(),
                interval: snapshot.interval,
            })
            .await
            .expect("create paid sub");

        let invoice_id = format!("in_test_{}", Uuid::new_v4());
        service
            .settle_initial_invoice(&subscription, &snapshot, invoice_id.clone())
            .await
            .expect("settle");
        // The payment webhook landing afterwards finds the succeeded row
        // and has nothing left to grant, and vice versa.
        service
            .settle_initial_invoice(&subscription, &snapshot, invoice_id)
            .await
            .expect("settle again");
        top_up.assert_async().await;
    }
}
