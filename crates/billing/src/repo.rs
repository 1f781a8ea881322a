//! Postgres persistence for subscriptions, payments and webhook bookkeeping
//!
//! All multi-row changes run inside a transaction. Webhook idempotency lives
//! here too: [`SubscriptionRepository::claim_event`] is the single atomic
//! gate that decides whether a delivery gets processed.

use sqlx::PgPool;
use time::macros::datetime;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::model::{
    BillingInterval, PaymentStatus, Subscription, SubscriptionPayment, SubscriptionSource,
    SubscriptionStatus,
};
use crate::tier::{SubscriptionTier, TierKind};

/// Free subscriptions do not expire; their period end is a far-future
/// sentinel rather than NULL so period ordering checks stay uniform.
pub const FAR_FUTURE: OffsetDateTime = datetime!(9999-12-31 23:59:59 UTC);

/// Columns for assembling a [`Subscription`] from the base row plus both
/// extension tables.
const SUBSCRIPTION_SELECT: &str = r#"
    SELECT s.id, s.user_id, s.virtual_lab_id, s.tier_id, s.kind, s.status,
           s.current_period_start, s.current_period_end, s.source,
           s.created_at, s.updated_at,
           f.usage_count,
           p.stripe_subscription_id, p.stripe_price_id, p.stripe_customer_id,
           p.cancel_at_period_end, p.canceled_at, p.auto_renew,
           p.amount, p.currency, p.billing_interval
    FROM subscriptions s
    LEFT JOIN free_subscriptions f ON f.subscription_id = s.id
    LEFT JOIN paid_subscriptions p ON p.subscription_id = s.id
"#;

const PAYMENT_RETURNING: &str = r#"
    id, subscription_id, virtual_lab_id, stripe_invoice_id,
    stripe_payment_intent_id, stripe_charge_id, card_brand, card_last4,
    amount, currency, status, period_start, period_end, standalone,
    receipt_url, created_at, updated_at
"#;

/// Fields for inserting a paid subscription row.
#[derive(Debug, Clone)]
pub struct NewPaidSubscription {
    pub user_id: Uuid,
    pub virtual_lab_id: Option<Uuid>,
    pub tier_id: Uuid,
    pub status: SubscriptionStatus,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub source: SubscriptionSource,
    pub stripe_subscription_id: String,
    pub stripe_price_id: String,
    pub stripe_customer_id: String,
    pub cancel_at_period_end: bool,
    pub auto_renew: bool,
    pub amount: i64,
    pub currency: String,
    pub interval: BillingInterval,
}

/// Gateway-sourced update applied to a paid subscription by external id.
#[derive(Debug, Clone)]
pub struct PaidGatewayUpdate {
    pub status: SubscriptionStatus,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<OffsetDateTime>,
    pub auto_renew: bool,
    pub stripe_price_id: Option<String>,
    pub amount: Option<i64>,
    pub currency: Option<String>,
    pub interval: Option<BillingInterval>,
}

/// Incoming payment facts from a webhook or checkout path.
#[derive(Debug, Clone)]
pub struct PaymentRecord {
    pub subscription_id: Option<Uuid>,
    pub virtual_lab_id: Option<Uuid>,
    pub stripe_invoice_id: Option<String>,
    pub stripe_payment_intent_id: Option<String>,
    pub stripe_charge_id: Option<String>,
    pub card_brand: Option<String>,
    pub card_last4: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
    pub standalone: bool,
    pub receipt_url: Option<String>,
}

/// Result of [`SubscriptionRepository::record_payment`]. `newly_succeeded`
/// is true only on the transition into `succeeded`, which is when credit
/// grants and ledger top-ups may run.
#[derive(Debug, Clone)]
pub struct PaymentOutcome {
    pub payment: SubscriptionPayment,
    pub newly_succeeded: bool,
}

#[derive(Clone)]
pub struct SubscriptionRepository {
    pool: PgPool,
}

impl SubscriptionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ----- subscription lookups -----

    pub async fn get_by_id(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        let sql = format!("{SUBSCRIPTION_SELECT} WHERE s.id = $1");
        let row = sqlx::query_as::<_, Subscription>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn get_by_stripe_subscription_id(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let sql = format!("{SUBSCRIPTION_SELECT} WHERE p.stripe_subscription_id = $1");
        let row = sqlx::query_as::<_, Subscription>(&sql)
            .bind(stripe_subscription_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// The user's live paid subscription, if any. Terminal statuses do not
    /// count, so a canceled row never blocks a new upgrade.
    pub async fn get_active_paid_by_user(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        let sql = format!(
            "{SUBSCRIPTION_SELECT} \
             WHERE s.user_id = $1 AND s.kind = 'paid' \
               AND s.status NOT IN ('canceled', 'unpaid', 'incomplete_expired') \
             ORDER BY s.created_at DESC LIMIT 1"
        );
        let row = sqlx::query_as::<_, Subscription>(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// The user's free subscription regardless of its status. At most one
    /// exists per user.
    pub async fn get_free_by_user(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        let sql = format!("{SUBSCRIPTION_SELECT} WHERE s.user_id = $1 AND s.kind = 'free'");
        let row = sqlx::query_as::<_, Subscription>(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// The active subscription attached to a virtual lab, preferring a paid
    /// one when both kinds are live.
    pub async fn get_active_by_lab_id(
        &self,
        virtual_lab_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        let sql = format!(
            "{SUBSCRIPTION_SELECT} \
             WHERE s.virtual_lab_id = $1 AND s.status = 'active' \
             ORDER BY (s.kind = 'paid') DESC, s.created_at DESC LIMIT 1"
        );
        let row = sqlx::query_as::<_, Subscription>(&sql)
            .bind(virtual_lab_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn list_by_user(&self, user_id: Uuid) -> BillingResult<Vec<Subscription>> {
        let sql = format!("{SUBSCRIPTION_SELECT} WHERE s.user_id = $1 ORDER BY s.created_at DESC");
        let rows = sqlx::query_as::<_, Subscription>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    // ----- subscription writes -----

    /// Create a free subscription against the active free tier. `status` is
    /// `Active` for a fresh user, `Paused` when a paid subscription already
    /// exists at creation time.
    pub async fn create_free_subscription(
        &self,
        user_id: Uuid,
        virtual_lab_id: Option<Uuid>,
        status: SubscriptionStatus,
        source: SubscriptionSource,
    ) -> BillingResult<Subscription> {
        let tier = self
            .get_tier_by_kind(TierKind::Free)
            .await?
            .ok_or(BillingError::NoActiveFreeTier)?;

        let mut tx = self.pool.begin().await?;
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO subscriptions
                (id, user_id, virtual_lab_id, tier_id, kind, status,
                 current_period_start, current_period_end, source, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 'free', $5, NOW(), $6, $7, NOW(), NOW())
            "#,
        )
        .bind(id)
        .bind(user_id)
        .bind(virtual_lab_id)
        .bind(tier.id)
        .bind(status.as_str())
        .bind(FAR_FUTURE)
        .bind(source.as_str())
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO free_subscriptions (subscription_id, usage_count) VALUES ($1, 0)")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.get_by_id(id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(id.to_string()))
    }

    pub async fn create_paid_subscription(
        &self,
        new: NewPaidSubscription,
    ) -> BillingResult<Subscription> {
        let mut tx = self.pool.begin().await?;
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO subscriptions
                (id, user_id, virtual_lab_id, tier_id, kind, status,
                 current_period_start, current_period_end, source, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 'paid', $5, $6, $7, $8, NOW(), NOW())
            "#,
        )
        .bind(id)
        .bind(new.user_id)
        .bind(new.virtual_lab_id)
        .bind(new.tier_id)
        .bind(new.status.as_str())
        .bind(new.current_period_start)
        .bind(new.current_period_end)
        .bind(new.source.as_str())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO paid_subscriptions
                (subscription_id, stripe_subscription_id, stripe_price_id,
                 stripe_customer_id, cancel_at_period_end, canceled_at,
                 auto_renew, amount, currency, billing_interval)
            VALUES ($1, $2, $3, $4, $5, NULL, $6, $7, $8, $9)
            "#,
        )
        .bind(id)
        .bind(&new.stripe_subscription_id)
        .bind(&new.stripe_price_id)
        .bind(&new.stripe_customer_id)
        .bind(new.cancel_at_period_end)
        .bind(new.auto_renew)
        .bind(new.amount)
        .bind(&new.currency)
        .bind(new.interval.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.get_by_id(id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(id.to_string()))
    }

    pub async fn update_status(
        &self,
        id: Uuid,
        status: SubscriptionStatus,
    ) -> BillingResult<()> {
        sqlx::query("UPDATE subscriptions SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Apply a gateway subscription snapshot to the local paid row, keyed by
    /// the external id. Returns the refreshed record, or `None` when no
    /// local subscription references that id.
    pub async fn apply_gateway_update(
        &self,
        stripe_subscription_id: &str,
        update: PaidGatewayUpdate,
    ) -> BillingResult<Option<Subscription>> {
        let mut tx = self.pool.begin().await?;
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            "SELECT subscription_id FROM paid_subscriptions \
             WHERE stripe_subscription_id = $1 FOR UPDATE",
        )
        .bind(stripe_subscription_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((id,)) = claimed else {
            tx.rollback().await?;
            return Ok(None);
        };

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $2, current_period_start = $3, current_period_end = $4,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(update.status.as_str())
        .bind(update.current_period_start)
        .bind(update.current_period_end)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE paid_subscriptions
            SET cancel_at_period_end = $2,
                canceled_at = $3,
                auto_renew = $4,
                stripe_price_id = COALESCE($5, stripe_price_id),
                amount = COALESCE($6, amount),
                currency = COALESCE($7, currency),
                billing_interval = COALESCE($8, billing_interval)
            WHERE subscription_id = $1
            "#,
        )
        .bind(id)
        .bind(update.cancel_at_period_end)
        .bind(update.canceled_at)
        .bind(update.auto_renew)
        .bind(update.stripe_price_id.as_deref())
        .bind(update.amount)
        .bind(update.currency.as_deref())
        .bind(update.interval.map(|i| i.as_str()))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.get_by_id(id).await
    }

    /// Pause the user's free subscription. Called when a paid subscription
    /// becomes active; the free row is kept, never deleted, so its
    /// usage count survives the paid episode.
    pub async fn pause_free_subscription(&self, user_id: Uuid) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'paused', updated_at = NOW()
            WHERE user_id = $1 AND kind = 'free' AND status <> 'paused'
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Reactivate the user's free subscription, or create one if it is
    /// missing. Reactivation bumps `usage_count`; a row created here starts
    /// at the default count like any other.
    pub async fn downgrade_to_free(&self, user_id: Uuid) -> BillingResult<Subscription> {
        let mut tx = self.pool.begin().await?;
        let existing: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM subscriptions WHERE user_id = $1 AND kind = 'free' FOR UPDATE",
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let id = match existing {
            Some((id,)) => {
                sqlx::query(
                    r#"
                    UPDATE subscriptions
                    SET status = 'active', current_period_start = NOW(),
                        current_period_end = $2, updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(FAR_FUTURE)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    "UPDATE free_subscriptions SET usage_count = usage_count + 1 \
                     WHERE subscription_id = $1",
                )
                .bind(id)
                .execute(&mut *tx)
                .await?;
                id
            }
            None => {
                let tier: Option<(Uuid,)> = sqlx::query_as(
                    "SELECT id FROM subscription_tiers WHERE tier = 'free' AND active LIMIT 1",
                )
                .fetch_optional(&mut *tx)
                .await?;
                let (tier_id,) = tier.ok_or(BillingError::NoActiveFreeTier)?;

                let id = Uuid::new_v4();
                sqlx::query(
                    r#"
                    INSERT INTO subscriptions
                        (id, user_id, virtual_lab_id, tier_id, kind, status,
                         current_period_start, current_period_end, source,
                         created_at, updated_at)
                    VALUES ($1, $2, NULL, $3, 'free', 'active', NOW(), $4, 'api', NOW(), NOW())
                    "#,
                )
                .bind(id)
                .bind(user_id)
                .bind(tier_id)
                .bind(FAR_FUTURE)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    "INSERT INTO free_subscriptions (subscription_id, usage_count) VALUES ($1, 0)",
                )
                .bind(id)
                .execute(&mut *tx)
                .await?;
                id
            }
        };
        tx.commit().await?;

        self.get_by_id(id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(id.to_string()))
    }

    // ----- payments -----

    /// Insert or update a payment row, keyed by whichever gateway id is
    /// present (invoice first, then payment intent). A row already in
    /// `succeeded` is immutable; later deliveries return it untouched with
    /// `newly_succeeded = false`.
    pub async fn record_payment(&self, record: PaymentRecord) -> BillingResult<PaymentOutcome> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<(Uuid, String)> = if let Some(invoice_id) = &record.stripe_invoice_id
        {
            sqlx::query_as(
                "SELECT id, status FROM subscription_payments \
                 WHERE stripe_invoice_id = $1 FOR UPDATE",
            )
            .bind(invoice_id)
            .fetch_optional(&mut *tx)
            .await?
        } else if let Some(intent_id) = &record.stripe_payment_intent_id {
            sqlx::query_as(
                "SELECT id, status FROM subscription_payments \
                 WHERE stripe_payment_intent_id = $1 FOR UPDATE",
            )
            .bind(intent_id)
            .fetch_optional(&mut *tx)
            .await?
        } else {
            None
        };

        let outcome = match existing {
            Some((id, status)) if PaymentStatus::parse(&status)?.is_terminal() => {
                // Status and amount stay frozen, but a later charge event may
                // carry card details the invoice event lacked; fill only the
                // columns that are still NULL.
                let sql = format!(
                    r#"
                    UPDATE subscription_payments
                    SET stripe_charge_id = COALESCE(stripe_charge_id, $2),
                        card_brand = COALESCE(card_brand, $3),
                        card_last4 = COALESCE(card_last4, $4),
                        receipt_url = COALESCE(receipt_url, $5),
                        updated_at = NOW()
                    WHERE id = $1
                    RETURNING {PAYMENT_RETURNING}
                    "#
                );
                let payment = sqlx::query_as::<_, SubscriptionPayment>(&sql)
                    .bind(id)
                    .bind(record.stripe_charge_id.as_deref())
                    .bind(record.card_brand.as_deref())
                    .bind(record.card_last4.as_deref())
                    .bind(record.receipt_url.as_deref())
                    .fetch_one(&mut *tx)
                    .await?;
                PaymentOutcome {
                    payment,
                    newly_succeeded: false,
                }
            }
            Some((id, _)) => {
                let sql = format!(
                    r#"
                    UPDATE subscription_payments
                    SET status = $2, amount = $3, currency = $4,
                        stripe_payment_intent_id = COALESCE($5, stripe_payment_intent_id),
                        stripe_charge_id = COALESCE($6, stripe_charge_id),
                        card_brand = COALESCE($7, card_brand),
                        card_last4 = COALESCE($8, card_last4),
                        receipt_url = COALESCE($9, receipt_url),
                        period_start = $10, period_end = $11,
                        updated_at = NOW()
                    WHERE id = $1
                    RETURNING {PAYMENT_RETURNING}
                    "#
                );
                let payment = sqlx::query_as::<_, SubscriptionPayment>(&sql)
                    .bind(id)
                    .bind(record.status.as_str())
                    .bind(record.amount)
                    .bind(&record.currency)
                    .bind(record.stripe_payment_intent_id.as_deref())
                    .bind(record.stripe_charge_id.as_deref())
                    .bind(record.card_brand.as_deref())
                    .bind(record.card_last4.as_deref())
                    .bind(record.receipt_url.as_deref())
                    .bind(record.period_start)
                    .bind(record.period_end)
                    .fetch_one(&mut *tx)
                    .await?;
                PaymentOutcome {
                    newly_succeeded: record.status.is_terminal(),
                    payment,
                }
            }
            None => {
                let sql = format!(
                    r#"
                    INSERT INTO subscription_payments
                        (id, subscription_id, virtual_lab_id, stripe_invoice_id,
                         stripe_payment_intent_id, stripe_charge_id, card_brand,
                         card_last4, amount, currency, status, period_start,
                         period_end, standalone, receipt_url, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                            $14, $15, NOW(), NOW())
                    RETURNING {PAYMENT_RETURNING}
                    "#
                );
                let payment = sqlx::query_as::<_, SubscriptionPayment>(&sql)
                    .bind(Uuid::new_v4())
                    .bind(record.subscription_id)
                    .bind(record.virtual_lab_id)
                    .bind(record.stripe_invoice_id.as_deref())
                    .bind(record.stripe_payment_intent_id.as_deref())
                    .bind(record.stripe_charge_id.as_deref())
                    .bind(record.card_brand.as_deref())
                    .bind(record.card_last4.as_deref())
                    .bind(record.amount)
                    .bind(&record.currency)
                    .bind(record.status.as_str())
                    .bind(record.period_start)
                    .bind(record.period_end)
                    .bind(record.standalone)
                    .bind(record.receipt_url.as_deref())
                    .fetch_one(&mut *tx)
                    .await?;
                PaymentOutcome {
                    newly_succeeded: record.status.is_terminal(),
                    payment,
                }
            }
        };
        tx.commit().await?;
        Ok(outcome)
    }

    pub async fn list_payments_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Vec<SubscriptionPayment>> {
        let sql = format!(
            "SELECT {PAYMENT_RETURNING} FROM subscription_payments \
             WHERE subscription_id = $1 ORDER BY created_at DESC"
        );
        let rows = sqlx::query_as::<_, SubscriptionPayment>(&sql)
            .bind(subscription_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Look up a payment row by its gateway invoice id. Charge events carry
    /// no subscription reference, so their subscription is resolved through
    /// the payment row the invoice events wrote.
    pub async fn find_payment_by_invoice_id(
        &self,
        stripe_invoice_id: &str,
    ) -> BillingResult<Option<SubscriptionPayment>> {
        let sql = format!(
            "SELECT {PAYMENT_RETURNING} FROM subscription_payments \
             WHERE stripe_invoice_id = $1"
        );
        let row = sqlx::query_as::<_, SubscriptionPayment>(&sql)
            .bind(stripe_invoice_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    // ----- webhook event claims -----

    /// Atomically claim a webhook delivery for processing. Returns the claim
    /// id on success, `None` when another delivery of the same event already
    /// holds or finished the claim. Failed claims and claims stuck in
    /// `processing` for over 30 minutes can be retaken.
    pub async fn claim_event(
        &self,
        external_event_id: &str,
        event_type: &str,
    ) -> BillingResult<Option<Uuid>> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events (id, external_event_id, event_type, status, received_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (external_event_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(external_event_id)
        .bind(event_type)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((id,)) = claimed {
            return Ok(Some(id));
        }

        let retaken: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE webhook_events
            SET status = 'processing', received_at = NOW(), error = NULL
            WHERE external_event_id = $1
              AND (status = 'failed'
                   OR (status = 'processing' AND received_at < NOW() - INTERVAL '30 minutes'))
            RETURNING id
            "#,
        )
        .bind(external_event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(retaken.map(|(id,)| id))
    }

    pub async fn mark_event_processed(&self, claim_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            "UPDATE webhook_events SET status = 'processed', processed_at = NOW() WHERE id = $1",
        )
        .bind(claim_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_event_failed(&self, claim_id: Uuid, error: &str) -> BillingResult<()> {
        sqlx::query(
            "UPDATE webhook_events SET status = 'failed', processed_at = NOW(), error = $2 \
             WHERE id = $1",
        )
        .bind(claim_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ----- tier catalog -----

    pub async fn get_tier_by_id(&self, id: Uuid) -> BillingResult<Option<SubscriptionTier>> {
        let tier = sqlx::query_as::<_, SubscriptionTier>(
            "SELECT * FROM subscription_tiers WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(tier)
    }

    pub async fn get_tier_by_kind(
        &self,
        kind: TierKind,
    ) -> BillingResult<Option<SubscriptionTier>> {
        let tier = sqlx::query_as::<_, SubscriptionTier>(
            "SELECT * FROM subscription_tiers WHERE tier = $1 AND active LIMIT 1",
        )
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(tier)
    }

    /// Resolve a Stripe price id to its tier. Only active rows participate,
    /// so retired prices stop resolving once their tier is deactivated.
    pub async fn get_tier_by_price(
        &self,
        price_id: &str,
    ) -> BillingResult<Option<SubscriptionTier>> {
        let tier = sqlx::query_as::<_, SubscriptionTier>(
            "SELECT * FROM subscription_tiers \
             WHERE active AND (stripe_monthly_price_id = $1 OR stripe_yearly_price_id = $1)",
        )
        .bind(price_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(tier)
    }

    pub async fn list_active_tiers(&self) -> BillingResult<Vec<SubscriptionTier>> {
        let tiers = sqlx::query_as::<_, SubscriptionTier>(
            "SELECT * FROM subscription_tiers WHERE active ORDER BY monthly_amount ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(tiers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_repo() -> SubscriptionRepository {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for DB tests");
        let pool = vlabs_shared::db::create_pool(&url, 2)
            .await
            .expect("failed to connect");
        SubscriptionRepository::new(pool)
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_free_subscription_lifecycle() {
        let repo = test_repo().await;
        let user_id = Uuid::new_v4();

        let sub = repo
            .create_free_subscription(user_id, None, SubscriptionStatus::Active, SubscriptionSource::Api)
            .await
            .expect("create free");
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.free().map(|f| f.usage_count), Some(0));

        assert!(repo.pause_free_subscription(user_id).await.expect("pause"));
        let paused = repo
            .get_free_by_user(user_id)
            .await
            .expect("lookup")
            .expect("exists");
        assert_eq!(paused.status, SubscriptionStatus::Paused);

        let reactivated = repo.downgrade_to_free(user_id).await.expect("downgrade");
        assert_eq!(reactivated.status, SubscriptionStatus::Active);
        assert_eq!(reactivated.free().map(|f| f.usage_count), Some(1));
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_duplicate_event_claim_is_rejected() {
        let repo = test_repo().await;
        let event_id = format!("evt_test_{}", Uuid::new_v4());

        let first = repo
            .claim_event(&event_id, "invoice.paid")
            .await
            .expect("claim");
        assert!(first.is_some());

        let second = repo
            .claim_event(&event_id, "invoice.paid")
            .await
            .expect("claim again");
        assert!(second.is_none());

        repo.mark_event_processed(first.expect("claimed"))
            .await
            .expect("finish");
    }

    fn paid_record(user_id: Uuid, tier_id: Uuid) -> NewPaidSubscription {
        let tag = Uuid::new_v4();
        NewPaidSubscription {
            user_id,
            virtual_lab_id: None,
            tier_id,
            status: SubscriptionStatus::Active,
            current_period_start: OffsetDateTime::now_utc(),
            current_period_end: OffsetDateTime::now_utc(),
            source: SubscriptionSource::Api,
            stripe_subscription_id: format!("sub_test_{tag}"),
            stripe_price_id: "price_test".to_string(),
            stripe_customer_id: format!("cus_test_{tag}"),
            cancel_at_period_end: false,
            auto_renew: true,
            amount: 1400,
            currency: "chf".to_string(),
            interval: BillingInterval::Month,
        }
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_second_live_paid_subscription_is_rejected() {
        let repo = test_repo().await;
        let user_id = Uuid::new_v4();
        let tier = repo
            .get_tier_by_kind(TierKind::Pro)
            .await
            .expect("tier lookup")
            .expect("pro tier seeded");

        repo.create_paid_subscription(paid_record(user_id, tier.id))
            .await
            .expect("first paid sub");
        // The unique index closes the race two concurrent upgrades would
        // otherwise win together.
        let second = repo
            .create_paid_subscription(paid_record(user_id, tier.id))
            .await;
        assert!(second.is_err());
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_payment_row_resolves_by_invoice_id() {
        let repo = test_repo().await;
        let user_id = Uuid::new_v4();
        let sub = repo
            .create_free_subscription(user_id, None, SubscriptionStatus::Active, SubscriptionSource::Api)
            .await
            .expect("create sub");
        let invoice_id = format!("in_test_{}", Uuid::new_v4());

        let now = OffsetDateTime::now_utc();
        repo.record_payment(PaymentRecord {
            subscription_id: Some(sub.id),
            virtual_lab_id: None,
            stripe_invoice_id: Some(invoice_id.clone()),
            stripe_payment_intent_id: None,
            stripe_charge_id: None,
            card_brand: None,
            card_last4: None,
            amount: 1400,
            currency: "chf".to_string(),
            status: PaymentStatus::Succeeded,
            period_start: now,
            period_end: now,
            standalone: false,
            receipt_url: None,
        })
        .await
        .expect("record payment");

        let found = repo
            .find_payment_by_invoice_id(&invoice_id)
            .await
            .expect("lookup")
            .expect("payment exists");
        assert_eq!(found.subscription_id, Some(sub.id));
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_succeeded_payment_keeps_status_but_absorbs_card_details() {
        let repo = test_repo().await;
        let invoice_id = format!("in_test_{}", Uuid::new_v4());
        let now = OffsetDateTime::now_utc();
        let base = PaymentRecord {
            subscription_id: None,
            virtual_lab_id: None,
            stripe_invoice_id: Some(invoice_id.clone()),
            stripe_payment_intent_id: None,
            stripe_charge_id: None,
            card_brand: None,
            card_last4: None,
            amount: 1400,
            currency: "chf".to_string(),
            status: PaymentStatus::Succeeded,
            period_start: now,
            period_end: now,
            standalone: false,
            receipt_url: None,
        };

        let first = repo.record_payment(base.clone()).await.expect("record");
        assert!(first.newly_succeeded);

        // A charge delivery for the same invoice: status and amount stay
        // frozen, the card details it carries land on the row.
        let second = repo
            .record_payment(PaymentRecord {
                status: PaymentStatus::Failed,
                amount: 9999,
                stripe_charge_id: Some(format!("ch_test_{}", Uuid::new_v4())),
                card_brand: Some("visa".to_string()),
                card_last4: Some("4242".to_string()),
                ..base
            })
            .await
            .expect("record again");
        assert!(!second.newly_succeeded);
        assert_eq!(second.payment.status, PaymentStatus::Succeeded);
        assert_eq!(second.payment.amount, 1400);
        assert_eq!(second.payment.card_last4.as_deref(), Some("4242"));
    }
}
