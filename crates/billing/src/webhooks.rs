//! Stripe webhook handling
//!
//! Verifies deliveries, claims them atomically for idempotency, classifies
//! them into three processing paths (subscription updates, subscription
//! payments, standalone top-ups) and applies the resulting state
//! transitions. Redeliveries of an already-claimed event succeed without
//! side effects.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use stripe::{Event, EventObject, Webhook};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::credits::credits_for_amount;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventType};
use crate::model::{PaymentStatus, Subscription, SubscriptionSource, SubscriptionStatus};
use crate::repo::{NewPaidSubscription, PaymentRecord};
use crate::subscriptions::{expandable_id, timestamp, GatewaySubscription, SubscriptionService};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a delivery before its signature is rejected.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Event types that carry a subscription object and drive the local
/// subscription record.
const SUBSCRIPTION_UPDATE_EVENTS: &[&str] = &[
    "customer.subscription.created",
    "customer.subscription.updated",
    "customer.subscription.deleted",
    "customer.subscription.pending_update_applied",
    "customer.subscription.pending_update_expired",
];

/// Event types that drive payment records for subscription billing cycles.
const PAYMENT_UPDATE_EVENTS: &[&str] = &[
    "invoice.payment_succeeded",
    "invoice.payment_failed",
    "invoice.paid",
    "charge.succeeded",
    "charge.failed",
    "charge.refunded",
    "charge.dispute.created",
];

/// Payment-intent events, only meaningful for standalone top-ups.
const PAYMENT_INTENT_EVENTS: &[&str] = &[
    "payment_intent.succeeded",
    "payment_intent.payment_failed",
];

/// Which processing path an event takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    /// Sync the local subscription record from the gateway object
    SubscriptionUpdate,
    /// Record a billing-cycle payment and its consequences
    SubscriptionPayment,
    /// Record a one-time top-up payment
    StandalonePayment,
    /// Acknowledged and dropped
    Unhandled,
}

/// Classify an event by its type string and the standalone marker from the
/// object's metadata. The marker wins over the generic payment
/// classification: a `charge.succeeded` for a top-up intent must not be
/// treated as a billing-cycle payment.
pub fn classify(event_type: &str, standalone_marker: bool) -> EventClass {
    let is_payment_event = PAYMENT_UPDATE_EVENTS.contains(&event_type)
        || PAYMENT_INTENT_EVENTS.contains(&event_type);
    if standalone_marker && is_payment_event {
        return EventClass::StandalonePayment;
    }
    if SUBSCRIPTION_UPDATE_EVENTS.contains(&event_type) {
        return EventClass::SubscriptionUpdate;
    }
    if PAYMENT_UPDATE_EVENTS.contains(&event_type) {
        return EventClass::SubscriptionPayment;
    }
    EventClass::Unhandled
}

/// Outcome reported to the HTTP layer. All three map to a 2xx response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed { event_type: String },
    Ignored { event_type: String },
    Duplicate { event_type: String },
}

/// Payment facts flattened out of an invoice, charge or payment intent.
#[derive(Debug, Clone)]
struct PaymentFacts {
    subscription_ref: Option<String>,
    invoice_id: Option<String>,
    payment_intent_id: Option<String>,
    charge_id: Option<String>,
    amount: i64,
    currency: String,
    status: PaymentStatus,
    card_brand: Option<String>,
    card_last4: Option<String>,
    receipt_url: Option<String>,
    virtual_lab_id: Option<Uuid>,
}

/// Webhook handler for Stripe events
#[derive(Clone)]
pub struct WebhookHandler {
    service: SubscriptionService,
}

impl WebhookHandler {
    pub fn new(service: SubscriptionService) -> Self {
        Self { service }
    }

    /// Verify and parse a Stripe webhook event.
    ///
    /// Tries the library verifier first, then falls back to manual
    /// signature verification, which tolerates event payloads from API
    /// versions newer than the library's models.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        let webhook_secret = &self.service.stripe().config().webhook_secret;

        match Webhook::construct_event(payload, signature, webhook_secret) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::debug!(stripe_error = %e, "Library webhook parsing failed, trying manual verification");
            }
        }

        verify_signed_payload(payload, signature, webhook_secret)
    }

    /// Handle a verified event. The claim insert is the idempotency gate:
    /// a delivery that loses the claim returns `Duplicate` without touching
    /// any billing state.
    pub async fn handle_event(&self, event: Event) -> BillingResult<WebhookOutcome> {
        let event_id = event.id.to_string();
        let event_type = event.type_.to_string();

        let class = classify(&event_type, standalone_marker(&event.data.object));
        if class == EventClass::Unhandled {
            tracing::info!(%event_type, %event_id, "Ignoring unhandled event type");
            return Ok(WebhookOutcome::Ignored { event_type });
        }

        let Some(claim_id) = self
            .service
            .repo()
            .claim_event(&event_id, &event_type)
            .await?
        else {
            tracing::info!(%event_type, %event_id, "Duplicate delivery, already claimed");
            return Ok(WebhookOutcome::Duplicate { event_type });
        };

        let result = match class {
            EventClass::SubscriptionUpdate => self.handle_subscription_update(&event).await,
            EventClass::SubscriptionPayment => self.handle_subscription_payment(&event).await,
            EventClass::StandalonePayment => self.handle_standalone_payment(&event).await,
            EventClass::Unhandled => Ok(()),
        };

        match result {
            Ok(()) => {
                self.service.repo().mark_event_processed(claim_id).await?;
                Ok(WebhookOutcome::Processed { event_type })
            }
            Err(e) => {
                self.service
                    .repo()
                    .mark_event_failed(claim_id, &e.to_string())
                    .await?;
                Err(e)
            }
        }
    }

    /// Sync the local subscription record from a gateway subscription
    /// object, creating it when the gateway knows a subscription we don't.
    /// A terminal status drives the downgrade back to free.
    async fn handle_subscription_update(&self, event: &Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let EventObject::Subscription(gateway_sub) = &event.data.object else {
            return Err(BillingError::MalformedEvent(
                "expected subscription object".to_string(),
            ));
        };
        let snapshot = GatewaySubscription::from_stripe(gateway_sub)?;
        let repo = self.service.repo();

        let local = repo
            .apply_gateway_update(
                &snapshot.stripe_subscription_id,
                crate::repo::PaidGatewayUpdate {
                    status: snapshot.status,
                    current_period_start: snapshot.current_period_start,
                    current_period_end: snapshot.current_period_end,
                    cancel_at_period_end: snapshot.cancel_at_period_end,
                    canceled_at: snapshot.canceled_at,
                    auto_renew: !snapshot.cancel_at_period_end,
                    stripe_price_id: Some(snapshot.stripe_price_id.clone()),
                    amount: Some(snapshot.amount),
                    currency: Some(snapshot.currency.clone()),
                    interval: Some(snapshot.interval),
                },
            )
            .await?;

        let subscription = match local {
            Some(sub) => sub,
            None => self.create_from_gateway(gateway_sub, &snapshot).await?,
        };

        self.service
            .events()
            .log_event_best_effort(
                BillingEventBuilder::new(subscription.user_id, BillingEventType::SubscriptionUpdated)
                    .data(serde_json::json!({
                        "status": snapshot.status,
                        "cancel_at_period_end": snapshot.cancel_at_period_end,
                    }))
                    .stripe_event(&event_id)
                    .stripe_subscription(&snapshot.stripe_subscription_id)
                    .actor_type(ActorType::Stripe),
            )
            .await;

        if snapshot.status.is_terminal() {
            self.service
                .downgrade_to_free(subscription.user_id, ActorType::Stripe)
                .await?;
        }

        Ok(())
    }

    /// Create a local paid subscription for a gateway subscription we have
    /// no record of. Needs the user id from the gateway metadata and a tier
    /// matching the price; without either the event is orphaned.
    async fn create_from_gateway(
        &self,
        gateway_sub: &stripe::Subscription,
        snapshot: &GatewaySubscription,
    ) -> BillingResult<Subscription> {
        let user_id = gateway_sub
            .metadata
            .get("user_id")
            .and_then(|id| Uuid::parse_str(id).ok())
            .ok_or_else(|| {
                BillingError::MissingSubscriptionReference(snapshot.stripe_subscription_id.clone())
            })?;
        let virtual_lab_id = gateway_sub
            .metadata
            .get("virtual_lab_id")
            .and_then(|id| Uuid::parse_str(id).ok());
        let tier = self
            .service
            .repo()
            .get_tier_by_price(&snapshot.stripe_price_id)
            .await?
            .ok_or_else(|| BillingError::TierNotFound(snapshot.stripe_price_id.clone()))?;

        tracing::info!(
            %user_id,
            stripe_subscription_id = %snapshot.stripe_subscription_id,
            "Creating local subscription record from gateway event"
        );

        let subscription = self
            .service
            .repo()
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

        self.service.repo().pause_free_subscription(user_id).await?;
        Ok(subscription)
    }

    /// Record a billing-cycle payment. On the transition into `succeeded`
    /// the tier's credit grant is applied to the lab ledger; a failure puts
    /// the subscription into `unpaid` and downgrades the user to free.
    async fn handle_subscription_payment(&self, event: &Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let event_type = event.type_.to_string();
        let facts = payment_facts(&event_type, &event.data.object)?;
        let repo = self.service.repo();

        // Disputes are audit-only; the payment row stays as it was.
        if event_type == "charge.dispute.created" {
            return self.record_dispute(&event_id, &facts).await;
        }

        let mut subscription = match &facts.subscription_ref {
            Some(sub_ref) => repo.get_by_stripe_subscription_id(sub_ref).await?,
            None => None,
        };
        // Charge events carry no subscription reference, but their invoice id
        // keys the payment row the invoice events write; resolve through it.
        if subscription.is_none() {
            if let Some(invoice_id) = &facts.invoice_id {
                if let Some(prior) = repo.find_payment_by_invoice_id(invoice_id).await? {
                    if let Some(sub_id) = prior.subscription_id {
                        subscription = repo.get_by_id(sub_id).await?;
                    }
                }
            }
        }
        if subscription.is_none() {
            if let Some(lab_id) = facts.virtual_lab_id {
                subscription = repo.get_active_by_lab_id(lab_id).await?;
            }
        }
        let Some(subscription) = subscription else {
            tracing::warn!(
                %event_type,
                %event_id,
                subscription_ref = ?facts.subscription_ref,
                "Payment event references a subscription with no local record"
            );
            return Err(BillingError::MissingSubscriptionReference(
                facts
                    .subscription_ref
                    .clone()
                    .or(facts.invoice_id.clone())
                    .unwrap_or_else(|| event_id.clone()),
            ));
        };

        let outcome = repo
            .record_payment(PaymentRecord {
                subscription_id: Some(subscription.id),
                virtual_lab_id: subscription.virtual_lab_id,
                stripe_invoice_id: facts.invoice_id.clone(),
                stripe_payment_intent_id: facts.payment_intent_id.clone(),
                stripe_charge_id: facts.charge_id.clone(),
                card_brand: facts.card_brand.clone(),
                card_last4: facts.card_last4.clone(),
                amount: facts.amount,
                currency: facts.currency.clone(),
                status: facts.status,
                period_start: subscription.current_period_start,
                period_end: subscription.current_period_end,
                standalone: false,
                receipt_url: facts.receipt_url.clone(),
            })
            .await?;

        if event_type == "charge.refunded" {
            self.service
                .events()
                .log_event_best_effort(
                    BillingEventBuilder::new(subscription.user_id, BillingEventType::PaymentRefunded)
                        .data(serde_json::json!({ "amount": facts.amount }))
                        .stripe_event(&event_id)
                        .actor_type(ActorType::Stripe),
                )
                .await;
            return Ok(());
        }

        if outcome.newly_succeeded {
            self.service
                .grant_cycle_credits(&subscription, Some(&event_id))
                .await;
            self.service
                .events()
                .log_event_best_effort(
                    BillingEventBuilder::new(subscription.user_id, BillingEventType::PaymentSucceeded)
                        .data(serde_json::json!({
                            "amount": facts.amount,
                            "currency": facts.currency,
                        }))
                        .stripe_event(&event_id)
                        .actor_type(ActorType::Stripe),
                )
                .await;
        } else if facts.status == PaymentStatus::Failed
            && outcome.payment.status == PaymentStatus::Failed
        {
            // A delivery cannot fail a payment that already succeeded; the
            // row's status is the authority, not the event's.
            repo.update_status(subscription.id, SubscriptionStatus::Unpaid)
                .await?;
            self.service
                .downgrade_to_free(subscription.user_id, ActorType::Stripe)
                .await?;
            self.service
                .events()
                .log_event_best_effort(
                    BillingEventBuilder::new(subscription.user_id, BillingEventType::PaymentFailed)
                        .data(serde_json::json!({
                            "amount": facts.amount,
                            "currency": facts.currency,
                        }))
                        .stripe_event(&event_id)
                        .actor_type(ActorType::Stripe),
                )
                .await;
        }

        Ok(())
    }

    async fn record_dispute(&self, event_id: &str, facts: &PaymentFacts) -> BillingResult<()> {
        let subscription = match facts.virtual_lab_id {
            Some(lab_id) => self.service.repo().get_active_by_lab_id(lab_id).await?,
            None => None,
        };
        match subscription {
            Some(sub) => {
                self.service
                    .events()
                    .log_event_best_effort(
                        BillingEventBuilder::new(sub.user_id, BillingEventType::DisputeCreated)
                            .data(serde_json::json!({
                                "amount": facts.amount,
                                "charge_id": facts.charge_id,
                            }))
                            .stripe_event(event_id)
                            .actor_type(ActorType::Stripe),
                    )
                    .await;
            }
            None => {
                tracing::warn!(
                    %event_id,
                    charge_id = ?facts.charge_id,
                    "Dispute created for a charge with no resolvable subscription"
                );
            }
        }
        Ok(())
    }

    /// Record a one-time top-up. A successful charge converts the amount to
    /// credits and tops up the lab ledger; a failure only records the
    /// payment row and never touches subscription state.
    async fn handle_standalone_payment(&self, event: &Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let event_type = event.type_.to_string();
        let event_time = timestamp(event.created)?;
        let facts = payment_facts(&event_type, &event.data.object)?;
        let repo = self.service.repo();

        let subscription = match facts.virtual_lab_id {
            Some(lab_id) => repo.get_active_by_lab_id(lab_id).await?,
            None => None,
        };

        let outcome = repo
            .record_payment(PaymentRecord {
                subscription_id: subscription.as_ref().map(|s| s.id),
                virtual_lab_id: facts.virtual_lab_id,
                stripe_invoice_id: facts.invoice_id.clone(),
                stripe_payment_intent_id: facts.payment_intent_id.clone(),
                stripe_charge_id: facts.charge_id.clone(),
                card_brand: facts.card_brand.clone(),
                card_last4: facts.card_last4.clone(),
                amount: facts.amount,
                currency: facts.currency.clone(),
                status: facts.status,
                period_start: event_time,
                period_end: event_time,
                standalone: true,
                receipt_url: facts.receipt_url.clone(),
            })
            .await?;

        if outcome.newly_succeeded {
            let credits = credits_for_amount(facts.amount)?;
            match facts.virtual_lab_id {
                Some(lab_id) => {
                    if let Err(e) = self.service.accounting().top_up(lab_id, credits).await {
                        tracing::warn!(%lab_id, credits, error = %e, "Failed to apply top-up credits");
                    } else if let Some(sub) = &subscription {
                        self.service
                            .events()
                            .log_event_best_effort(
                                BillingEventBuilder::new(sub.user_id, BillingEventType::StandaloneTopUp)
                                    .data(serde_json::json!({
                                        "virtual_lab_id": lab_id,
                                        "amount": facts.amount,
                                        "currency": facts.currency,
                                        "credits": credits,
                                    }))
                                    .stripe_event(&event_id)
                                    .actor_type(ActorType::Stripe),
                            )
                            .await;
                    }
                }
                None => {
                    tracing::warn!(
                        %event_id,
                        "Standalone payment without a virtual lab id, credits not applied"
                    );
                }
            }
        }

        Ok(())
    }
}

/// Manual verification of Stripe's `t=timestamp,v1=signature` header:
/// timestamp tolerance check, then HMAC-SHA256 over `"{t}.{payload}"`
/// compared in constant time against the decoded `v1` value.
fn verify_signed_payload(payload: &str, signature: &str, webhook_secret: &str) -> BillingResult<Event> {
    let mut timestamp_part: Option<i64> = None;
    let mut v1_signature: Option<String> = None;
    for part in signature.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0] {
                "t" => timestamp_part = kv[1].parse().ok(),
                "v1" => v1_signature = Some(kv[1].to_string()),
                _ => {}
            }
        }
    }
    let ts = timestamp_part.ok_or(BillingError::SignatureInvalid)?;
    let v1_signature = v1_signature.ok_or(BillingError::SignatureInvalid)?;

    let now = OffsetDateTime::now_utc().unix_timestamp();
    if (now - ts).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(timestamp = ts, now, "Webhook timestamp outside tolerance");
        return Err(BillingError::SignatureInvalid);
    }

    let expected = hex::decode(&v1_signature).map_err(|_| BillingError::SignatureInvalid)?;
    let signed_payload = format!("{}.{}", ts, payload);
    let mut mac = HmacSha256::new_from_slice(webhook_secret.as_bytes())
        .map_err(|_| BillingError::SignatureInvalid)?;
    mac.update(signed_payload.as_bytes());
    if mac.verify_slice(&expected).is_err() {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::SignatureInvalid);
    }

    serde_json::from_str(payload).map_err(|e| {
        tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
        BillingError::MalformedEvent(e.to_string())
    })
}

/// Read the standalone marker off the event object's metadata.
fn standalone_marker(object: &EventObject) -> bool {
    let value = match object {
        EventObject::PaymentIntent(intent) => intent.metadata.get("standalone"),
        EventObject::Charge(charge) => charge.metadata.get("standalone"),
        EventObject::Invoice(invoice) => invoice
            .metadata
            .as_ref()
            .and_then(|m| m.get("standalone")),
        EventObject::Subscription(sub) => sub.metadata.get("standalone"),
        _ => None,
    };
    value.map(String::as_str) == Some("true")
}

fn metadata_lab_id(metadata: Option<&std::collections::HashMap<String, String>>) -> Option<Uuid> {
    metadata
        .and_then(|m| m.get("virtual_lab_id"))
        .and_then(|id| Uuid::parse_str(id).ok())
}

/// Flatten the payment-relevant fields out of the event object. Different
/// event families carry the same facts in different places.
fn payment_facts(event_type: &str, object: &EventObject) -> BillingResult<PaymentFacts> {
    match object {
        EventObject::Invoice(invoice) => {
            let status = if event_type == "invoice.payment_failed" {
                PaymentStatus::Failed
            } else {
                PaymentStatus::Succeeded
            };
            // Failed invoices report amount_paid as zero; the amount owed is
            // the fact worth recording for them.
            let amount = if status == PaymentStatus::Failed {
                invoice.amount_due.or(invoice.amount_paid)
            } else {
                invoice.amount_paid.or(invoice.amount_due)
            };
            Ok(PaymentFacts {
                subscription_ref: invoice.subscription.as_ref().map(expandable_id),
                invoice_id: Some(invoice.id.to_string()),
                payment_intent_id: invoice.payment_intent.as_ref().map(expandable_id),
                charge_id: invoice.charge.as_ref().map(expandable_id),
                amount: amount.unwrap_or(0),
                currency: invoice
                    .currency
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "chf".to_string()),
                status,
                card_brand: None,
                card_last4: None,
                receipt_url: None,
                virtual_lab_id: metadata_lab_id(invoice.metadata.as_ref()),
            })
        }
        EventObject::Charge(charge) => {
            let card = charge
                .payment_method_details
                .as_ref()
                .and_then(|d| d.card.as_ref());
            Ok(PaymentFacts {
                subscription_ref: None,
                invoice_id: charge.invoice.as_ref().map(expandable_id),
                payment_intent_id: charge.payment_intent.as_ref().map(expandable_id),
                charge_id: Some(charge.id.to_string()),
                amount: charge.amount,
                currency: charge.currency.to_string(),
                status: if event_type == "charge.failed" {
                    PaymentStatus::Failed
                } else {
                    PaymentStatus::Succeeded
                },
                card_brand: card.and_then(|c| c.brand.clone()),
                card_last4: card.and_then(|c| c.last4.clone()),
                receipt_url: charge.receipt_url.clone(),
                virtual_lab_id: metadata_lab_id(Some(&charge.metadata)),
            })
        }
        EventObject::PaymentIntent(intent) => Ok(PaymentFacts {
            subscription_ref: None,
            invoice_id: intent.invoice.as_ref().map(expandable_id),
            payment_intent_id: Some(intent.id.to_string()),
            charge_id: intent.latest_charge.as_ref().map(expandable_id),
            amount: intent.amount,
            currency: intent.currency.to_string(),
            status: if event_type == "payment_intent.payment_failed" {
                PaymentStatus::Failed
            } else {
                PaymentStatus::Succeeded
            },
            card_brand: None,
            card_last4: None,
            receipt_url: None,
            virtual_lab_id: metadata_lab_id(Some(&intent.metadata)),
        }),
        EventObject::Dispute(dispute) => Ok(PaymentFacts {
            subscription_ref: None,
            invoice_id: None,
            payment_intent_id: dispute.payment_intent.as_ref().map(expandable_id),
            charge_id: Some(expandable_id(&dispute.charge)),
            amount: dispute.amount,
            currency: dispute.currency.to_string(),
            status: PaymentStatus::Succeeded,
            card_brand: None,
            card_last4: None,
            receipt_url: None,
            virtual_lab_id: None,
        }),
        _ => Err(BillingError::MalformedEvent(format!(
            "unexpected object for event type {event_type}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_subscription_update_events() {
        for event_type in SUBSCRIPTION_UPDATE_EVENTS {
            assert_eq!(classify(event_type, false), EventClass::SubscriptionUpdate);
        }
    }

    #[test]
    fn test_classify_payment_events() {
        assert_eq!(
            classify("invoice.payment_succeeded", false),
            EventClass::SubscriptionPayment
        );
        assert_eq!(classify("invoice.paid", false), EventClass::SubscriptionPayment);
        assert_eq!(
            classify("charge.failed", false),
            EventClass::SubscriptionPayment
        );
    }

    #[test]
    fn test_standalone_marker_wins_over_payment_classification() {
        assert_eq!(
            classify("charge.succeeded", true),
            EventClass::StandalonePayment
        );
        assert_eq!(
            classify("invoice.paid", true),
            EventClass::StandalonePayment
        );
        assert_eq!(
            classify("payment_intent.succeeded", true),
            EventClass::StandalonePayment
        );
    }

    #[test]
    fn test_payment_intent_without_marker_is_unhandled() {
        assert_eq!(
            classify("payment_intent.succeeded", false),
            EventClass::Unhandled
        );
        assert_eq!(
            classify("payment_intent.payment_failed", false),
            EventClass::Unhandled
        );
    }

    #[test]
    fn test_unknown_event_types_are_unhandled() {
        assert_eq!(classify("customer.created", false), EventClass::Unhandled);
        assert_eq!(classify("price.updated", true), EventClass::Unhandled);
        assert_eq!(classify("", false), EventClass::Unhandled);
    }

    #[test]
    fn test_marker_does_not_reclassify_subscription_updates() {
        // A subscription object carrying the marker is still a
        // subscription update; the marker only affects payment events.
        assert_eq!(
            classify("customer.subscription.updated", true),
            EventClass::SubscriptionUpdate
        );
    }

    fn sign(payload: &str, ts: i64, secret: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{ts}.{payload}").as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn test_signature_verification_accepts_matching_hmac() {
        let payload = "{}";
        let ts = OffsetDateTime::now_utc().unix_timestamp();
        let header = format!("t={ts},v1={}", sign(payload, ts, "whsec_test"));
        // The payload is not a full event, so passing verification surfaces
        // as a parse error rather than a signature error.
        assert!(matches!(
            verify_signed_payload(payload, &header, "whsec_test"),
            Err(BillingError::MalformedEvent(_))
        ));
    }

    #[test]
    fn test_signature_verification_rejects_mismatch() {
        let payload = "{}";
        let ts = OffsetDateTime::now_utc().unix_timestamp();

        // Signature over a different payload
        let header = format!("t={ts},v1={}", sign(r#"{"a":1}"#, ts, "whsec_test"));
        assert!(matches!(
            verify_signed_payload(payload, &header, "whsec_test"),
            Err(BillingError::SignatureInvalid)
        ));

        // Signature under a different secret
        let header = format!("t={ts},v1={}", sign(payload, ts, "whsec_other"));
        assert!(matches!(
            verify_signed_payload(payload, &header, "whsec_test"),
            Err(BillingError::SignatureInvalid)
        ));

        // Not hex at all
        let header = format!("t={ts},v1=zz-not-hex");
        assert!(matches!(
            verify_signed_payload(payload, &header, "whsec_test"),
            Err(BillingError::SignatureInvalid)
        ));
    }

    #[test]
    fn test_signature_verification_rejects_stale_timestamp() {
        let payload = "{}";
        let ts = OffsetDateTime::now_utc().unix_timestamp() - SIGNATURE_TOLERANCE_SECS - 60;
        let header = format!("t={ts},v1={}", sign(payload, ts, "whsec_test"));
        assert!(matches!(
            verify_signed_payload(payload, &header, "whsec_test"),
            Err(BillingError::SignatureInvalid)
        ));
    }

    fn invoice_object(invoice_id: &str, sub_ref: &str, paid: i64, due: i64) -> serde_json::Value {
        serde_json::json!({
            "id": invoice_id,
            "object": "invoice",
            "amount_paid": paid,
            "amount_due": due,
            "currency": "chf",
            "subscription": sub_ref,
        })
    }

    #[test]
    fn test_failed_invoice_records_amount_due() {
        // Stripe reports amount_paid as zero on a failed invoice; the row
        // must carry what was owed, not zero.
        let invoice: stripe::Invoice =
            serde_json::from_value(invoice_object("in_fail", "sub_x", 0, 1400)).unwrap();
        let facts = payment_facts("invoice.payment_failed", &EventObject::Invoice(invoice)).unwrap();
        assert_eq!(facts.status, PaymentStatus::Failed);
        assert_eq!(facts.amount, 1400);
    }

    #[test]
    fn test_succeeded_invoice_records_amount_paid() {
        let invoice: stripe::Invoice =
            serde_json::from_value(invoice_object("in_ok", "sub_x", 1400, 0)).unwrap();
        let facts =
            payment_facts("invoice.payment_succeeded", &EventObject::Invoice(invoice)).unwrap();
        assert_eq!(facts.status, PaymentStatus::Succeeded);
        assert_eq!(facts.amount, 1400);
    }

    // ----- end-to-end event processing (database) -----

    use crate::accounting::AccountingClient;
    use crate::client::{StripeClient, StripeConfig};
    use crate::directory::DirectoryClient;
    use crate::events::BillingEventLogger;
    use crate::model::BillingInterval;
    use crate::repo::SubscriptionRepository;
    use crate::tier::TierKind;

    async fn test_handler(accounting_url: String) -> WebhookHandler {
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
        WebhookHandler::new(SubscriptionService::new(
            repo, stripe, accounting, directory, events,
        ))
    }

    fn invoice_event(
        event_id: &str,
        event_type: &str,
        invoice: serde_json::Value,
    ) -> Event {
        serde_json::from_value(serde_json::json!({
            "id": event_id,
            "object": "event",
            "api_version": "2022-11-15",
            "created": 1_700_000_000,
            "data": { "object": invoice },
            "livemode": false,
            "pending_webhooks": 1,
            "type": event_type,
        }))
        .expect("event json")
    }

    async fn insert_paid_subscription(
        handler: &WebhookHandler,
        user_id: Uuid,
        lab_id: Uuid,
        stripe_sub_id: &str,
    ) -> Subscription {
        let repo = handler.service.repo();
        let tier = repo
            .get_tier_by_kind(TierKind::Pro)
            .await
            .expect("tier lookup")
            .expect("pro tier seeded");
        let now = OffsetDateTime::now_utc();
        repo.create_paid_subscription(NewPaidSubscription {
            user_id,
            virtual_lab_id: Some(lab_id),
            tier_id: tier.id,
            status: SubscriptionStatus::Active,
            current_period_start: now,
            current_period_end: now,
            source: SubscriptionSource::Api,
            stripe_subscription_id: stripe_sub_id.to_string(),
            stripe_price_id: tier
                .stripe_monthly_price_id
                .clone()
                .expect("pro monthly price"),
            stripe_customer_id: format!("cus_test_{}", Uuid::new_v4()),
            cancel_at_period_end: false,
            auto_renew: true,
            amount: tier.monthly_amount,
            currency: tier.currency.clone(),
            interval: BillingInterval::Month,
        })
        .await
        .expect("create paid sub")
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_early_payment_event_recovers_on_redelivery() {
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
        let handler = test_handler(server.url()).await;

        let stripe_sub_id = format!("sub_test_{}", Uuid::new_v4());
        let invoice_id = format!("in_test_{}", Uuid::new_v4());
        let event_id = format!("evt_test_{}", Uuid::new_v4());
        let event = invoice_event(
            &event_id,
            "invoice.payment_succeeded",
            invoice_object(&invoice_id, &stripe_sub_id, 1400, 1400),
        );

        // Delivered before the local subscription row exists: the claim is
        // marked failed and the error bubbles up so the gateway redelivers.
        let early = handler.handle_event(event.clone()).await;
        assert!(matches!(
            early,
            Err(BillingError::MissingSubscriptionReference(_))
        ));

        let user_id = Uuid::new_v4();
        insert_paid_subscription(&handler, user_id, lab_id, &stripe_sub_id).await;

        // Redelivery retakes the failed claim and completes the grant.
        let retried = handler.handle_event(event.clone()).await.expect("retry");
        assert!(matches!(retried, WebhookOutcome::Processed { .. }));

        // A further redelivery of the processed event changes nothing.
        let again = handler.handle_event(event).await.expect("redeliver");
        assert!(matches!(again, WebhookOutcome::Duplicate { .. }));

        let payment = handler
            .service
            .repo()
            .find_payment_by_invoice_id(&invoice_id)
            .await
            .expect("lookup")
            .expect("payment row");
        assert_eq!(payment.status, PaymentStatus::Succeeded);
        top_up.assert_async().await;
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_failed_cycle_payment_downgrades_to_free() {
        let mut server = mockito::Server::new_async().await;
        let top_up = server
            .mock("POST", "/budget/top-up")
            .with_status(200)
            .expect(0)
            .create_async()
            .await;
        let handler = test_handler(server.url()).await;

        let user_id = Uuid::new_v4();
        let lab_id = Uuid::new_v4();
        let stripe_sub_id = format!("sub_test_{}", Uuid::new_v4());
        let repo = handler.service.repo();
        repo.create_free_subscription(
            user_id,
            Some(lab_id),
            SubscriptionStatus::Paused,
            SubscriptionSource::Api,
        )
        .await
        .expect("create free");
        let paid = insert_paid_subscription(&handler, user_id, lab_id, &stripe_sub_id).await;

        let event = invoice_event(
            &format!("evt_test_{}", Uuid::new_v4()),
            "invoice.payment_failed",
            invoice_object(&format!("in_test_{}", Uuid::new_v4()), &stripe_sub_id, 0, 1400),
        );
        let outcome = handler.handle_event(event).await.expect("handle");
        assert!(matches!(outcome, WebhookOutcome::Processed { .. }));

        let paid_after = repo
            .get_by_id(paid.id)
            .await
            .expect("lookup")
            .expect("paid row");
        assert_eq!(paid_after.status, SubscriptionStatus::Unpaid);
        let free_after = repo
            .get_free_by_user(user_id)
            .await
            .expect("lookup")
            .expect("free row");
        assert_eq!(free_after.status, SubscriptionStatus::Active);
        // No credits move on a failed cycle.
        top_up.assert_async().await;
    }
}
