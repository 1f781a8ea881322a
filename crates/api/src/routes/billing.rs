//! Billing endpoints: Stripe webhook ingestion, credit top-up purchases
//! and the tier catalog.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vlabs_billing::{BillingError, SubscriptionTier, WebhookOutcome};

use crate::{
    error::{ApiError, ApiResult},
    routes::require_user,
    state::AppState,
};

/// Stripe webhook receiver.
///
/// Answers 2xx for events that redelivery cannot fix (duplicates, ignored
/// types) so Stripe stops retrying them. Anything that may succeed later,
/// including events that outran the local subscription row, answers non-2xx
/// to request redelivery.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, ApiError> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("Missing stripe-signature header".to_string()))?;

    let event = state.webhooks.verify_event(&body, signature)?;
    let event_id = event.id.to_string();

    match state.webhooks.handle_event(event).await {
        Ok(WebhookOutcome::Processed { .. }) => Ok(StatusCode::OK),
        Ok(WebhookOutcome::Ignored { .. }) => Ok(StatusCode::OK),
        Ok(WebhookOutcome::Duplicate { event_type }) => {
            tracing::debug!(event_id = %event_id, %event_type, "Duplicate webhook event acknowledged");
            Ok(StatusCode::OK)
        }
        Err(BillingError::DuplicateEvent(_)) => Ok(StatusCode::OK),
        Err(BillingError::MissingSubscriptionReference(reference)) => {
            // The local row can lag the gateway during an upgrade; the claim
            // is marked failed, so a redelivery after the row lands can
            // retake it. Answer non-2xx to keep redelivery alive.
            tracing::warn!(event_id = %event_id, reference = %reference, "Webhook event references a subscription not yet known");
            Err(ApiError::from(BillingError::MissingSubscriptionReference(
                reference,
            )))
        }
        Err(e) => Err(ApiError::from(e)),
    }
}

#[derive(Deserialize)]
pub struct StandalonePaymentRequest {
    pub virtual_lab_id: Uuid,
    pub email: String,
    /// Amount in the currency's minor unit (e.g. cents)
    pub amount: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "chf".to_string()
}

#[derive(Serialize)]
pub struct StandalonePaymentResponse {
    pub payment_intent_id: String,
    pub client_secret: Option<String>,
    pub amount: i64,
    pub currency: String,
}

/// Start a one-time credit top-up. Returns the payment intent's client
/// secret; credits are granted when the payment webhook confirms the charge.
pub async fn create_standalone_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<StandalonePaymentRequest>,
) -> ApiResult<Json<StandalonePaymentResponse>> {
    let user_id = require_user(&headers)?;

    let intent = state
        .billing
        .create_standalone_payment(
            user_id,
            req.virtual_lab_id,
            &req.email,
            req.amount,
            &req.currency,
        )
        .await?;

    Ok(Json(StandalonePaymentResponse {
        payment_intent_id: intent.id.to_string(),
        client_secret: intent.client_secret,
        amount: req.amount,
        currency: req.currency,
    }))
}

#[derive(Serialize)]
pub struct TierResponse {
    pub id: Uuid,
    pub tier: String,
    pub monthly_amount: i64,
    pub yearly_amount: i64,
    pub currency: String,
    pub monthly_credits: i64,
    pub yearly_credits: i64,
}

impl From<SubscriptionTier> for TierResponse {
    fn from(tier: SubscriptionTier) -> Self {
        Self {
            id: tier.id,
            tier: tier.tier,
            monthly_amount: tier.monthly_amount,
            yearly_amount: tier.yearly_amount,
            currency: tier.currency,
            monthly_credits: tier.monthly_credits,
            yearly_credits: tier.yearly_credits,
        }
    }
}

/// List the active subscription tiers
pub async fn list_tiers(State(state): State<AppState>) -> ApiResult<Json<Vec<TierResponse>>> {
    let tiers = state.billing.list_tiers().await?;
    Ok(Json(tiers.into_iter().map(TierResponse::from).collect()))
}
