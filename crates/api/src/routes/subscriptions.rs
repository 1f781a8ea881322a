//! Subscription lifecycle endpoints

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;
use vlabs_billing::{
    ActorType, Subscription, SubscriptionDetails, SubscriptionPayment, TierKind,
};

use crate::{
    error::{ApiError, ApiResult},
    routes::require_user,
    state::AppState,
};

#[derive(Serialize)]
pub struct SubscriptionResponse {
    pub id: Uuid,
    pub kind: String,
    pub status: String,
    pub tier_id: Uuid,
    pub virtual_lab_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_end: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_at_period_end: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_count: Option<i32>,
}

impl From<Subscription> for SubscriptionResponse {
    fn from(sub: Subscription) -> Self {
        let (cancel_at_period_end, usage_count) = match &sub.details {
            SubscriptionDetails::Paid(paid) => (Some(paid.cancel_at_period_end), None),
            SubscriptionDetails::Free(free) => (None, Some(free.usage_count)),
        };
        Self {
            id: sub.id,
            kind: sub.details.kind().to_string(),
            status: sub.status.to_string(),
            tier_id: sub.tier_id,
            virtual_lab_id: sub.virtual_lab_id,
            current_period_start: sub.current_period_start,
            current_period_end: sub.current_period_end,
            cancel_at_period_end,
            usage_count,
        }
    }
}

/// List the calling user's subscriptions (free and paid, newest first)
pub async fn list_subscriptions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<SubscriptionResponse>>> {
    let user_id = require_user(&headers)?;
    let subs = state.billing.list_subscriptions(user_id).await?;
    Ok(Json(subs.into_iter().map(SubscriptionResponse::from).collect()))
}

#[derive(Deserialize)]
pub struct ActivateFreeRequest {
    pub virtual_lab_id: Uuid,
    pub lab_name: String,
}

/// Activate the free tier for a newly created virtual lab. Opens the lab's
/// ledger account and grants the welcome credits.
pub async fn activate_free(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ActivateFreeRequest>,
) -> ApiResult<Json<SubscriptionResponse>> {
    let user_id = require_user(&headers)?;
    let sub = state
        .billing
        .activate_free_subscription(user_id, req.virtual_lab_id, &req.lab_name)
        .await?;
    Ok(Json(sub.into()))
}

#[derive(Deserialize)]
pub struct UpgradeRequest {
    pub tier: String,
    pub email: String,
    #[serde(default)]
    pub yearly: bool,
    pub virtual_lab_id: Option<Uuid>,
}

/// Upgrade the calling user to a paid tier. The charge happens synchronously;
/// a declined card fails the whole request and leaves no local state.
pub async fn upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<UpgradeRequest>,
) -> ApiResult<Json<SubscriptionResponse>> {
    let user_id = require_user(&headers)?;
    let tier_kind = TierKind::parse(&req.tier)
        .map_err(|_| ApiError::BadRequest(format!("Unknown tier: {}", req.tier)))?;

    let sub = state
        .billing
        .upgrade_to_paid(user_id, req.virtual_lab_id, &req.email, tier_kind, req.yearly)
        .await?;
    Ok(Json(sub.into()))
}

#[derive(Deserialize)]
pub struct CancelQuery {
    #[serde(default)]
    pub immediate: bool,
}

/// Cancel the calling user's paid subscription. Defaults to cancellation at
/// period end; `?immediate=true` cancels now. The local record transitions
/// when the gateway's deletion webhook arrives.
pub async fn cancel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<CancelQuery>,
) -> ApiResult<Json<SubscriptionResponse>> {
    let user_id = require_user(&headers)?;
    let sub = state
        .billing
        .cancel_paid_subscription(user_id, query.immediate)
        .await?;
    Ok(Json(sub.into()))
}

/// Put the calling user back on the free tier immediately.
pub async fn downgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<SubscriptionResponse>> {
    let user_id = require_user(&headers)?;
    let sub = state
        .billing
        .downgrade_to_free(user_id, ActorType::User)
        .await?;
    Ok(Json(sub.into()))
}

#[derive(Serialize)]
pub struct PaymentResponse {
    pub id: Uuid,
    pub status: String,
    pub amount: i64,
    pub currency: String,
    pub standalone: bool,
    pub receipt_url: Option<String>,
    pub card_brand: Option<String>,
    pub card_last4: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<SubscriptionPayment> for PaymentResponse {
    fn from(p: SubscriptionPayment) -> Self {
        Self {
            id: p.id,
            status: p.status.as_str().to_string(),
            amount: p.amount,
            currency: p.currency,
            standalone: p.standalone,
            receipt_url: p.receipt_url,
            card_brand: p.card_brand,
            card_last4: p.card_last4,
            created_at: p.created_at,
        }
    }
}

/// List payments recorded against one of the calling user's subscriptions
pub async fn list_payments(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(subscription_id): Path<Uuid>,
) -> ApiResult<Json<Vec<PaymentResponse>>> {
    let user_id = require_user(&headers)?;
    let sub = state
        .billing
        .repo()
        .get_by_id(subscription_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    if sub.user_id != user_id {
        return Err(ApiError::NotFound);
    }

    let payments = state
        .billing
        .repo()
        .list_payments_for_subscription(subscription_id)
        .await?;
    Ok(Json(payments.into_iter().map(PaymentResponse::from).collect()))
}
