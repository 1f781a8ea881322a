#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Virtual Labs Billing
//!
//! Subscription lifecycle and payment reconciliation for the virtual-labs
//! platform. The local database is reconciled against the Stripe event
//! stream: webhook events are deduplicated by their external event id,
//! classified, and dispatched to subscription-state transitions that grant
//! compute credits through the accounting service.
//!
//! Core pieces:
//! - [`model`]: subscription records (free/paid details as a tagged variant),
//!   payments, statuses
//! - [`tier`]: tier catalog with price ids, credit grants and an active flag
//! - [`credits`]: currency-to-credit conversion at a fixed rate
//! - [`repo`]: sqlx repository over the subscription tables
//! - [`subscriptions`]: the state machine (activate, upgrade, cancel, downgrade)
//! - [`webhooks`]: signature verification and idempotent event processing
//! - [`accounting`] / [`directory`]: external ledger and identity-directory
//!   clients, called best-effort after the durable write

pub mod accounting;
pub mod client;
pub mod credits;
pub mod directory;
pub mod error;
pub mod events;
pub mod model;
pub mod repo;
pub mod subscriptions;
pub mod tier;
pub mod webhooks;

pub use accounting::AccountingClient;
pub use client::{StripeClient, StripeConfig};
pub use credits::{credits_for_amount, CREDITS_PER_MINOR_UNIT_NUM};
pub use directory::DirectoryClient;
pub use error::{BillingError, BillingResult};
pub use events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
pub use model::{
    PaymentStatus, Subscription, SubscriptionDetails, SubscriptionPayment, SubscriptionSource,
    SubscriptionStatus,
};
pub use repo::SubscriptionRepository;
pub use subscriptions::{GatewaySubscription, SubscriptionService};
pub use tier::{SubscriptionTier, TierKind};
pub use webhooks::{classify, EventClass, WebhookHandler, WebhookOutcome};
