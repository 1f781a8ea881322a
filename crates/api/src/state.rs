//! Application state

use std::sync::Arc;

use sqlx::PgPool;
use vlabs_billing::{
    AccountingClient, BillingEventLogger, DirectoryClient, StripeClient, StripeConfig,
    SubscriptionRepository, SubscriptionService, WebhookHandler,
};

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub billing: Arc<SubscriptionService>,
    pub webhooks: Arc<WebhookHandler>,
    pub events: BillingEventLogger,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let repo = SubscriptionRepository::new(pool.clone());
        let stripe = StripeClient::new(StripeConfig {
            secret_key: config.stripe_secret_key.clone(),
            webhook_secret: config.stripe_webhook_secret.clone(),
        });
        let accounting = AccountingClient::new(config.accounting_base_url.clone());
        let directory = DirectoryClient::new(config.directory_base_url.clone());
        let events = BillingEventLogger::new(pool.clone());

        let billing = SubscriptionService::new(
            repo,
            stripe,
            accounting,
            directory,
            events.clone(),
        );
        let webhooks = WebhookHandler::new(billing.clone());

        Self {
            pool,
            config,
            billing: Arc::new(billing),
            webhooks: Arc::new(webhooks),
            events,
        }
    }
}
