//! Stripe client configuration

use std::collections::HashMap;
use std::str::FromStr;

use stripe::{
    CancelSubscription, Client, CreateCustomer, CreatePaymentIntent, CreateSubscription,
    CreateSubscriptionItems, Currency, Customer, CustomerId, PaymentIntent, Subscription,
    SubscriptionId, UpdateSubscription,
};

use crate::error::{BillingError, BillingResult};

/// Metadata key marking a payment intent as a one-time top-up.
pub const STANDALONE_METADATA_KEY: &str = "standalone";
/// Metadata key carrying the virtual lab id on gateway objects.
pub const VLAB_METADATA_KEY: &str = "virtual_lab_id";

/// Configuration for Stripe billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: std::env::var("STRIPE_SECRET_KEY")
                .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET")
                .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?,
        })
    }
}

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self { client, config }
    }

    /// Create a new Stripe client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config))
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the config
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    /// Create a Stripe customer for a user. Metadata carries the user id so
    /// gateway objects can always be traced back.
    pub async fn create_customer(
        &self,
        email: &str,
        user_id: &str,
    ) -> BillingResult<CustomerId> {
        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), user_id.to_string());

        let customer = Customer::create(
            &self.client,
            CreateCustomer {
                email: Some(email),
                metadata: Some(metadata),
                ..Default::default()
            },
        )
        .await?;
        Ok(customer.id)
    }

    /// Create a gateway subscription for `price_id`, charged immediately.
    /// `error_if_incomplete` makes the create fail synchronously when the
    /// first charge does not go through, so no half-created subscriptions
    /// need local grace-period handling.
    pub async fn create_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
        metadata: HashMap<String, String>,
    ) -> BillingResult<Subscription> {
        let customer: CustomerId = customer_id
            .parse()
            .map_err(|_| BillingError::Config(format!("invalid customer id: {customer_id}")))?;

        let mut params = CreateSubscription::new(customer);
        params.items = Some(vec![CreateSubscriptionItems {
            price: Some(price_id.to_string()),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.payment_behavior = Some(stripe::SubscriptionPaymentBehavior::ErrorIfIncomplete);
        params.metadata = Some(metadata);
        params.expand = &["latest_invoice", "items.data.price"];

        Ok(Subscription::create(&self.client, params).await?)
    }

    /// Flip auto-renew by setting `cancel_at_period_end` on the gateway side.
    pub async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel_at_period_end: bool,
    ) -> BillingResult<Subscription> {
        let sub_id: SubscriptionId = subscription_id
            .parse()
            .map_err(|_| BillingError::Config(format!("invalid subscription id: {subscription_id}")))?;

        let params = UpdateSubscription {
            cancel_at_period_end: Some(cancel_at_period_end),
            ..Default::default()
        };
        Ok(Subscription::update(&self.client, &sub_id, params).await?)
    }

    /// Cancel a gateway subscription immediately. The resulting
    /// `customer.subscription.deleted` webhook drives the local downgrade.
    pub async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<Subscription> {
        let sub_id: SubscriptionId = subscription_id
            .parse()
            .map_err(|_| BillingError::Config(format!("invalid subscription id: {subscription_id}")))?;

        Ok(Subscription::cancel(&self.client, &sub_id, CancelSubscription::new()).await?)
    }

    /// Create a one-time top-up payment intent. The standalone marker in
    /// metadata is what routes the resulting payment webhooks away from the
    /// subscription-cycle path.
    pub async fn create_standalone_payment_intent(
        &self,
        amount_minor: i64,
        currency: &str,
        customer_id: &str,
        virtual_lab_id: &str,
    ) -> BillingResult<PaymentIntent> {
        let currency = Currency::from_str(currency)
            .map_err(|_| BillingError::Config(format!("invalid currency: {currency}")))?;
        let customer: CustomerId = customer_id
            .parse()
            .map_err(|_| BillingError::Config(format!("invalid customer id: {customer_id}")))?;

        let mut metadata = HashMap::new();
        metadata.insert(STANDALONE_METADATA_KEY.to_string(), "true".to_string());
        metadata.insert(VLAB_METADATA_KEY.to_string(), virtual_lab_id.to_string());

        let mut params = CreatePaymentIntent::new(amount_minor, currency);
        params.customer = Some(customer);
        params.metadata = Some(metadata);

        Ok(PaymentIntent::create(&self.client, params).await?)
    }
}
