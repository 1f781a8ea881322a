//! Credit ledger (accounting service) client
//!
//! Top-ups are best-effort from the webhook path's point of view: the
//! caller decides whether a failure is swallowed. This client only retries
//! transient failures; a 4xx is returned immediately.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

const RETRY_BASE_DELAY_MS: u64 = 200;
const RETRY_MAX_DELAY: Duration = Duration::from_secs(5);
const MAX_RETRIES: usize = 3;

#[derive(Debug, Serialize)]
struct TopUpRequest {
    virtual_lab_id: Uuid,
    amount: i64,
}

#[derive(Debug, Deserialize)]
pub struct TopUpResponse {
    pub virtual_lab_id: Uuid,
    /// Ledger balance after the top-up, in credits
    pub balance: i64,
}

#[derive(Debug, Serialize)]
struct CreateAccountRequest {
    id: Uuid,
    name: String,
}

#[derive(Clone)]
pub struct AccountingClient {
    http: reqwest::Client,
    base_url: String,
}

impl AccountingClient {
    pub fn new(base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        let base_url = std::env::var("ACCOUNTING_BASE_URL")
            .map_err(|_| BillingError::Config("ACCOUNTING_BASE_URL not set".to_string()))?;
        Ok(Self::new(base_url))
    }

    /// Credit a virtual lab's ledger balance. Retries transient failures
    /// with exponential backoff before giving up.
    pub async fn top_up(&self, virtual_lab_id: Uuid, credits: i64) -> BillingResult<TopUpResponse> {
        let url = format!("{}/budget/top-up", self.base_url);
        let body = TopUpRequest {
            virtual_lab_id,
            amount: credits,
        };

        let retry_strategy = ExponentialBackoff::from_millis(RETRY_BASE_DELAY_MS)
            .max_delay(RETRY_MAX_DELAY)
            .take(MAX_RETRIES)
            .map(jitter);

        Retry::spawn(retry_strategy, || async {
            match self.post_top_up(&url, &body).await {
                Ok(response) => Ok(Ok(response)),
                Err(attempt) if attempt.transient => {
                    tracing::debug!(%virtual_lab_id, error = %attempt.error, "Transient ledger error, will retry");
                    Err(Err(attempt.error))
                }
                Err(attempt) => Ok(Err(attempt.error)),
            }
        })
        .await
        .unwrap_or_else(|e| e)
    }

    async fn post_top_up(&self, url: &str, body: &TopUpRequest) -> Result<TopUpResponse, AttemptError> {
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(AttemptError::from_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AttemptError {
                // Only the server misbehaving is worth retrying; a 4xx is a
                // rejection that will not change on redelivery.
                transient: status.is_server_error(),
                error: BillingError::Accounting(format!("top-up rejected with {status}: {detail}")),
            });
        }
        response
            .json::<TopUpResponse>()
            .await
            .map_err(AttemptError::from_reqwest)
    }

    /// Open a ledger account for a new virtual lab.
    pub async fn create_account(&self, virtual_lab_id: Uuid, name: &str) -> BillingResult<()> {
        let url = format!("{}/account/", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&CreateAccountRequest {
                id: virtual_lab_id,
                name: name.to_string(),
            })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(BillingError::Accounting(format!(
                "account creation rejected with {status}: {detail}"
            )));
        }
        Ok(())
    }
}

/// One failed top-up attempt, classified before the status code and body
/// are flattened into the error message.
struct AttemptError {
    transient: bool,
    error: BillingError,
}

impl AttemptError {
    fn from_reqwest(error: reqwest::Error) -> Self {
        Self {
            transient: error.is_connect() || error.is_timeout(),
            error: BillingError::Accounting(format!("ledger request failed: {error}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_top_up_success() {
        let mut server = mockito::Server::new_async().await;
        let lab_id = Uuid::new_v4();
        let mock = server
            .mock("POST", "/budget/top-up")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(format!(
                r#"{{"virtual_lab_id": "{lab_id}", "balance": 150}}"#
            ))
            .create_async()
            .await;

        let client = AccountingClient::new(server.url());
        let response = client.top_up(lab_id, 50).await.unwrap();
        assert_eq!(response.balance, 150);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_top_up_client_error_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/budget/top-up")
            .with_status(422)
            .with_body(r#"{"detail": "unknown virtual lab"}"#)
            .expect(1)
            .create_async()
            .await;

        let client = AccountingClient::new(server.url());
        let result = client.top_up(Uuid::new_v4(), 50).await;
        assert!(matches!(result, Err(BillingError::Accounting(_))));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_top_up_rejection_body_does_not_affect_classification() {
        let mut server = mockito::Server::new_async().await;
        // The rejection detail quotes an amount; digits in the body must not
        // make a 4xx look like a 5xx.
        let mock = server
            .mock("POST", "/budget/top-up")
            .with_status(422)
            .with_body(r#"{"detail": "amount 500 exceeds the lab limit"}"#)
            .expect(1)
            .create_async()
            .await;

        let client = AccountingClient::new(server.url());
        let result = client.top_up(Uuid::new_v4(), 500).await;
        assert!(matches!(result, Err(BillingError::Accounting(_))));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_top_up_retries_server_errors() {
        let mut server = mockito::Server::new_async().await;
        let lab_id = Uuid::new_v4();
        let failing = server
            .mock("POST", "/budget/top-up")
            .with_status(503)
            .expect_at_least(2)
            .create_async()
            .await;

        let client = AccountingClient::new(server.url());
        let result = client.top_up(lab_id, 50).await;
        // The 503 is transient, so the request is attempted more than once
        // before the error is surfaced.
        failing.assert_async().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_create_account() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/account/")
            .with_status(201)
            .with_body("{}")
            .create_async()
            .await;

        let client = AccountingClient::new(server.url());
        client
            .create_account(Uuid::new_v4(), "Neuro Lab")
            .await
            .unwrap();
        mock.assert_async().await;
    }
}
