//! Identity directory client
//!
//! Mirrors the user's current plan into their directory profile so other
//! services can read it without touching billing. The directory exposes a
//! read-merge-write attribute API, so an update never clobbers attributes
//! owned by someone else.

use serde_json::Value;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

pub const PLAN_ATTRIBUTE: &str = "plan";

#[derive(Clone)]
pub struct DirectoryClient {
    http: reqwest::Client,
    base_url: String,
}

impl DirectoryClient {
    pub fn new(base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        let base_url = std::env::var("DIRECTORY_BASE_URL")
            .map_err(|_| BillingError::Config("DIRECTORY_BASE_URL not set".to_string()))?;
        Ok(Self::new(base_url))
    }

    /// Set the user's `plan` attribute to the given tier name.
    pub async fn set_plan(&self, user_id: Uuid, plan: &str) -> BillingResult<()> {
        let url = format!("{}/users/{user_id}", self.base_url);

        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(BillingError::Directory(format!(
                "user lookup failed with {status}: {detail}"
            )));
        }
        let mut profile: Value = response.json().await?;

        let attributes = profile
            .as_object_mut()
            .ok_or_else(|| BillingError::Directory("malformed user profile".to_string()))?
            .entry("attributes")
            .or_insert_with(|| Value::Object(Default::default()));
        match attributes.as_object_mut() {
            Some(map) => {
                map.insert(
                    PLAN_ATTRIBUTE.to_string(),
                    Value::Array(vec![Value::String(plan.to_string())]),
                );
            }
            None => {
                return Err(BillingError::Directory(
                    "malformed user attributes".to_string(),
                ))
            }
        }

        let response = self.http.put(&url).json(&profile).send().await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(BillingError::Directory(format!(
                "user update failed with {status}: {detail}"
            )));
        }
        Ok(())
    }
}

/// Run a directory update without letting its outcome affect the caller.
/// Plan mirroring is advisory; a failure is logged and dropped.
pub async fn set_plan_best_effort(directory: &DirectoryClient, user_id: Uuid, plan: &str) {
    if let Err(e) = directory.set_plan(user_id, plan).await {
        tracing::warn!(%user_id, plan, error = %e, "Failed to mirror plan to identity directory");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_plan_merges_existing_attributes() {
        let mut server = mockito::Server::new_async().await;
        let user_id = Uuid::new_v4();
        let path = format!("/users/{user_id}");

        let get_mock = server
            .mock("GET", path.as_str())
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"email": "ada@example.org", "attributes": {"team": ["alpha"]}}"#)
            .create_async()
            .await;
        let put_mock = server
            .mock("PUT", path.as_str())
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "attributes": {"team": ["alpha"], "plan": ["pro"]}
            })))
            .with_status(204)
            .create_async()
            .await;

        let client = DirectoryClient::new(server.url());
        client.set_plan(user_id, "pro").await.unwrap();
        get_mock.assert_async().await;
        put_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_best_effort_swallows_failures() {
        let mut server = mockito::Server::new_async().await;
        let user_id = Uuid::new_v4();
        server
            .mock("GET", format!("/users/{user_id}").as_str())
            .with_status(500)
            .create_async()
            .await;

        let client = DirectoryClient::new(server.url());
        // Must not panic or propagate.
        set_plan_best_effort(&client, user_id, "free").await;
    }
}
