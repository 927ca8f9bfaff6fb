//! Keel control-plane client
//!
//! A typed HTTP client for the control plane the agent reports to, plus the
//! bounded retry envelope every call goes through.
//!
//! # Example
//!
//! ```no_run
//! use keel_client::{ControlPlane, ControlPlaneClient};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = ControlPlaneClient::new("http://localhost:9080", "piped-1", "secret-key");
//!
//!     for app in client.list_applications().await? {
//!         println!("{} ({})", app.name, app.id);
//!     }
//!     Ok(())
//! }
//! ```

mod applications;
mod commands;
mod deployments;
pub mod error;
pub mod retry;

pub use error::{ClientError, Result};
pub use retry::{Retry, RetryError, Retryable};

use async_trait::async_trait;
use keel_core::domain::application::{Application, DeploymentReference};
use keel_core::domain::command::Command;
use keel_core::domain::deployment::Deployment;
use keel_core::dto::application::{GetMostRecentDeployment, MostRecentDeployment};
use keel_core::dto::command::CommandHandled;
use keel_core::dto::deployment::{
    DeploymentCompleted, DeploymentMetadata, DeploymentPlanned, DeploymentStatusChanged,
    StageLogs, StageMetadata, StageStatusChanged,
};
use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// The control-plane verbs the agent consumes
///
/// All verbs are idempotent, so callers may wrap them in a [`Retry`].
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn create_deployment(&self, deployment: &Deployment) -> Result<()>;

    async fn report_deployment_planned(&self, req: DeploymentPlanned) -> Result<()>;

    async fn report_deployment_status_changed(&self, req: DeploymentStatusChanged) -> Result<()>;

    async fn report_stage_status_changed(&self, req: StageStatusChanged) -> Result<()>;

    async fn report_deployment_completed(&self, req: DeploymentCompleted) -> Result<()>;

    async fn report_application_most_recent_deployment(
        &self,
        req: MostRecentDeployment,
    ) -> Result<()>;

    async fn get_application_most_recent_deployment(
        &self,
        req: GetMostRecentDeployment,
    ) -> Result<Option<DeploymentReference>>;

    /// Applications bound to this agent
    async fn list_applications(&self) -> Result<Vec<Application>>;

    async fn save_stage_metadata(&self, req: StageMetadata) -> Result<()>;

    async fn save_deployment_metadata(&self, req: DeploymentMetadata) -> Result<()>;

    async fn list_not_completed_deployments(&self) -> Result<Vec<Deployment>>;

    async fn list_unhandled_commands(&self) -> Result<Vec<Command>>;

    async fn report_command_handled(&self, req: CommandHandled) -> Result<()>;

    async fn report_stage_logs(&self, req: StageLogs) -> Result<()>;
}

/// HTTP client for the control-plane API
///
/// Every verb is a JSON `POST` to `{base_url}/api/piped/<verb>`, authenticated
/// with the piped ID and API key headers.
#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    /// Base URL of the control plane (e.g., "http://localhost:9080")
    base_url: String,
    piped_id: String,
    api_key: String,
    /// HTTP client instance
    client: Client,
}

impl ControlPlaneClient {
    /// Create a new control-plane client
    ///
    /// # Example
    /// ```
    /// use keel_client::ControlPlaneClient;
    ///
    /// let client = ControlPlaneClient::new("http://localhost:9080/", "piped-1", "key");
    /// assert_eq!(client.base_url(), "http://localhost:9080");
    /// ```
    pub fn new(
        base_url: impl Into<String>,
        piped_id: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self::with_client(base_url, piped_id, api_key, Client::new())
    }

    /// Create a client with a preconfigured reqwest `Client`
    ///
    /// This allows you to configure timeouts, proxies, TLS settings, etc.
    pub fn with_client(
        base_url: impl Into<String>,
        piped_id: impl Into<String>,
        api_key: impl Into<String>,
        client: Client,
    ) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            piped_id: piped_id.into(),
            api_key: api_key.into(),
            client,
        }
    }

    /// Get the base URL of the control plane
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn piped_id(&self) -> &str {
        &self.piped_id
    }

    fn url(&self, verb: &str) -> String {
        format!("{}/api/piped/{}", self.base_url, verb)
    }

    async fn post<B: Serialize + ?Sized>(&self, verb: &str, body: &B) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(self.url(verb))
            .header("x-piped-id", &self.piped_id)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;
        Ok(response)
    }

    /// POST and decode a JSON reply
    async fn call<B: Serialize + ?Sized, T: DeserializeOwned>(&self, verb: &str, body: &B) -> Result<T> {
        let response = self.post(verb, body).await?;
        self.handle_response(response).await
    }

    /// POST and ignore the reply body
    async fn send<B: Serialize + ?Sized>(&self, verb: &str, body: &B) -> Result<()> {
        let response = self.post(verb, body).await?;
        self.handle_empty_response(response).await
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Check the status code and deserialize the JSON body
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }

    /// Check the status code of a reply without a body
    async fn handle_empty_response(&self, response: reqwest::Response) -> Result<()> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = ControlPlaneClient::new("http://localhost:9080", "piped-1", "key");
        assert_eq!(client.base_url(), "http://localhost:9080");
        assert_eq!(client.piped_id(), "piped-1");
    }

    #[test]
    fn test_verb_urls() {
        let client = ControlPlaneClient::new("http://cp.internal/", "piped-1", "key");
        assert_eq!(
            client.url("create-deployment"),
            "http://cp.internal/api/piped/create-deployment"
        );
    }
}
