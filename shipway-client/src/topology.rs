//! Access grants and target service endpoints

use crate::OrchestratorClient;
use crate::error::Result;
use shipway_core::domain::grant::Grant;
use shipway_core::dto::service::ServiceStatus;

impl OrchestratorClient {
    /// Effective grants held by the executor identities
    pub async fn list_grants(&self) -> Result<Vec<Grant>> {
        let url = format!("{}/api/grants", self.base_url);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// What the cluster is currently serving
    pub async fn get_service(&self) -> Result<ServiceStatus> {
        let url = format!("{}/api/service", self.base_url);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// Whether the orchestrator answers its health check
    pub async fn health(&self) -> Result<bool> {
        let url = format!("{}/health", self.base_url);
        let response = self.client.get(&url).send().await?;

        Ok(response.status().is_success())
    }
}
