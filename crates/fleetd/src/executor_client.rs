//! HTTP client for the external LLM executor service.

use async_trait::async_trait;
use fleet_orchestrator::{
    ExecutionOutcome, ExecutionRequest, LlmExecutor, OrchestratorError,
};
use reqwest::Client;

pub struct HttpLlmExecutor {
    client: Client,
    endpoint: String,
}

impl HttpLlmExecutor {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl LlmExecutor for HttpLlmExecutor {
    async fn execute(
        &self,
        request: ExecutionRequest,
    ) -> Result<ExecutionOutcome, OrchestratorError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| OrchestratorError::ExecutorFailed(format!("request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(OrchestratorError::ExecutorFailed(format!(
                "executor returned {}",
                response.status()
            )));
        }
        response
            .json::<ExecutionOutcome>()
            .await
            .map_err(|e| OrchestratorError::ExecutorFailed(format!("malformed response: {e}")))
    }
}
