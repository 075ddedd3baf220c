//! LLM Executor Contract
//!
//! The orchestration core never talks to a model provider directly; the
//! execution worker hands each claimed agent to an [`LlmExecutor`]
//! implementation and records whatever comes back. Implementations live
//! outside this crate (HTTP gateways, local runtimes, test scripts).

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// One execution request, carrying everything the executor contract needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub agent_id: Uuid,
    pub task: String,
    pub workspace_path: Option<PathBuf>,
    pub token_budget: u64,
    pub model_hint: Option<String>,
}

/// Executor result. The executor must not exceed `token_budget` by more than
/// a bounded overhead; any overage is still charged to the agent's budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub ok: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration_ms: u64,
    pub cost_usd: Option<f64>,
}

impl ExecutionOutcome {
    pub fn tokens_total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// The external LLM execution seam. Idempotence is not assumed: the worker
/// invokes it exactly once per claim.
#[async_trait]
pub trait LlmExecutor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutcome>;
}
