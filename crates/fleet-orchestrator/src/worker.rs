//! Agent Execution Worker
//!
//! Background loop that claims pending agents, hands them to the LLM
//! executor and records the outcome as a terminal transition. Parallelism is
//! a bounded fan-out over each claimed batch; the claim itself is one store
//! transaction, so concurrent workers never double-claim.
//!
//! The worker never propagates errors upward: executor failures and
//! timeouts become a `failed` agent with an error payload. A terminal-guard
//! rejection at commit time means external termination won the race, and
//! the result is discarded.

use crate::budget::BudgetService;
use crate::executor::{ExecutionRequest, LlmExecutor};
use crate::lifecycle::AgentLifecycleService;
use crate::model::{AgentRecord, AgentStatus};
use crate::store::{ExecutionPatch, Store};
use crate::{OrchestratorError, WorkerConfig};
use futures::StreamExt;
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct ExecutionWorker {
    store: Arc<Store>,
    budgets: Arc<BudgetService>,
    lifecycle: Arc<AgentLifecycleService>,
    executor: Arc<dyn LlmExecutor>,
    config: WorkerConfig,
}

impl ExecutionWorker {
    pub fn new(
        store: Arc<Store>,
        budgets: Arc<BudgetService>,
        lifecycle: Arc<AgentLifecycleService>,
        executor: Arc<dyn LlmExecutor>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            budgets,
            lifecycle,
            executor,
            config,
        }
    }

    /// Run until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            interval = ?self.config.interval,
            claim_limit = self.config.claim_limit,
            concurrency = self.config.concurrency,
            "execution worker started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
        info!("execution worker stopped");
    }

    /// One scheduling round: claim a batch of pending agents and execute
    /// them with bounded concurrency. Returns the number of agents claimed.
    pub async fn tick(&self) -> usize {
        let claimed = self.store.claim_pending_agents(self.config.claim_limit).await;
        let count = claimed.len();
        if count == 0 {
            return 0;
        }
        debug!(claimed = count, "execution worker claimed agents");
        futures::stream::iter(claimed)
            .for_each_concurrent(self.config.concurrency, |agent| async move {
                self.execute_one(agent).await;
            })
            .await;
        count
    }

    /// Execute one claimed agent and commit its outcome.
    async fn execute_one(&self, agent: AgentRecord) {
        let token_budget = match self.budgets.get(agent.id).await {
            Ok(budget) => budget.available(),
            Err(e) => {
                warn!(agent_id = %agent.id, error = %e, "budget missing for claimed agent");
                return;
            }
        };
        let request = ExecutionRequest {
            agent_id: agent.id,
            task: agent.task.clone(),
            workspace_path: agent.workspace_path.clone().map(PathBuf::from),
            token_budget,
            model_hint: agent.model_hint.clone(),
        };

        let started = Instant::now();
        let outcome = tokio::time::timeout(self.config.executor_timeout, self.executor.execute(request)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let (status, patch) = match outcome {
            Err(_) => (
                AgentStatus::Failed,
                ExecutionPatch {
                    error: Some(format!(
                        "executor timed out after {:?}",
                        self.config.executor_timeout
                    )),
                    execution_duration_ms: Some(elapsed_ms),
                    ..ExecutionPatch::default()
                },
            ),
            Ok(Err(e)) => (
                AgentStatus::Failed,
                ExecutionPatch {
                    error: Some(e.to_string()),
                    execution_duration_ms: Some(elapsed_ms),
                    ..ExecutionPatch::default()
                },
            ),
            Ok(Ok(outcome)) => {
                let tokens = outcome.tokens_total();
                let charged = match self.budgets.charge(agent.id, tokens).await {
                    Ok(charged) => charged,
                    Err(e) => {
                        warn!(agent_id = %agent.id, error = %e, "charging executor consumption");
                        0
                    }
                };
                let overran = charged < tokens;
                let status = if outcome.ok && !overran {
                    AgentStatus::Completed
                } else {
                    AgentStatus::Failed
                };
                let error = if overran {
                    Some(format!(
                        "token budget exhausted: executor reported {tokens}, budget covered {charged}"
                    ))
                } else {
                    outcome.error.clone()
                };
                let result = outcome.output.as_ref().map(|raw| {
                    serde_json::from_str(raw)
                        .unwrap_or_else(|_| serde_json::Value::String(raw.clone()))
                });
                (
                    status,
                    ExecutionPatch {
                        result,
                        error,
                        tokens_used: Some(charged),
                        execution_duration_ms: Some(if outcome.duration_ms > 0 {
                            outcome.duration_ms
                        } else {
                            elapsed_ms
                        }),
                        ..ExecutionPatch::default()
                    },
                )
            }
        };

        self.commit_outcome(agent.id, status, patch).await;
    }

    /// Commit with bounded, jittered retries on store conflicts. A terminal
    /// guard rejection means the agent was terminated mid-flight; the result
    /// is dropped on the floor.
    async fn commit_outcome(&self, agent_id: uuid::Uuid, status: AgentStatus, patch: ExecutionPatch) {
        let mut attempt = 0u32;
        loop {
            match self
                .lifecycle
                .record_outcome(agent_id, status, patch.clone())
                .await
            {
                Ok(_) => {
                    debug!(agent_id = %agent_id, status = ?status, "execution outcome committed");
                    return;
                }
                Err(OrchestratorError::InvalidTransition(reason)) => {
                    debug!(agent_id = %agent_id, reason, "discarding outcome for terminated agent");
                    return;
                }
                Err(OrchestratorError::StoreConflict(reason)) if attempt < self.config.max_commit_retries => {
                    attempt += 1;
                    let jitter = rand::thread_rng().gen_range(0..50);
                    let backoff = Duration::from_millis(50 * u64::from(attempt) + jitter);
                    debug!(agent_id = %agent_id, attempt, reason, "store conflict, retrying commit");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    warn!(agent_id = %agent_id, error = %e, "failed to commit execution outcome");
                    return;
                }
            }
        }
    }
}
