//! Budget flow tests: reservation at spawn, reclamation at termination,
//! exactly-once semantics and the exhaustion boundary.

use async_trait::async_trait;
use fleet_orchestrator::{
    AgentStatus, ExecutionOutcome, ExecutionRequest, LlmExecutor, LocalWorkspaceManager,
    Orchestrator, OrchestratorConfig, OrchestratorError, SpawnRequest, Store,
};
use std::sync::Arc;

struct StaticExecutor;

#[async_trait]
impl LlmExecutor for StaticExecutor {
    async fn execute(
        &self,
        _request: ExecutionRequest,
    ) -> Result<ExecutionOutcome, OrchestratorError> {
        Ok(ExecutionOutcome {
            ok: true,
            output: Some("done".into()),
            error: None,
            input_tokens: 0,
            output_tokens: 0,
            duration_ms: 1,
            cost_usd: None,
        })
    }
}

fn orchestrator(dir: &tempfile::TempDir) -> Orchestrator {
    Orchestrator::new(
        OrchestratorConfig::default(),
        Arc::new(Store::new()),
        Arc::new(StaticExecutor),
        Arc::new(LocalWorkspaceManager::new(dir.path())),
    )
}

#[tokio::test]
async fn parent_child_reclamation() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(&dir);
    let lifecycle = orch.lifecycle();
    let budgets = orch.budgets();

    let parent = lifecycle
        .spawn(SpawnRequest::new("coordinator", "parent task", 1000))
        .await
        .unwrap();
    let child = lifecycle
        .spawn(SpawnRequest::new("worker", "child task", 400).with_parent(parent.id))
        .await
        .unwrap();
    assert_eq!(budgets.get(parent.id).await.unwrap().reserved, 400);

    budgets.consume(child.id, 250).await.unwrap();
    lifecycle
        .update_status(child.id, AgentStatus::Completed)
        .await
        .unwrap();

    let child_budget = budgets.get(child.id).await.unwrap();
    assert!(child_budget.reclaimed);
    let parent_budget = budgets.get(parent.id).await.unwrap();
    assert_eq!(parent_budget.reserved, 0);
    assert_eq!(parent_budget.available(), 750);
}

#[tokio::test]
async fn double_reclamation_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(&dir);
    let lifecycle = orch.lifecycle();
    let budgets = orch.budgets();

    let parent = lifecycle
        .spawn(SpawnRequest::new("coordinator", "parent task", 1000))
        .await
        .unwrap();
    let child = lifecycle
        .spawn(SpawnRequest::new("worker", "child task", 300).with_parent(parent.id))
        .await
        .unwrap();
    budgets.consume(child.id, 120).await.unwrap();
    lifecycle
        .update_status(child.id, AgentStatus::Failed)
        .await
        .unwrap();

    let once = budgets.get(parent.id).await.unwrap();
    // Explicit second reclamation replays the terminal cascade.
    assert!(!budgets.reclaim(child.id).await.unwrap());
    let twice = budgets.get(parent.id).await.unwrap();
    assert_eq!(once.used, twice.used);
    assert_eq!(once.reserved, twice.reserved);
    assert_eq!(once.available(), twice.available());
}

#[tokio::test]
async fn overdrawn_spawn_fails_without_partial_state() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(&dir);
    let lifecycle = orch.lifecycle();
    let budgets = orch.budgets();

    let parent = lifecycle
        .spawn(SpawnRequest::new("coordinator", "parent task", 500))
        .await
        .unwrap();
    lifecycle
        .spawn(SpawnRequest::new("worker", "first", 400).with_parent(parent.id))
        .await
        .unwrap();

    let err = lifecycle
        .spawn(SpawnRequest::new("worker", "second", 200).with_parent(parent.id))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::BudgetExhausted(_)));

    let parent_budget = budgets.get(parent.id).await.unwrap();
    assert_eq!(parent_budget.reserved, 400);
    assert_eq!(orch.hierarchy().descendants(parent.id).await.len(), 1);
}

#[tokio::test]
async fn multi_level_reclamation_stays_per_level() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(&dir);
    let lifecycle = orch.lifecycle();
    let budgets = orch.budgets();

    let root = lifecycle
        .spawn(SpawnRequest::new("coordinator", "root", 1000))
        .await
        .unwrap();
    let mid = lifecycle
        .spawn(SpawnRequest::new("lead", "mid", 600).with_parent(root.id))
        .await
        .unwrap();
    let leaf = lifecycle
        .spawn(SpawnRequest::new("worker", "leaf", 200).with_parent(mid.id))
        .await
        .unwrap();

    budgets.consume(leaf.id, 50).await.unwrap();
    lifecycle
        .update_status(leaf.id, AgentStatus::Completed)
        .await
        .unwrap();

    // The leaf reclaims into the mid level only; the root is untouched
    // until the mid agent itself terminates.
    let mid_budget = budgets.get(mid.id).await.unwrap();
    assert_eq!(mid_budget.reserved, 0);
    assert_eq!(mid_budget.used, 50);
    let root_budget = budgets.get(root.id).await.unwrap();
    assert_eq!(root_budget.reserved, 600);
    assert_eq!(root_budget.used, 0);

    budgets.consume(mid.id, 100).await.unwrap();
    lifecycle
        .update_status(mid.id, AgentStatus::Completed)
        .await
        .unwrap();
    let root_budget = budgets.get(root.id).await.unwrap();
    assert_eq!(root_budget.reserved, 0);
    assert_eq!(root_budget.used, 150);
    assert_eq!(root_budget.available(), 850);
}

#[tokio::test]
async fn terminated_tree_reclaims_every_member() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(&dir);
    let lifecycle = orch.lifecycle();
    let budgets = orch.budgets();

    let root = lifecycle
        .spawn(SpawnRequest::new("coordinator", "root", 1000))
        .await
        .unwrap();
    let a = lifecycle
        .spawn(SpawnRequest::new("worker", "a", 300).with_parent(root.id))
        .await
        .unwrap();
    let b = lifecycle
        .spawn(SpawnRequest::new("worker", "b", 300).with_parent(root.id))
        .await
        .unwrap();
    budgets.consume(a.id, 10).await.unwrap();

    lifecycle.terminate_tree(root.id, "operator stop").await.unwrap();

    for id in [root.id, a.id, b.id] {
        let agent = lifecycle.get(id).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Terminated);
        assert!(budgets.get(id).await.unwrap().reclaimed);
    }
    let root_budget = budgets.get(root.id).await.unwrap();
    assert_eq!(root_budget.reserved, 0);
    assert_eq!(root_budget.used, 10);
}
