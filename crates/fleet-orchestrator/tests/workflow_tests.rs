//! Workflow engine tests: frontier-only spawning, dependency-ordered
//! execution, result propagation, fail-fast cascades and termination.

use async_trait::async_trait;
use chrono::Utc;
use fleet_orchestrator::{
    AgentStatus, EdgePattern, ExecutionOutcome, ExecutionRequest, GraphStatus, LlmExecutor,
    LocalWorkspaceManager, NodeExecutionStatus, NodePatch, NodeTemplate, Orchestrator,
    OrchestratorConfig, OrchestratorError, SpawnRequest, Store, TemplateSpec, ValidationStatus,
    WorkflowGraphRecord, WorkflowNodeRecord,
};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

struct StaticExecutor;

#[async_trait]
impl LlmExecutor for StaticExecutor {
    async fn execute(
        &self,
        _request: ExecutionRequest,
    ) -> Result<ExecutionOutcome, OrchestratorError> {
        Ok(ExecutionOutcome {
            ok: true,
            output: None,
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

/// Template with one node per (id, dependencies) pair, evenly budgeted.
fn template_spec(name: &str, nodes: &[(&str, &[&str])]) -> TemplateSpec {
    let percentage = 80.0 / nodes.len() as f64;
    TemplateSpec {
        name: name.into(),
        description: format!("{name} workflow"),
        category: None,
        node_templates: nodes
            .iter()
            .enumerate()
            .map(|(position, (id, deps))| NodeTemplate {
                node_id: (*id).into(),
                role: format!("{id}-agent"),
                task_template: format!("{id}: {{TASK}}"),
                budget_percentage: percentage,
                dependencies: deps.iter().map(|d| (*d).to_string()).collect(),
                position: position as i32,
            })
            .collect(),
        edge_patterns: nodes
            .iter()
            .flat_map(|(id, deps)| {
                deps.iter().map(|dep| EdgePattern {
                    source_node_id: (*dep).into(),
                    target_node_id: (*id).into(),
                })
            })
            .collect(),
        total_estimated_budget: 300_000,
        complexity_rating: 3.0,
        min_budget_required: 10_000,
        created_by: None,
    }
}

async fn start_workflow(
    orch: &Orchestrator,
    nodes: &[(&str, &[&str])],
    budget: u64,
) -> (Uuid, Uuid) {
    let template = orch
        .workflows()
        .create_template(template_spec("wf", nodes))
        .await
        .unwrap();
    let graph = orch
        .engine()
        .instantiate_template(template.id, "run", "the shared task", budget)
        .await
        .unwrap();
    let root = orch
        .lifecycle()
        .spawn(SpawnRequest::new("coordinator", "drive the workflow", budget))
        .await
        .unwrap();
    orch.engine()
        .execute_workflow(graph.id, Some(root.id))
        .await
        .unwrap();
    (graph.id, root.id)
}

async fn node_at(orch: &Orchestrator, graph_id: Uuid, position: i32) -> WorkflowNodeRecord {
    orch.store()
        .graph_nodes(graph_id)
        .await
        .into_iter()
        .find(|n| n.position == position)
        .unwrap()
}

async fn graph(orch: &Orchestrator, graph_id: Uuid) -> WorkflowGraphRecord {
    orch.store().get_graph(graph_id).await.unwrap()
}

#[tokio::test]
async fn linear_workflow_runs_in_dependency_order() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(&dir);
    let nodes: &[(&str, &[&str])] = &[("n0", &[]), ("n1", &["n0"]), ("n2", &["n1"])];
    let (graph_id, _root) = start_workflow(&orch, nodes, 300_000).await;

    // t0: only the frontier is live.
    let n0 = node_at(&orch, graph_id, 0).await;
    assert_eq!(n0.execution_status, NodeExecutionStatus::Executing);
    assert_eq!(node_at(&orch, graph_id, 1).await.execution_status, NodeExecutionStatus::Pending);
    assert_eq!(node_at(&orch, graph_id, 2).await.execution_status, NodeExecutionStatus::Pending);

    orch.engine()
        .process_completed_node(n0.agent_id.unwrap(), Some(json!({"x": 1})))
        .await
        .unwrap();

    let n1 = node_at(&orch, graph_id, 1).await;
    assert_eq!(n1.execution_status, NodeExecutionStatus::Executing);
    assert_eq!(node_at(&orch, graph_id, 2).await.execution_status, NodeExecutionStatus::Pending);

    // The spawned agent's task carries the upstream result.
    let n1_agent = orch.lifecycle().get(n1.agent_id.unwrap()).await.unwrap();
    assert!(n1_agent.task.contains("## Dependency outputs"));
    assert!(n1_agent.task.contains(r#""x":1"#));

    let progress = orch.engine().progress(graph_id).await.unwrap();
    assert_eq!(progress.completed, 1);
    assert_eq!(progress.executing, 1);
    assert_eq!(progress.pending, 1);
    assert_eq!(progress.total, 3);

    orch.engine()
        .process_completed_node(n1.agent_id.unwrap(), Some(json!({"y": 2})))
        .await
        .unwrap();
    let n2 = node_at(&orch, graph_id, 2).await;
    assert_eq!(n2.execution_status, NodeExecutionStatus::Executing);

    orch.engine()
        .process_completed_node(n2.agent_id.unwrap(), Some(json!("done")))
        .await
        .unwrap();
    let g = graph(&orch, graph_id).await;
    assert_eq!(g.status, GraphStatus::Completed);
    assert!(g.completed_at.is_some());
}

#[tokio::test]
async fn diamond_join_waits_for_both_branches() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(&dir);
    let nodes: &[(&str, &[&str])] = &[
        ("a", &[]),
        ("b", &["a"]),
        ("c", &["a"]),
        ("d", &["b", "c"]),
    ];
    let (graph_id, _root) = start_workflow(&orch, nodes, 300_000).await;

    let a = node_at(&orch, graph_id, 0).await;
    orch.engine()
        .process_completed_node(a.agent_id.unwrap(), Some(json!({"from": "a"})))
        .await
        .unwrap();

    // Both branches become live together.
    let b = node_at(&orch, graph_id, 1).await;
    let c = node_at(&orch, graph_id, 2).await;
    assert_eq!(b.execution_status, NodeExecutionStatus::Executing);
    assert_eq!(c.execution_status, NodeExecutionStatus::Executing);
    assert_eq!(node_at(&orch, graph_id, 3).await.execution_status, NodeExecutionStatus::Pending);

    orch.engine()
        .process_completed_node(b.agent_id.unwrap(), Some(json!({"from": "b"})))
        .await
        .unwrap();
    // The join still waits on the other branch.
    assert_eq!(node_at(&orch, graph_id, 3).await.execution_status, NodeExecutionStatus::Pending);

    orch.engine()
        .process_completed_node(c.agent_id.unwrap(), Some(json!({"from": "c"})))
        .await
        .unwrap();
    let d = node_at(&orch, graph_id, 3).await;
    assert_eq!(d.execution_status, NodeExecutionStatus::Executing);

    let d_agent = orch.lifecycle().get(d.agent_id.unwrap()).await.unwrap();
    assert!(d_agent.task.contains(r#""from":"b""#));
    assert!(d_agent.task.contains(r#""from":"c""#));

    orch.engine()
        .process_completed_node(d.agent_id.unwrap(), None)
        .await
        .unwrap();
    assert_eq!(graph(&orch, graph_id).await.status, GraphStatus::Completed);
}

#[tokio::test]
async fn only_the_frontier_is_spawned_at_start() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(&dir);
    let nodes: &[(&str, &[&str])] = &[
        ("n0", &[]),
        ("n1", &["n0"]),
        ("n2", &["n1"]),
        ("n3", &["n2"]),
    ];
    let (graph_id, root) = start_workflow(&orch, nodes, 300_000).await;

    // Exactly one node agent exists: the root plus node0's agent.
    let agents = orch.store().list_agents().await;
    let node_agents: Vec<_> = agents.iter().filter(|a| a.parent_id == Some(root)).collect();
    assert_eq!(node_agents.len(), 1);

    let statuses: Vec<NodeExecutionStatus> = orch
        .store()
        .graph_nodes(graph_id)
        .await
        .iter()
        .map(|n| n.execution_status)
        .collect();
    assert_eq!(
        statuses,
        vec![
            NodeExecutionStatus::Executing,
            NodeExecutionStatus::Pending,
            NodeExecutionStatus::Pending,
            NodeExecutionStatus::Pending,
        ]
    );
}

#[tokio::test]
async fn node_failure_skips_dependents_and_fails_the_graph() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(&dir);
    let nodes: &[(&str, &[&str])] = &[("n0", &[]), ("n1", &["n0"]), ("n2", &["n1"])];
    let (graph_id, _root) = start_workflow(&orch, nodes, 300_000).await;

    let n0 = node_at(&orch, graph_id, 0).await;
    orch.engine()
        .process_failed_node(n0.agent_id.unwrap(), "model refused")
        .await
        .unwrap();

    let n0 = node_at(&orch, graph_id, 0).await;
    assert_eq!(n0.execution_status, NodeExecutionStatus::Failed);
    assert_eq!(n0.error_message.as_deref(), Some("model refused"));
    for position in [1, 2] {
        let node = node_at(&orch, graph_id, position).await;
        assert_eq!(node.execution_status, NodeExecutionStatus::Skipped);
        assert!(node.error_message.unwrap().contains("upstream dependency failed"));
    }
    assert_eq!(graph(&orch, graph_id).await.status, GraphStatus::Failed);
}

#[tokio::test]
async fn terminating_a_workflow_skips_nodes_and_terminates_agents() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(&dir);
    let nodes: &[(&str, &[&str])] = &[("a", &[]), ("b", &["a"]), ("c", &["b"])];
    let (graph_id, _root) = start_workflow(&orch, nodes, 300_000).await;

    let a = node_at(&orch, graph_id, 0).await;
    let a_agent = a.agent_id.unwrap();
    orch.engine().terminate_workflow(graph_id).await.unwrap();

    assert_eq!(graph(&orch, graph_id).await.status, GraphStatus::Failed);
    for position in [0, 1, 2] {
        let node = node_at(&orch, graph_id, position).await;
        assert_eq!(node.execution_status, NodeExecutionStatus::Skipped);
    }
    let agent = orch.lifecycle().get(a_agent).await.unwrap();
    assert_eq!(agent.status, AgentStatus::Terminated);
    assert!(orch.budgets().get(a_agent).await.unwrap().reclaimed);
}

#[tokio::test]
async fn validation_rejects_cycles() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(&dir);
    let template = orch
        .workflows()
        .create_template(template_spec(
            "cyclic",
            &[("a", &["b"] as &[&str]), ("b", &["a"])],
        ))
        .await
        .unwrap();

    let err = orch
        .engine()
        .instantiate_template(template.id, "run", "task", 100_000)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::GraphInvalid(_)));
    assert!(err.to_string().contains("CIRCULAR_DEPENDENCY"));

    // Usage is only counted for graphs that validate.
    let template = orch.workflows().get_template(template.id).await.unwrap();
    assert_eq!(template.usage_count, 0);
}

#[tokio::test]
async fn validation_rejects_unknown_dependencies() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(&dir);
    let store = orch.store();

    let now = Utc::now();
    let graph_id = Uuid::new_v4();
    let node = WorkflowNodeRecord {
        id: Uuid::new_v4(),
        workflow_graph_id: graph_id,
        agent_id: None,
        role: "solo".into(),
        task_description: "task".into(),
        budget_allocation: 100,
        dependencies: vec![Uuid::new_v4()],
        execution_status: NodeExecutionStatus::Pending,
        spawn_timestamp: None,
        completion_timestamp: None,
        result: None,
        error_message: None,
        position: 0,
        metadata: None,
        created_at: now,
        updated_at: now,
    };
    let graph = WorkflowGraphRecord {
        id: graph_id,
        name: "hand built".into(),
        description: None,
        template_id: None,
        parent_agent_id: None,
        status: GraphStatus::Active,
        validation_status: ValidationStatus::Pending,
        validation_errors: Vec::new(),
        total_nodes: 1,
        total_edges: 1,
        estimated_budget: None,
        complexity_rating: None,
        created_at: now,
        updated_at: now,
        validated_at: None,
        completed_at: None,
    };
    store.insert_graph(graph, vec![node]).await.unwrap();

    let err = orch.engine().validate(graph_id).await.unwrap_err();
    assert!(err.to_string().contains("INVALID_DEPENDENCY"));
    let graph = store.get_graph(graph_id).await.unwrap();
    assert_eq!(graph.validation_status, ValidationStatus::Invalid);
    assert!(!graph.validation_errors.is_empty());

    // An invalid graph never executes.
    let err = orch.engine().execute_workflow(graph_id, None).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::GraphInvalid(_)));
}

#[tokio::test]
async fn validation_and_completion_replays_are_noops() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(&dir);
    let nodes: &[(&str, &[&str])] = &[("n0", &[]), ("n1", &["n0"])];
    let (graph_id, _root) = start_workflow(&orch, nodes, 300_000).await;

    // Re-validating a validated graph changes nothing.
    let before = graph(&orch, graph_id).await;
    let after = orch.engine().validate(graph_id).await.unwrap();
    assert_eq!(before.validated_at, after.validated_at);

    let n0 = node_at(&orch, graph_id, 0).await;
    orch.engine()
        .process_completed_node(n0.agent_id.unwrap(), Some(json!({"first": true})))
        .await
        .unwrap();
    let n1_agent = node_at(&orch, graph_id, 1).await.agent_id;

    // A duplicate completion neither rewrites the result nor respawns.
    orch.engine()
        .process_completed_node(n0.agent_id.unwrap(), Some(json!({"second": true})))
        .await
        .unwrap();
    let n0 = node_at(&orch, graph_id, 0).await;
    assert_eq!(n0.result, Some(json!({"first": true})));
    assert_eq!(node_at(&orch, graph_id, 1).await.agent_id, n1_agent);
}

#[tokio::test]
async fn spawn_failure_takes_the_fail_fast_path() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(&dir);

    let template = orch
        .workflows()
        .create_template(template_spec("greedy", &[("n0", &[]), ("n1", &["n0"])]))
        .await
        .unwrap();
    let graph = orch
        .engine()
        .instantiate_template(template.id, "run", "task", 100_000)
        .await
        .unwrap();
    // The root agent cannot cover node0's 40k allocation.
    let root = orch
        .lifecycle()
        .spawn(SpawnRequest::new("coordinator", "drive", 10_000))
        .await
        .unwrap();

    let err = orch
        .engine()
        .execute_workflow(graph.id, Some(root.id))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::BudgetExhausted(_)));

    let n0 = node_at(&orch, graph.id, 0).await;
    assert_eq!(n0.execution_status, NodeExecutionStatus::Failed);
    assert_eq!(node_at(&orch, graph.id, 1).await.execution_status, NodeExecutionStatus::Skipped);
    assert_eq!(orch.store().get_graph(graph.id).await.unwrap().status, GraphStatus::Failed);
}

#[tokio::test]
async fn parked_ready_node_is_driven_on_the_next_advance() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(&dir);
    let nodes: &[(&str, &[&str])] = &[("n0", &[]), ("n1", &["n0"])];
    let (graph_id, _root) = start_workflow(&orch, nodes, 300_000).await;

    orch.engine().pause_workflow(graph_id).await.unwrap();
    let n0 = node_at(&orch, graph_id, 0).await;
    orch.engine()
        .process_completed_node(n0.agent_id.unwrap(), Some(json!({"x": 1})))
        .await
        .unwrap();

    // A frontier pass interrupted after the ready mark leaves the node
    // parked in `ready`, visible to progress queries.
    let n1 = node_at(&orch, graph_id, 1).await;
    orch.store()
        .advance_node(
            n1.id,
            &[NodeExecutionStatus::Pending],
            NodeExecutionStatus::Ready,
            NodePatch::default(),
        )
        .await
        .unwrap();
    let progress = orch.engine().progress(graph_id).await.unwrap();
    assert_eq!(progress.ready, 1);
    assert_eq!(progress.completed, 1);

    // The next advance picks the parked node up and spawns it.
    orch.engine().resume_workflow(graph_id).await.unwrap();
    let n1 = node_at(&orch, graph_id, 1).await;
    assert_eq!(n1.execution_status, NodeExecutionStatus::Executing);
    assert!(n1.agent_id.is_some());
}

#[tokio::test]
async fn paused_graph_defers_the_frontier_until_resume() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(&dir);
    let nodes: &[(&str, &[&str])] = &[("n0", &[]), ("n1", &["n0"])];
    let (graph_id, _root) = start_workflow(&orch, nodes, 300_000).await;

    orch.engine().pause_workflow(graph_id).await.unwrap();
    let n0 = node_at(&orch, graph_id, 0).await;
    orch.engine()
        .process_completed_node(n0.agent_id.unwrap(), Some(json!({"x": 1})))
        .await
        .unwrap();

    // Completion is recorded, but nothing new spawns while paused.
    assert_eq!(node_at(&orch, graph_id, 0).await.execution_status, NodeExecutionStatus::Completed);
    assert_eq!(node_at(&orch, graph_id, 1).await.execution_status, NodeExecutionStatus::Pending);

    orch.engine().resume_workflow(graph_id).await.unwrap();
    let n1 = node_at(&orch, graph_id, 1).await;
    assert_eq!(n1.execution_status, NodeExecutionStatus::Executing);

    orch.engine()
        .process_completed_node(n1.agent_id.unwrap(), None)
        .await
        .unwrap();
    assert_eq!(graph(&orch, graph_id).await.status, GraphStatus::Completed);

    // Template statistics reflect the completed run.
    let graph_record = graph(&orch, graph_id).await;
    let template = orch
        .workflows()
        .get_template(graph_record.template_id.unwrap())
        .await
        .unwrap();
    assert_eq!(template.usage_count, 1);
    assert_eq!(template.success_rate, Some(1.0));
}
