//! Workflow Engine
//!
//! DAG validation and event-driven execution. Only the ready frontier is
//! ever spawned: `execute_workflow` starts the nodes without dependencies,
//! and every completion advances exactly the nodes it newly unblocked,
//! never the whole graph at once. Node failure skips the transitive
//! dependents and fails the graph (fail-fast).
//!
//! All node advances go through the store's optimistic status guard, so a
//! duplicate invocation from the poller or a racing worker is a no-op.

use crate::lifecycle::{AgentLifecycleService, SpawnRequest};
use crate::model::*;
use crate::store::{NodePatch, Store};
use crate::workflow::WorkflowService;
use crate::{OrchestratorError, Result};
use chrono::Utc;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Heading under which dependency results are appended to a node's task.
const DEPENDENCY_OUTPUTS_HEADING: &str = "## Dependency outputs";

/// Node counts by execution status.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowProgress {
    pub pending: usize,
    pub ready: usize,
    pub spawning: usize,
    pub executing: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total: usize,
}

pub struct WorkflowEngine {
    store: Arc<Store>,
    lifecycle: Arc<AgentLifecycleService>,
    templates: Arc<WorkflowService>,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<Store>,
        lifecycle: Arc<AgentLifecycleService>,
        templates: Arc<WorkflowService>,
    ) -> Self {
        Self {
            store,
            lifecycle,
            templates,
        }
    }

    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------

    /// Validate a graph: every dependency must reference a node inside the
    /// graph, the dependency relation must be acyclic, and (when an
    /// estimated budget is recorded) node allocations must fit inside it.
    /// The outcome is persisted; re-validating a validated graph is a no-op.
    pub async fn validate(&self, graph_id: Uuid) -> Result<WorkflowGraphRecord> {
        let graph = self.require_graph(graph_id).await?;
        if graph.validation_status == ValidationStatus::Validated {
            return Ok(graph);
        }
        let nodes = self.store.graph_nodes(graph_id).await;

        let mut errors = Vec::new();
        let ids: HashSet<Uuid> = nodes.iter().map(|n| n.id).collect();
        for node in &nodes {
            for dep in &node.dependencies {
                if !ids.contains(dep) {
                    errors.push(format!(
                        "INVALID_DEPENDENCY: node {} references {dep} which is not in the graph",
                        node.id
                    ));
                }
            }
        }

        let (dag, _) = dependency_graph(&nodes);
        if toposort(&dag, None).is_err() {
            errors.push("CIRCULAR_DEPENDENCY: dependency relation contains a cycle".to_string());
        }

        if let Some(estimated) = graph.estimated_budget {
            let allocated: u64 = nodes.iter().map(|n| n.budget_allocation).sum();
            if allocated > estimated {
                errors.push(format!(
                    "BUDGET_EXCEEDED: node allocations total {allocated}, estimated budget {estimated}"
                ));
            }
        }

        if errors.is_empty() {
            let graph = self
                .store
                .set_graph_validation(graph_id, ValidationStatus::Validated, Vec::new())
                .await?;
            info!(graph_id = %graph_id, nodes = nodes.len(), "workflow graph validated");
            Ok(graph)
        } else {
            self.store
                .set_graph_validation(graph_id, ValidationStatus::Invalid, errors.clone())
                .await?;
            warn!(graph_id = %graph_id, ?errors, "workflow graph failed validation");
            Err(OrchestratorError::GraphInvalid(errors.join("; ")))
        }
    }

    /// Instantiate a template and validate the resulting graph. Usage is
    /// counted only for graphs that validate.
    pub async fn instantiate_template(
        &self,
        template_id: Uuid,
        graph_name: impl Into<String>,
        task: &str,
        budget: u64,
    ) -> Result<WorkflowGraphRecord> {
        let graph = self
            .templates
            .instantiate(template_id, graph_name, task, budget)
            .await?;
        let graph = self.validate(graph.id).await?;
        self.store.record_template_usage(template_id).await?;
        Ok(graph)
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Start a validated graph: spawn agents for the initial frontier (the
    /// nodes without dependencies) under `parent_agent_id`. Nothing beyond
    /// the frontier is spawned.
    pub async fn execute_workflow(
        &self,
        graph_id: Uuid,
        parent_agent_id: Option<Uuid>,
    ) -> Result<Vec<WorkflowNodeRecord>> {
        let graph = self.require_graph(graph_id).await?;
        if graph.validation_status != ValidationStatus::Validated {
            return Err(OrchestratorError::GraphInvalid(format!(
                "graph {graph_id} is not validated"
            )));
        }
        if graph.status != GraphStatus::Active {
            return Err(OrchestratorError::InvalidTransition(format!(
                "graph {graph_id} is {:?}",
                graph.status
            )));
        }
        self.store.bind_graph_parent(graph_id, parent_agent_id).await?;
        let spawned = self.advance_frontier(graph_id).await?;
        info!(
            graph_id = %graph_id,
            spawned = spawned.len(),
            "workflow execution started"
        );
        Ok(spawned)
    }

    /// Record a node's completion and spawn whatever it newly unblocked.
    /// A no-op when the agent is not bound to an executing node.
    pub async fn process_completed_node(
        &self,
        agent_id: Uuid,
        result: Option<serde_json::Value>,
    ) -> Result<()> {
        let Some(node) = self.store.node_by_agent(agent_id).await else {
            return Ok(());
        };
        let advanced = self
            .store
            .advance_node(
                node.id,
                &[NodeExecutionStatus::Executing],
                NodeExecutionStatus::Completed,
                NodePatch {
                    completion_timestamp: Some(Utc::now()),
                    result: result.or(Some(serde_json::Value::Null)),
                    ..NodePatch::default()
                },
            )
            .await?;
        if advanced.is_none() {
            return Ok(());
        }
        info!(graph_id = %node.workflow_graph_id, node_id = %node.id, "workflow node completed");

        let graph = self.require_graph(node.workflow_graph_id).await?;
        if graph.status == GraphStatus::Active {
            self.advance_frontier(graph.id).await?;
            self.finalize_if_terminal(graph.id).await?;
        }
        Ok(())
    }

    /// Record a node's failure, skip its transitive dependents and fail the
    /// graph. A no-op when the agent is not bound to an executing node.
    pub async fn process_failed_node(&self, agent_id: Uuid, error: &str) -> Result<()> {
        let Some(node) = self.store.node_by_agent(agent_id).await else {
            return Ok(());
        };
        let advanced = self
            .store
            .advance_node(
                node.id,
                &[NodeExecutionStatus::Executing],
                NodeExecutionStatus::Failed,
                NodePatch {
                    completion_timestamp: Some(Utc::now()),
                    error_message: Some(error.to_string()),
                    ..NodePatch::default()
                },
            )
            .await?;
        if advanced.is_none() {
            return Ok(());
        }
        warn!(
            graph_id = %node.workflow_graph_id,
            node_id = %node.id,
            error,
            "workflow node failed"
        );
        self.fail_graph(node.workflow_graph_id, node.id, &node.role).await
    }

    /// Terminate a running graph: the graph fails, every still-live node is
    /// skipped, and agents of in-flight nodes are terminated with their
    /// subtrees.
    pub async fn terminate_workflow(&self, graph_id: Uuid) -> Result<()> {
        let graph = self.require_graph(graph_id).await?;
        let transitioned = self.store.set_graph_status(graph_id, GraphStatus::Failed).await?;
        if transitioned.is_none() {
            return Ok(());
        }
        self.record_outcome(&graph, false).await;

        for node in self.store.graph_nodes(graph_id).await {
            if node.execution_status.is_terminal() {
                continue;
            }
            if node.execution_status == NodeExecutionStatus::Executing {
                if let Some(agent_id) = node.agent_id {
                    if let Err(e) = self.lifecycle.terminate_tree(agent_id, "workflow terminated").await
                    {
                        warn!(agent_id = %agent_id, error = %e, "terminating workflow node agent");
                    }
                }
            }
            self.store
                .advance_node(
                    node.id,
                    &[
                        NodeExecutionStatus::Pending,
                        NodeExecutionStatus::Ready,
                        NodeExecutionStatus::Spawning,
                        NodeExecutionStatus::Executing,
                    ],
                    NodeExecutionStatus::Skipped,
                    NodePatch {
                        completion_timestamp: Some(Utc::now()),
                        error_message: Some("workflow terminated".to_string()),
                        ..NodePatch::default()
                    },
                )
                .await?;
        }
        info!(graph_id = %graph_id, "workflow terminated");
        Ok(())
    }

    /// Pause an active graph: running nodes finish, nothing new spawns.
    pub async fn pause_workflow(&self, graph_id: Uuid) -> Result<()> {
        match self.store.set_graph_status(graph_id, GraphStatus::Paused).await? {
            Some(_) => Ok(()),
            None => Err(OrchestratorError::InvalidTransition(format!(
                "graph {graph_id} is terminal"
            ))),
        }
    }

    /// Resume a paused graph and spawn whatever became ready while paused.
    pub async fn resume_workflow(&self, graph_id: Uuid) -> Result<()> {
        match self.store.set_graph_status(graph_id, GraphStatus::Active).await? {
            Some(_) => {
                self.advance_frontier(graph_id).await?;
                self.finalize_if_terminal(graph_id).await?;
                Ok(())
            }
            None => Err(OrchestratorError::InvalidTransition(format!(
                "graph {graph_id} is terminal"
            ))),
        }
    }

    /// Node counts by execution status.
    pub async fn progress(&self, graph_id: Uuid) -> Result<WorkflowProgress> {
        self.require_graph(graph_id).await?;
        let mut progress = WorkflowProgress::default();
        for node in self.store.graph_nodes(graph_id).await {
            progress.total += 1;
            match node.execution_status {
                NodeExecutionStatus::Pending => progress.pending += 1,
                NodeExecutionStatus::Ready => progress.ready += 1,
                NodeExecutionStatus::Spawning => progress.spawning += 1,
                NodeExecutionStatus::Executing => progress.executing += 1,
                NodeExecutionStatus::Completed => progress.completed += 1,
                NodeExecutionStatus::Failed => progress.failed += 1,
                NodeExecutionStatus::Skipped => progress.skipped += 1,
            }
        }
        Ok(progress)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn require_graph(&self, graph_id: Uuid) -> Result<WorkflowGraphRecord> {
        self.store
            .get_graph(graph_id)
            .await
            .ok_or_else(|| OrchestratorError::NotFound(format!("graph {graph_id}")))
    }

    /// Mark every pending node whose dependencies are all completed as
    /// `ready`, then spawn it. The enhanced task carries the dependency
    /// results under a dedicated heading so downstream agents see upstream
    /// output.
    async fn advance_frontier(&self, graph_id: Uuid) -> Result<Vec<WorkflowNodeRecord>> {
        let graph = self.require_graph(graph_id).await?;
        let nodes = self.store.graph_nodes(graph_id).await;
        let by_id: HashMap<Uuid, &WorkflowNodeRecord> = nodes.iter().map(|n| (n.id, n)).collect();

        // Ready nodes are included so a node parked between the ready mark
        // and its spawn (crash, racing invocation) still gets driven.
        let frontier: Vec<&WorkflowNodeRecord> = nodes
            .iter()
            .filter(|n| {
                matches!(
                    n.execution_status,
                    NodeExecutionStatus::Pending | NodeExecutionStatus::Ready
                )
            })
            .filter(|n| {
                n.dependencies.iter().all(|dep| {
                    by_id
                        .get(dep)
                        .map(|d| d.execution_status == NodeExecutionStatus::Completed)
                        .unwrap_or(false)
                })
            })
            .collect();

        let mut spawned = Vec::new();
        for node in frontier {
            if node.execution_status == NodeExecutionStatus::Pending {
                let marked = self
                    .store
                    .advance_node(
                        node.id,
                        &[NodeExecutionStatus::Pending],
                        NodeExecutionStatus::Ready,
                        NodePatch::default(),
                    )
                    .await?;
                if marked.is_none() {
                    continue;
                }
            }
            let task = if node.dependencies.is_empty() {
                node.task_description.clone()
            } else {
                enhanced_task(node, &by_id)
            };
            match self.spawn_node(&graph, node.id, task).await? {
                Some(record) => spawned.push(record),
                None => continue,
            }
        }
        Ok(spawned)
    }

    /// Drive one ready node through `spawning` into `executing`. Returns
    /// `None` when another invocation already claimed the node.
    async fn spawn_node(
        &self,
        graph: &WorkflowGraphRecord,
        node_id: Uuid,
        task: String,
    ) -> Result<Option<WorkflowNodeRecord>> {
        let claimed = self
            .store
            .advance_node(
                node_id,
                &[NodeExecutionStatus::Ready],
                NodeExecutionStatus::Spawning,
                NodePatch::default(),
            )
            .await?;
        let Some(node) = claimed else {
            return Ok(None);
        };

        let mut request = SpawnRequest::new(node.role.clone(), task, node.budget_allocation);
        if let Some(parent) = graph.parent_agent_id {
            request = request.with_parent(parent);
        }
        match self.lifecycle.spawn(request).await {
            Ok(agent) => {
                let record = self
                    .store
                    .advance_node(
                        node_id,
                        &[NodeExecutionStatus::Spawning],
                        NodeExecutionStatus::Executing,
                        NodePatch {
                            agent_id: Some(agent.id),
                            spawn_timestamp: Some(Utc::now()),
                            ..NodePatch::default()
                        },
                    )
                    .await?;
                info!(
                    graph_id = %graph.id,
                    node_id = %node_id,
                    agent_id = %agent.id,
                    "workflow node spawned"
                );
                Ok(record)
            }
            Err(e) => {
                self.store
                    .advance_node(
                        node_id,
                        &[NodeExecutionStatus::Spawning],
                        NodeExecutionStatus::Failed,
                        NodePatch {
                            completion_timestamp: Some(Utc::now()),
                            error_message: Some(e.to_string()),
                            ..NodePatch::default()
                        },
                    )
                    .await?;
                warn!(graph_id = %graph.id, node_id = %node_id, error = %e, "workflow node spawn failed");
                self.fail_graph(graph.id, node_id, &node.role).await?;
                Err(e)
            }
        }
    }

    /// Fail-fast cascade: skip every transitive dependent that has not
    /// started, then fail the graph.
    async fn fail_graph(&self, graph_id: Uuid, failed_node: Uuid, failed_role: &str) -> Result<()> {
        let nodes = self.store.graph_nodes(graph_id).await;
        for dependent in dependents_closure(&nodes, failed_node) {
            self.store
                .advance_node(
                    dependent,
                    &[NodeExecutionStatus::Pending, NodeExecutionStatus::Ready],
                    NodeExecutionStatus::Skipped,
                    NodePatch {
                        completion_timestamp: Some(Utc::now()),
                        error_message: Some(format!(
                            "upstream dependency failed: {failed_role}"
                        )),
                        ..NodePatch::default()
                    },
                )
                .await?;
        }
        let graph = self.require_graph(graph_id).await?;
        if let Some(updated) = self.store.set_graph_status(graph_id, GraphStatus::Failed).await? {
            self.record_outcome(&graph, false).await;
            info!(graph_id = %updated.id, "workflow graph failed");
        }
        Ok(())
    }

    /// When every node is terminal, close the graph: failed or skipped nodes
    /// fail it, an all-completed graph completes.
    async fn finalize_if_terminal(&self, graph_id: Uuid) -> Result<()> {
        let nodes = self.store.graph_nodes(graph_id).await;
        if !nodes.iter().all(|n| n.execution_status.is_terminal()) {
            return Ok(());
        }
        let success = nodes
            .iter()
            .all(|n| n.execution_status == NodeExecutionStatus::Completed);
        let target = if success {
            GraphStatus::Completed
        } else {
            GraphStatus::Failed
        };
        let graph = self.require_graph(graph_id).await?;
        if let Some(updated) = self.store.set_graph_status(graph_id, target).await? {
            self.record_outcome(&graph, success).await;
            info!(graph_id = %updated.id, status = ?updated.status, "workflow graph finished");
        }
        Ok(())
    }

    async fn record_outcome(&self, graph: &WorkflowGraphRecord, success: bool) {
        if let Some(template_id) = graph.template_id {
            if let Err(e) = self.store.record_template_outcome(template_id, success).await {
                warn!(template_id = %template_id, error = %e, "recording template outcome");
            }
        }
    }
}

/// Build the dependency DAG (edge dep → dependent) for a node set.
fn dependency_graph(
    nodes: &[WorkflowNodeRecord],
) -> (DiGraph<Uuid, ()>, HashMap<Uuid, NodeIndex>) {
    let mut dag = DiGraph::new();
    let mut indices = HashMap::new();
    for node in nodes {
        indices.insert(node.id, dag.add_node(node.id));
    }
    for node in nodes {
        for dep in &node.dependencies {
            if let (Some(&from), Some(&to)) = (indices.get(dep), indices.get(&node.id)) {
                dag.add_edge(from, to, ());
            }
        }
    }
    (dag, indices)
}

/// All transitive dependents of a node, excluding the node itself.
fn dependents_closure(nodes: &[WorkflowNodeRecord], from: Uuid) -> Vec<Uuid> {
    let (dag, indices) = dependency_graph(nodes);
    let Some(&start) = indices.get(&from) else {
        return Vec::new();
    };
    let mut dfs = Dfs::new(&dag, start);
    let mut out = Vec::new();
    while let Some(ix) = dfs.next(&dag) {
        if ix != start {
            out.push(dag[ix]);
        }
    }
    out
}

/// Append dependency results to a node's task under a dedicated heading.
fn enhanced_task(
    node: &WorkflowNodeRecord,
    by_id: &HashMap<Uuid, &WorkflowNodeRecord>,
) -> String {
    let mut task = node.task_description.clone();
    task.push_str("\n\n");
    task.push_str(DEPENDENCY_OUTPUTS_HEADING);
    task.push('\n');
    for dep_id in &node.dependencies {
        let Some(dep) = by_id.get(dep_id) else {
            continue;
        };
        let rendered = dep
            .result
            .as_ref()
            .map(|r| serde_json::to_string(r).unwrap_or_else(|_| "null".to_string()))
            .unwrap_or_else(|| "null".to_string());
        task.push_str(&format!("\n### {}\n{}\n", dep.role, rendered));
    }
    task
}
