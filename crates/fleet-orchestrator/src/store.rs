//! Authoritative Orchestration Store
//!
//! Single source of truth for agents, budgets, hierarchy edges, messages and
//! workflow state. Every public operation acquires the state lock exactly
//! once and validates before it mutates, so each call is one atomic,
//! serialized transaction. No lock is ever held across an external call.
//!
//! Secondary index maps (`children`, `inbox`, `graph_nodes`) are maintained
//! in the same transaction as the rows they index.

use crate::model::*;
use crate::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Spawn parameters as validated and applied by the store.
#[derive(Debug, Clone)]
pub struct NewAgent {
    /// Caller-supplied id, e.g. for work-tracker replays. `None` generates one.
    pub id: Option<Uuid>,
    pub role: String,
    pub task: String,
    pub budget: u64,
    pub parent_id: Option<Uuid>,
    pub model_hint: Option<String>,
}

/// Outcome fields recorded together with a status transition.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPatch {
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub tokens_used: Option<u64>,
    pub execution_duration_ms: Option<u64>,
}

/// Mutable node fields applied together with an execution-status advance.
#[derive(Debug, Clone, Default)]
pub struct NodePatch {
    pub agent_id: Option<Uuid>,
    pub spawn_timestamp: Option<DateTime<Utc>>,
    pub completion_timestamp: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    agents: HashMap<Uuid, AgentRecord>,
    budgets: HashMap<Uuid, BudgetRecord>,
    /// Hierarchy edges, parent -> children. Kept in sync with `parent_id`.
    children: HashMap<Uuid, Vec<Uuid>>,
    messages: HashMap<Uuid, MessageRecord>,
    /// Message index, recipient -> message ids.
    inbox: HashMap<Uuid, Vec<Uuid>>,
    templates: HashMap<Uuid, WorkflowTemplate>,
    graphs: HashMap<Uuid, WorkflowGraphRecord>,
    nodes: HashMap<Uuid, WorkflowNodeRecord>,
    /// Node index, graph -> node ids in position order.
    graph_nodes: HashMap<Uuid, Vec<Uuid>>,
    /// Monotonic FIFO tie-breaker for messages.
    message_seq: u64,
}

/// Aggregate counters across the store, for logs and operational views.
/// Token usage counts root budgets only, since child consumption rolls up
/// at reclamation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub agents_pending: usize,
    pub agents_executing: usize,
    pub agents_completed: usize,
    pub agents_failed: usize,
    pub agents_terminated: usize,
    pub tokens_used: u64,
    pub messages_pending: usize,
    pub messages_delivered: usize,
    pub messages_processed: usize,
    pub workflows_running: usize,
    pub workflows_completed: usize,
    pub workflows_failed: usize,
    pub templates: usize,
}

/// The orchestration store. Cheap to share behind an `Arc`.
pub struct Store {
    state: RwLock<StoreState>,
    snapshot_path: Option<PathBuf>,
}

impl Store {
    /// Create an empty in-process store.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            snapshot_path: None,
        }
    }

    /// Open a store backed by a JSON snapshot file, loading it if present.
    pub async fn open(snapshot_path: impl AsRef<Path>) -> Result<Self> {
        let path = snapshot_path.as_ref().to_path_buf();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                OrchestratorError::StoreConflict(format!(
                    "snapshot at {} is unreadable: {e}",
                    path.display()
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreState::default(),
            Err(e) => {
                return Err(OrchestratorError::StoreConflict(format!(
                    "snapshot at {} is unreadable: {e}",
                    path.display()
                )))
            }
        };
        Ok(Self {
            state: RwLock::new(state),
            snapshot_path: Some(path),
        })
    }

    /// Persist the current state to the snapshot path, if one is configured.
    /// Writes to a sibling temp file and renames over the target.
    pub async fn save_snapshot(&self) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let bytes = {
            let state = self.state.read().await;
            serde_json::to_vec(&*state).map_err(|e| {
                OrchestratorError::StoreConflict(format!("snapshot serialization failed: {e}"))
            })?
        };
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await.map_err(|e| {
            OrchestratorError::StoreConflict(format!("snapshot write failed: {e}"))
        })?;
        tokio::fs::rename(&tmp, path).await.map_err(|e| {
            OrchestratorError::StoreConflict(format!("snapshot rename failed: {e}"))
        })?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Agents & hierarchy
    // ------------------------------------------------------------------

    /// Read-only spawn validation: parent liveness, budget headroom, cycle
    /// and depth checks. Run before the workspace is provisioned; the same
    /// checks re-run inside [`Store::spawn_agent`].
    pub async fn precheck_spawn(&self, req: &NewAgent, max_depth: u32) -> Result<()> {
        let state = self.state.read().await;
        state.validate_spawn(req, max_depth)?;
        Ok(())
    }

    /// Insert an agent, its budget row and its hierarchy edge, reserving the
    /// child's allocation on the parent. All-or-nothing: any guard failure
    /// leaves the store untouched.
    pub async fn spawn_agent(
        &self,
        req: &NewAgent,
        workspace_path: Option<String>,
        max_depth: u32,
    ) -> Result<AgentRecord> {
        let mut state = self.state.write().await;
        let depth = state.validate_spawn(req, max_depth)?;

        let now = Utc::now();
        let id = req.id.unwrap_or_else(Uuid::new_v4);
        let agent = AgentRecord {
            id,
            role: req.role.clone(),
            task: req.task.clone(),
            status: AgentStatus::Pending,
            control_state: ControlState::Running,
            depth_level: depth,
            parent_id: req.parent_id,
            tokens_used: 0,
            execution_duration_ms: 0,
            result: None,
            error: None,
            workspace_path,
            model_hint: req.model_hint.clone(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        let budget = BudgetRecord {
            agent_id: id,
            allocated: req.budget,
            used: 0,
            reserved: 0,
            reclaimed: false,
            created_at: now,
            updated_at: now,
        };

        if let Some(parent_id) = req.parent_id {
            let parent_budget = state
                .budgets
                .get_mut(&parent_id)
                .ok_or_else(|| OrchestratorError::NotFound(format!("budget {parent_id}")))?;
            parent_budget.reserved += req.budget;
            parent_budget.updated_at = now;
            state.children.entry(parent_id).or_default().push(id);
        }
        state.agents.insert(id, agent.clone());
        state.budgets.insert(id, budget);
        Ok(agent)
    }

    pub async fn get_agent(&self, id: Uuid) -> Option<AgentRecord> {
        self.state.read().await.agents.get(&id).cloned()
    }

    pub async fn list_agents(&self) -> Vec<AgentRecord> {
        self.state.read().await.agents.values().cloned().collect()
    }

    /// Apply a status transition under the absorbing-terminal guards and, on
    /// a terminal transition, run budget reclamation in the same transaction.
    pub async fn transition_agent(
        &self,
        id: Uuid,
        to: AgentStatus,
        patch: Option<&ExecutionPatch>,
    ) -> Result<AgentRecord> {
        let mut state = self.state.write().await;
        let agent = state
            .agents
            .get(&id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("agent {id}")))?;
        if agent.status.is_terminal() {
            return Err(OrchestratorError::InvalidTransition(format!(
                "agent {id} is already {:?}",
                agent.status
            )));
        }

        let now = Utc::now();
        let agent = state.agents.get_mut(&id).expect("checked above");
        agent.status = to;
        agent.updated_at = now;
        if let Some(patch) = patch {
            if let Some(result) = &patch.result {
                agent.result = Some(result.clone());
            }
            if let Some(error) = &patch.error {
                agent.error = Some(error.clone());
            }
            if let Some(tokens) = patch.tokens_used {
                agent.tokens_used = tokens;
            }
            if let Some(duration) = patch.execution_duration_ms {
                agent.execution_duration_ms = duration;
            }
        }
        if to.is_terminal() {
            agent.completed_at = Some(now);
            if to == AgentStatus::Terminated {
                agent.control_state = ControlState::Terminated;
            }
            state.reclaim_locked(id, now);
        }
        Ok(state.agents[&id].clone())
    }

    /// Claim up to `limit` pending agents and flip them to `executing` in one
    /// transaction, the skip-locked claim read. Only agents whose control
    /// state is `running` are eligible; ordering is FIFO by `created_at`.
    pub async fn claim_pending_agents(&self, limit: usize) -> Vec<AgentRecord> {
        let mut state = self.state.write().await;
        let mut eligible: Vec<(DateTime<Utc>, Uuid)> = state
            .agents
            .values()
            .filter(|a| a.status == AgentStatus::Pending && a.control_state == ControlState::Running)
            .map(|a| (a.created_at, a.id))
            .collect();
        eligible.sort();
        let now = Utc::now();
        eligible
            .into_iter()
            .take(limit)
            .map(|(_, id)| {
                let agent = state.agents.get_mut(&id).expect("selected above");
                agent.status = AgentStatus::Executing;
                agent.updated_at = now;
                agent.clone()
            })
            .collect()
    }

    /// Terminate every listed agent that is still non-terminal, in a single
    /// transaction. Reclamation runs per agent, bottom-up is not required:
    /// each level reclaims independently. Returns the agents that actually
    /// transitioned.
    pub async fn terminate_agents(&self, ids: &[Uuid], reason: &str) -> Vec<AgentRecord> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let mut transitioned = Vec::new();
        for id in ids {
            let Some(agent) = state.agents.get_mut(id) else {
                continue;
            };
            if agent.status.is_terminal() {
                continue;
            }
            agent.status = AgentStatus::Terminated;
            agent.control_state = ControlState::Terminated;
            agent.error = Some(reason.to_string());
            agent.updated_at = now;
            agent.completed_at = Some(now);
            let agent = agent.clone();
            state.reclaim_locked(*id, now);
            transitioned.push(agent);
        }
        transitioned
    }

    /// Flip an agent's control state. `terminated` is absorbing.
    pub async fn set_control_state(&self, id: Uuid, to: ControlState) -> Result<AgentRecord> {
        let mut state = self.state.write().await;
        let agent = state
            .agents
            .get_mut(&id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("agent {id}")))?;
        if agent.control_state == ControlState::Terminated {
            return Err(OrchestratorError::InvalidTransition(format!(
                "agent {id} control state is terminated"
            )));
        }
        agent.control_state = to;
        agent.updated_at = Utc::now();
        Ok(agent.clone())
    }

    /// Ancestor chain from the immediate parent up to the root.
    pub async fn ancestors(&self, id: Uuid) -> Vec<AgentRecord> {
        let state = self.state.read().await;
        state.ancestors_locked(id)
    }

    /// All transitive descendants, breadth-first from the given agent.
    pub async fn descendants(&self, id: Uuid) -> Vec<AgentRecord> {
        let state = self.state.read().await;
        let mut out = Vec::new();
        let mut queue: VecDeque<Uuid> = state
            .children
            .get(&id)
            .map(|c| c.iter().copied().collect())
            .unwrap_or_default();
        while let Some(next) = queue.pop_front() {
            if let Some(agent) = state.agents.get(&next) {
                out.push(agent.clone());
            }
            if let Some(grandchildren) = state.children.get(&next) {
                queue.extend(grandchildren.iter().copied());
            }
        }
        out
    }

    /// True when `candidate` appears on `of`'s ancestor chain.
    pub async fn is_ancestor(&self, candidate: Uuid, of: Uuid) -> bool {
        let state = self.state.read().await;
        state.ancestors_locked(of).iter().any(|a| a.id == candidate)
    }

    // ------------------------------------------------------------------
    // Budgets
    // ------------------------------------------------------------------

    pub async fn get_budget(&self, agent_id: Uuid) -> Option<BudgetRecord> {
        self.state.read().await.budgets.get(&agent_id).cloned()
    }

    /// Strict consumption: rejects when the guard
    /// `used + reserved + tokens <= allocated` would be violated.
    pub async fn consume_budget(&self, agent_id: Uuid, tokens: u64) -> Result<BudgetRecord> {
        let mut state = self.state.write().await;
        let budget = state
            .budgets
            .get_mut(&agent_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("budget {agent_id}")))?;
        if budget.used + budget.reserved + tokens > budget.allocated {
            return Err(OrchestratorError::BudgetExhausted(format!(
                "agent {agent_id}: {tokens} tokens requested, {} available",
                budget.available()
            )));
        }
        budget.used += tokens;
        budget.updated_at = Utc::now();
        Ok(budget.clone())
    }

    /// Saturating charge for executor overruns: charges up to the available
    /// headroom and returns the amount actually charged. Never violates the
    /// budget invariant.
    pub async fn charge_budget(&self, agent_id: Uuid, tokens: u64) -> Result<u64> {
        let mut state = self.state.write().await;
        let budget = state
            .budgets
            .get_mut(&agent_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("budget {agent_id}")))?;
        let charged = tokens.min(budget.available());
        budget.used += charged;
        budget.updated_at = Utc::now();
        Ok(charged)
    }

    /// Explicit reclamation entry point; idempotent by the `reclaimed` flag.
    /// Returns true when this call performed the reclamation.
    pub async fn reclaim_budget(&self, agent_id: Uuid) -> Result<bool> {
        let mut state = self.state.write().await;
        if !state.budgets.contains_key(&agent_id) {
            return Err(OrchestratorError::NotFound(format!("budget {agent_id}")));
        }
        Ok(state.reclaim_locked(agent_id, Utc::now()))
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Insert a pending message. Both endpoints must exist.
    pub async fn enqueue_message(
        &self,
        sender_id: Uuid,
        recipient_id: Uuid,
        payload: serde_json::Value,
        priority: i32,
    ) -> Result<MessageRecord> {
        let mut state = self.state.write().await;
        if !state.agents.contains_key(&sender_id) {
            return Err(OrchestratorError::NotFound(format!("agent {sender_id}")));
        }
        if !state.agents.contains_key(&recipient_id) {
            return Err(OrchestratorError::NotFound(format!("agent {recipient_id}")));
        }
        Ok(state.insert_message_locked(sender_id, recipient_id, payload, priority))
    }

    /// Fan a payload out to every live (non-terminal) agent except the
    /// sender, in a single transaction.
    pub async fn enqueue_broadcast(
        &self,
        sender_id: Uuid,
        payload: serde_json::Value,
        priority: i32,
    ) -> Result<Vec<MessageRecord>> {
        let mut state = self.state.write().await;
        if !state.agents.contains_key(&sender_id) {
            return Err(OrchestratorError::NotFound(format!("agent {sender_id}")));
        }
        let recipients: Vec<Uuid> = state
            .agents
            .values()
            .filter(|a| a.id != sender_id && !a.status.is_terminal())
            .map(|a| a.id)
            .collect();
        Ok(recipients
            .into_iter()
            .map(|r| state.insert_message_locked(sender_id, r, payload.clone(), priority))
            .collect())
    }

    /// Claim up to `limit` pending messages for a recipient, flipping them to
    /// `delivered` in the same transaction. Ordering: priority descending,
    /// then FIFO by creation time and sequence.
    pub async fn claim_messages(&self, recipient_id: Uuid, limit: usize) -> Vec<MessageRecord> {
        let mut state = self.state.write().await;
        let Some(ids) = state.inbox.get(&recipient_id) else {
            return Vec::new();
        };
        let mut pending: Vec<(i32, DateTime<Utc>, u64, Uuid)> = ids
            .iter()
            .filter_map(|id| state.messages.get(id))
            .filter(|m| m.status == MessageStatus::Pending)
            .map(|m| (m.priority, m.created_at, m.seq, m.id))
            .collect();
        pending.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
        pending
            .into_iter()
            .take(limit)
            .map(|(_, _, _, id)| {
                let message = state.messages.get_mut(&id).expect("selected above");
                message.status = MessageStatus::Delivered;
                message.clone()
            })
            .collect()
    }

    /// Delivered-but-unprocessed messages for a recipient, oldest first.
    /// The at-least-once redelivery read used after a crash or restart.
    pub async fn delivered_messages(&self, recipient_id: Uuid) -> Vec<MessageRecord> {
        let state = self.state.read().await;
        let mut out: Vec<MessageRecord> = state
            .inbox
            .get(&recipient_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.messages.get(id))
            .filter(|m| m.status == MessageStatus::Delivered)
            .cloned()
            .collect();
        out.sort_by_key(|m| (std::cmp::Reverse(m.priority), m.created_at, m.seq));
        out
    }

    pub async fn mark_message_processed(&self, id: Uuid) -> Result<MessageRecord> {
        let mut state = self.state.write().await;
        let message = state
            .messages
            .get_mut(&id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("message {id}")))?;
        message.status = MessageStatus::Processed;
        message.processed_at = Some(Utc::now());
        Ok(message.clone())
    }

    /// Delete processed messages older than the cutoff. Returns the number
    /// of rows removed.
    pub async fn sweep_processed(&self, cutoff: DateTime<Utc>) -> usize {
        let mut state = self.state.write().await;
        let stale: Vec<Uuid> = state
            .messages
            .values()
            .filter(|m| {
                m.status == MessageStatus::Processed
                    && m.processed_at.map(|t| t < cutoff).unwrap_or(false)
            })
            .map(|m| m.id)
            .collect();
        for id in &stale {
            if let Some(message) = state.messages.remove(id) {
                if let Some(inbox) = state.inbox.get_mut(&message.recipient_id) {
                    inbox.retain(|m| m != id);
                }
            }
        }
        stale.len()
    }

    // ------------------------------------------------------------------
    // Workflow templates
    // ------------------------------------------------------------------

    /// Insert a template; names are unique.
    pub async fn insert_template(&self, template: WorkflowTemplate) -> Result<WorkflowTemplate> {
        let mut state = self.state.write().await;
        if state.templates.values().any(|t| t.name == template.name) {
            return Err(OrchestratorError::GraphInvalid(format!(
                "template name {:?} already exists",
                template.name
            )));
        }
        state.templates.insert(template.id, template.clone());
        Ok(template)
    }

    pub async fn get_template(&self, id: Uuid) -> Option<WorkflowTemplate> {
        self.state.read().await.templates.get(&id).cloned()
    }

    pub async fn template_by_name(&self, name: &str) -> Option<WorkflowTemplate> {
        self.state
            .read()
            .await
            .templates
            .values()
            .find(|t| t.name == name)
            .cloned()
    }

    pub async fn list_templates(&self) -> Vec<WorkflowTemplate> {
        let mut out: Vec<WorkflowTemplate> =
            self.state.read().await.templates.values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub async fn set_template_enabled(&self, id: Uuid, enabled: bool) -> Result<WorkflowTemplate> {
        let mut state = self.state.write().await;
        let template = state
            .templates
            .get_mut(&id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("template {id}")))?;
        template.enabled = enabled;
        template.updated_at = Utc::now();
        Ok(template.clone())
    }

    pub async fn delete_template(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .templates
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| OrchestratorError::NotFound(format!("template {id}")))
    }

    /// Bump usage on successful instantiation.
    pub async fn record_template_usage(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        let template = state
            .templates
            .get_mut(&id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("template {id}")))?;
        template.usage_count += 1;
        template.updated_at = Utc::now();
        Ok(())
    }

    /// Fold a graph outcome into the template's running success rate.
    pub async fn record_template_outcome(&self, id: Uuid, success: bool) -> Result<()> {
        let mut state = self.state.write().await;
        let template = state
            .templates
            .get_mut(&id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("template {id}")))?;
        let runs = template.usage_count.max(1) as f64;
        let prior = template.success_rate.unwrap_or(0.0);
        let observed = if success { 1.0 } else { 0.0 };
        template.success_rate = Some(prior + (observed - prior) / runs);
        template.updated_at = Utc::now();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Workflow graphs & nodes
    // ------------------------------------------------------------------

    /// Insert a graph together with all its nodes, atomically.
    pub async fn insert_graph(
        &self,
        graph: WorkflowGraphRecord,
        nodes: Vec<WorkflowNodeRecord>,
    ) -> Result<WorkflowGraphRecord> {
        let mut state = self.state.write().await;
        let mut ordered: Vec<(i32, Uuid)> = nodes.iter().map(|n| (n.position, n.id)).collect();
        ordered.sort();
        state
            .graph_nodes
            .insert(graph.id, ordered.into_iter().map(|(_, id)| id).collect());
        for node in nodes {
            state.nodes.insert(node.id, node);
        }
        state.graphs.insert(graph.id, graph.clone());
        Ok(graph)
    }

    pub async fn get_graph(&self, id: Uuid) -> Option<WorkflowGraphRecord> {
        self.state.read().await.graphs.get(&id).cloned()
    }

    pub async fn get_node(&self, id: Uuid) -> Option<WorkflowNodeRecord> {
        self.state.read().await.nodes.get(&id).cloned()
    }

    /// Nodes of a graph in position order.
    pub async fn graph_nodes(&self, graph_id: Uuid) -> Vec<WorkflowNodeRecord> {
        let state = self.state.read().await;
        state
            .graph_nodes
            .get(&graph_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.nodes.get(id))
            .cloned()
            .collect()
    }

    /// The node an agent was spawned for, if any.
    pub async fn node_by_agent(&self, agent_id: Uuid) -> Option<WorkflowNodeRecord> {
        self.state
            .read()
            .await
            .nodes
            .values()
            .find(|n| n.agent_id == Some(agent_id))
            .cloned()
    }

    pub async fn set_graph_validation(
        &self,
        id: Uuid,
        status: ValidationStatus,
        errors: Vec<String>,
    ) -> Result<WorkflowGraphRecord> {
        let mut state = self.state.write().await;
        let graph = state
            .graphs
            .get_mut(&id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("graph {id}")))?;
        let now = Utc::now();
        graph.validation_status = status;
        graph.validation_errors = errors;
        graph.updated_at = now;
        if status == ValidationStatus::Validated {
            graph.validated_at = Some(now);
        }
        Ok(graph.clone())
    }

    /// Advance the graph run status. Terminal statuses are absorbing; a
    /// write against a terminal graph is a no-op returning `None`.
    pub async fn set_graph_status(
        &self,
        id: Uuid,
        to: GraphStatus,
    ) -> Result<Option<WorkflowGraphRecord>> {
        let mut state = self.state.write().await;
        let graph = state
            .graphs
            .get_mut(&id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("graph {id}")))?;
        if graph.status.is_terminal() {
            return Ok(None);
        }
        let now = Utc::now();
        graph.status = to;
        graph.updated_at = now;
        if to.is_terminal() {
            graph.completed_at = Some(now);
        }
        Ok(Some(graph.clone()))
    }

    /// Record the agent under which this graph's node agents are spawned.
    pub async fn bind_graph_parent(&self, id: Uuid, parent_agent_id: Option<Uuid>) -> Result<()> {
        let mut state = self.state.write().await;
        let graph = state
            .graphs
            .get_mut(&id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("graph {id}")))?;
        graph.parent_agent_id = parent_agent_id;
        graph.updated_at = Utc::now();
        Ok(())
    }

    /// Optimistically advance a node's execution status: the write applies
    /// only when the current status is one of `expect`, otherwise the call is
    /// a no-op returning `None`. This is the guard that makes duplicate
    /// engine invocations harmless.
    pub async fn advance_node(
        &self,
        node_id: Uuid,
        expect: &[NodeExecutionStatus],
        to: NodeExecutionStatus,
        patch: NodePatch,
    ) -> Result<Option<WorkflowNodeRecord>> {
        let mut state = self.state.write().await;
        let node = state
            .nodes
            .get_mut(&node_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("node {node_id}")))?;
        if !expect.contains(&node.execution_status) {
            return Ok(None);
        }
        node.execution_status = to;
        node.updated_at = Utc::now();
        if let Some(agent_id) = patch.agent_id {
            node.agent_id = Some(agent_id);
        }
        if let Some(t) = patch.spawn_timestamp {
            node.spawn_timestamp = Some(t);
        }
        if let Some(t) = patch.completion_timestamp {
            node.completion_timestamp = Some(t);
        }
        if let Some(result) = patch.result {
            node.result = Some(result);
        }
        if let Some(error) = patch.error_message {
            node.error_message = Some(error);
        }
        Ok(Some(node.clone()))
    }

    /// Aggregate counters for operational views.
    pub async fn stats(&self) -> StoreStats {
        let state = self.state.read().await;
        let mut stats = StoreStats::default();
        for agent in state.agents.values() {
            match agent.status {
                AgentStatus::Pending => stats.agents_pending += 1,
                AgentStatus::Executing => stats.agents_executing += 1,
                AgentStatus::Completed => stats.agents_completed += 1,
                AgentStatus::Failed => stats.agents_failed += 1,
                AgentStatus::Terminated => stats.agents_terminated += 1,
            }
        }
        for budget in state.budgets.values() {
            if state
                .agents
                .get(&budget.agent_id)
                .map(|a| a.parent_id.is_none())
                .unwrap_or(false)
            {
                stats.tokens_used += budget.used;
            }
        }
        for message in state.messages.values() {
            match message.status {
                MessageStatus::Pending => stats.messages_pending += 1,
                MessageStatus::Delivered => stats.messages_delivered += 1,
                MessageStatus::Processed => stats.messages_processed += 1,
            }
        }
        for graph in state.graphs.values() {
            match graph.status {
                GraphStatus::Active | GraphStatus::Paused => stats.workflows_running += 1,
                GraphStatus::Completed => stats.workflows_completed += 1,
                GraphStatus::Failed => stats.workflows_failed += 1,
            }
        }
        stats.templates = state.templates.len();
        stats
    }

    /// Executing workflow nodes whose bound agent has reached a terminal
    /// status, i.e. the poller's reconciliation read.
    pub async fn nodes_awaiting_reconciliation(&self) -> Vec<(WorkflowNodeRecord, AgentRecord)> {
        let state = self.state.read().await;
        state
            .nodes
            .values()
            .filter(|n| n.execution_status == NodeExecutionStatus::Executing)
            .filter_map(|n| {
                let agent = state.agents.get(&n.agent_id?)?;
                agent.status.is_terminal().then(|| (n.clone(), agent.clone()))
            })
            .collect()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreState {
    /// Spawn guards: parent existence and liveness, budget headroom, cycle
    /// and depth limits. Returns the child's depth level.
    fn validate_spawn(&self, req: &NewAgent, max_depth: u32) -> Result<u32> {
        if let Some(id) = req.id {
            if let Some(parent_id) = req.parent_id {
                if id == parent_id
                    || self.ancestors_locked(parent_id).iter().any(|a| a.id == id)
                {
                    return Err(OrchestratorError::CycleDetected(format!(
                        "agent {id} is an ancestor of prospective parent {parent_id}"
                    )));
                }
            }
            if self.agents.contains_key(&id) {
                return Err(OrchestratorError::InvalidTransition(format!(
                    "agent {id} already exists"
                )));
            }
        }
        let Some(parent_id) = req.parent_id else {
            return Ok(0);
        };
        let parent = self
            .agents
            .get(&parent_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("agent {parent_id}")))?;
        if parent.status.is_terminal() {
            return Err(OrchestratorError::InvalidTransition(format!(
                "parent {parent_id} is {:?}",
                parent.status
            )));
        }
        let depth = parent.depth_level + 1;
        if depth > max_depth {
            return Err(OrchestratorError::DepthLimitExceeded(format!(
                "spawn at depth {depth} exceeds the configured maximum {max_depth}"
            )));
        }
        let parent_budget = self
            .budgets
            .get(&parent_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("budget {parent_id}")))?;
        if parent_budget.available() < req.budget {
            return Err(OrchestratorError::BudgetExhausted(format!(
                "parent {parent_id} has {} tokens available, child requested {}",
                parent_budget.available(),
                req.budget
            )));
        }
        Ok(depth)
    }

    fn ancestors_locked(&self, id: Uuid) -> Vec<AgentRecord> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut current = self.agents.get(&id).and_then(|a| a.parent_id);
        while let Some(parent_id) = current {
            if !seen.insert(parent_id) {
                break;
            }
            match self.agents.get(&parent_id) {
                Some(parent) => {
                    out.push(parent.clone());
                    current = parent.parent_id;
                }
                None => break,
            }
        }
        out
    }

    /// Exactly-once reclamation, flag-guarded. Moves the child's consumption
    /// into the parent's `used` and releases the full reservation, so unused
    /// tokens return to the parent's available pool.
    fn reclaim_locked(&mut self, child_id: Uuid, now: DateTime<Utc>) -> bool {
        let Some(child_budget) = self.budgets.get(&child_id) else {
            return false;
        };
        if child_budget.reclaimed {
            return false;
        }
        let allocated = child_budget.allocated;
        let used = child_budget.used;
        let parent_id = self.agents.get(&child_id).and_then(|a| a.parent_id);
        if let Some(parent_id) = parent_id {
            if let Some(parent_budget) = self.budgets.get_mut(&parent_id) {
                parent_budget.reserved = parent_budget.reserved.saturating_sub(allocated);
                parent_budget.used += used;
                parent_budget.updated_at = now;
            }
        }
        let child_budget = self.budgets.get_mut(&child_id).expect("checked above");
        child_budget.reclaimed = true;
        child_budget.updated_at = now;
        true
    }

    fn insert_message_locked(
        &mut self,
        sender_id: Uuid,
        recipient_id: Uuid,
        payload: serde_json::Value,
        priority: i32,
    ) -> MessageRecord {
        self.message_seq += 1;
        let message = MessageRecord {
            id: Uuid::new_v4(),
            sender_id,
            recipient_id,
            payload,
            priority,
            status: MessageStatus::Pending,
            seq: self.message_seq,
            created_at: Utc::now(),
            processed_at: None,
        };
        self.inbox
            .entry(recipient_id)
            .or_default()
            .push(message.id);
        self.messages.insert(message.id, message.clone());
        message
    }
}
