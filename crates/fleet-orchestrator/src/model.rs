//! Persistent Data Model
//!
//! This module defines the records the store keeps authoritative: agents,
//! budgets, messages, workflow templates, graphs and nodes. Every record
//! carries a UUID primary key and creation/update timestamps; all status
//! enums distinguish terminal (absorbing) states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of an agent. Terminal statuses are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Terminated,
}

impl AgentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentStatus::Completed | AgentStatus::Failed | AgentStatus::Terminated
        )
    }
}

/// Operator-facing control state, orthogonal to the lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlState {
    Running,
    Paused,
    Terminating,
    Terminated,
}

/// An orchestrator-tracked unit of work with a budget and optional parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: Uuid,
    pub role: String,
    pub task: String,
    pub status: AgentStatus,
    pub control_state: ControlState,
    pub depth_level: u32,
    pub parent_id: Option<Uuid>,
    pub tokens_used: u64,
    pub execution_duration_ms: u64,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub workspace_path: Option<String>,
    pub model_hint: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Per-agent token budget, 1:1 with the agent row.
///
/// Invariant at every committed state: `used + reserved <= allocated`.
/// `allocated` is immutable after creation, `used` only grows, `reserved`
/// tracks the allocations of live children. `reclaimed` flips once, on the
/// agent's own terminal transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetRecord {
    pub agent_id: Uuid,
    pub allocated: u64,
    pub used: u64,
    pub reserved: u64,
    pub reclaimed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BudgetRecord {
    /// Tokens still spendable: not used, not reserved for children.
    pub fn available(&self) -> u64 {
        self.allocated.saturating_sub(self.used + self.reserved)
    }
}

/// Delivery status of a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Delivered,
    Processed,
}

/// A durable agent-to-agent message. Payloads are opaque JSON.
///
/// `seq` is a store-assigned monotonic counter used as the FIFO tie-breaker:
/// delivery order is `priority DESC, created_at ASC, seq ASC`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub recipient_id: Uuid,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub status: MessageStatus,
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// One node of a workflow template, addressed by a template-local string id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTemplate {
    pub node_id: String,
    pub role: String,
    pub task_template: String,
    pub budget_percentage: f64,
    pub dependencies: Vec<String>,
    pub position: i32,
}

/// Redundant edge listing kept for visualization surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgePattern {
    pub source_node_id: String,
    pub target_node_id: String,
}

/// Reusable workflow blueprint with budget percentages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub category: Option<String>,
    pub node_templates: Vec<NodeTemplate>,
    pub edge_patterns: Vec<EdgePattern>,
    pub total_estimated_budget: u64,
    pub complexity_rating: f32,
    pub min_budget_required: u64,
    pub usage_count: u64,
    pub success_rate: Option<f64>,
    pub enabled: bool,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Run status of an instantiated workflow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphStatus {
    Active,
    Paused,
    Completed,
    Failed,
}

impl GraphStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, GraphStatus::Completed | GraphStatus::Failed)
    }
}

/// Validation state of a graph. A graph never executes unless `Validated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Pending,
    Validated,
    Invalid,
}

/// An instantiated workflow DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowGraphRecord {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub template_id: Option<Uuid>,
    /// Agent under which node agents are spawned; bound at execution start.
    pub parent_agent_id: Option<Uuid>,
    pub status: GraphStatus,
    pub validation_status: ValidationStatus,
    pub validation_errors: Vec<String>,
    pub total_nodes: usize,
    pub total_edges: usize,
    pub estimated_budget: Option<u64>,
    pub complexity_rating: Option<f32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub validated_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Execution status of a single workflow node.
///
/// `pending → ready → spawning → executing → {completed, failed, skipped}`;
/// the three right-most states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeExecutionStatus {
    Pending,
    Ready,
    Spawning,
    Executing,
    Completed,
    Failed,
    Skipped,
}

impl NodeExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeExecutionStatus::Completed
                | NodeExecutionStatus::Failed
                | NodeExecutionStatus::Skipped
        )
    }
}

/// One node of an instantiated graph; becomes an agent when spawned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNodeRecord {
    pub id: Uuid,
    pub workflow_graph_id: Uuid,
    pub agent_id: Option<Uuid>,
    pub role: String,
    pub task_description: String,
    pub budget_allocation: u64,
    pub dependencies: Vec<Uuid>,
    pub execution_status: NodeExecutionStatus,
    pub spawn_timestamp: Option<DateTime<Utc>>,
    pub completion_timestamp: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub position: i32,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
