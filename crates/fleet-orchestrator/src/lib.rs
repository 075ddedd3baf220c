//! Agent Fleet Orchestration Core
//!
//! This crate provides the durable orchestration core for hierarchical
//! agent fleets:
//! - Agent lifecycle management with cycle-free parent/child hierarchies
//! - Transactional token budgets with exactly-once reclamation
//! - Durable, priority-ordered agent-to-agent messaging
//! - Workflow DAGs with event-driven frontier execution
//! - Background workers: LLM execution dispatch and workflow reconciliation

pub mod budget;
pub mod engine;
pub mod events;
pub mod executor;
pub mod hierarchy;
pub mod lifecycle;
pub mod messaging;
pub mod model;
pub mod orchestrator;
pub mod poller;
pub mod store;
pub mod workflow;
pub mod worker;
pub mod workspace;

pub use budget::BudgetService;
pub use engine::{WorkflowEngine, WorkflowProgress};
pub use events::{EventBus, OrchestratorEvent};
pub use executor::{ExecutionOutcome, ExecutionRequest, LlmExecutor};
pub use hierarchy::HierarchyService;
pub use lifecycle::{AgentLifecycleService, SpawnRequest};
pub use messaging::MessageQueue;
pub use model::{
    AgentRecord, AgentStatus, BudgetRecord, ControlState, EdgePattern, GraphStatus,
    MessageRecord, MessageStatus, NodeExecutionStatus, NodeTemplate, ValidationStatus,
    WorkflowGraphRecord, WorkflowNodeRecord, WorkflowTemplate,
};
pub use orchestrator::Orchestrator;
pub use poller::WorkflowPoller;
pub use store::{ExecutionPatch, NewAgent, NodePatch, Store, StoreStats};
pub use workflow::{TemplateSpec, WorkflowService, TASK_PLACEHOLDER};
pub use worker::ExecutionWorker;
pub use workspace::{LocalWorkspaceManager, Workspace, WorkspaceManager};

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Budget exhausted: {0}")]
    BudgetExhausted(String),

    #[error("Cycle detected: {0}")]
    CycleDetected(String),

    #[error("Depth limit exceeded: {0}")]
    DepthLimitExceeded(String),

    #[error("Workflow graph invalid: {0}")]
    GraphInvalid(String),

    #[error("Dependency missing: {0}")]
    DependencyMissing(String),

    #[error("Insufficient budget: {0}")]
    InsufficientBudget(String),

    #[error("Executor failed: {0}")]
    ExecutorFailed(String),

    #[error("Workspace unavailable: {0}")]
    WorkspaceUnavailable(String),

    #[error("Store conflict: {0}")]
    StoreConflict(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Top-level configuration for the orchestration core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub max_hierarchy_depth: u32,
    pub event_capacity: usize,
    pub worker: WorkerConfig,
    pub poller: PollerConfig,
    pub retention: RetentionConfig,
}

/// Execution worker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub interval: Duration,
    pub claim_limit: usize,
    pub concurrency: usize,
    pub executor_timeout: Duration,
    pub max_commit_retries: u32,
}

/// Workflow poller tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    pub interval: Duration,
}

/// Message retention tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub interval: Duration,
    pub max_age: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_hierarchy_depth: 10,
            event_capacity: 256,
            worker: WorkerConfig::default(),
            poller: PollerConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            claim_limit: 8,
            concurrency: 4,
            executor_timeout: Duration::from_secs(300),
            max_commit_retries: 3,
        }
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_age: Duration::from_secs(24 * 60 * 60),
        }
    }
}
