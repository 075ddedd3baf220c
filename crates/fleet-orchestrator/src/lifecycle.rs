//! Agent Lifecycle Service
//!
//! Spawning, status transitions with their cascades, and subtree
//! termination. Spawn provisions a workspace between two validation passes
//! so no store lock is held across the filesystem call; a failed spawn
//! transaction tears the workspace back down.

use crate::events::{EventBus, OrchestratorEvent};
use crate::model::{AgentRecord, AgentStatus, ControlState};
use crate::store::{ExecutionPatch, NewAgent, Store};
use crate::workspace::WorkspaceManager;
use crate::{OrchestratorError, Result};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// A spawn request as accepted from callers (API layer, workflow engine,
/// work-tracker adaptor).
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Caller-supplied id, e.g. for external replays. `None` generates one.
    pub id: Option<Uuid>,
    pub role: String,
    pub task: String,
    pub budget: u64,
    pub parent_id: Option<Uuid>,
    pub model_hint: Option<String>,
}

impl SpawnRequest {
    pub fn new(role: impl Into<String>, task: impl Into<String>, budget: u64) -> Self {
        Self {
            id: None,
            role: role.into(),
            task: task.into(),
            budget,
            parent_id: None,
            model_hint: None,
        }
    }

    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }
}

pub struct AgentLifecycleService {
    store: Arc<Store>,
    workspaces: Arc<dyn WorkspaceManager>,
    events: EventBus,
    max_depth: u32,
}

impl AgentLifecycleService {
    pub fn new(
        store: Arc<Store>,
        workspaces: Arc<dyn WorkspaceManager>,
        events: EventBus,
        max_depth: u32,
    ) -> Self {
        Self {
            store,
            workspaces,
            events,
            max_depth,
        }
    }

    /// Spawn an agent in `pending` state, reserving its budget on the parent.
    ///
    /// Validation runs twice: a read-only precheck before the workspace is
    /// provisioned, then again inside the spawn transaction. If the
    /// transaction fails after the workspace exists, the workspace is
    /// deleted and the error is surfaced unchanged.
    pub async fn spawn(&self, request: SpawnRequest) -> Result<AgentRecord> {
        let id = request.id.unwrap_or_else(Uuid::new_v4);
        let new_agent = NewAgent {
            id: Some(id),
            role: request.role,
            task: request.task,
            budget: request.budget,
            parent_id: request.parent_id,
            model_hint: request.model_hint,
        };
        self.store.precheck_spawn(&new_agent, self.max_depth).await?;

        let workspace = self.workspaces.create(id).await?;
        let workspace_path = workspace.path.to_string_lossy().into_owned();

        match self
            .store
            .spawn_agent(&new_agent, Some(workspace_path), self.max_depth)
            .await
        {
            Ok(agent) => {
                info!(
                    agent_id = %agent.id,
                    role = %agent.role,
                    parent_id = ?agent.parent_id,
                    budget = new_agent.budget,
                    depth = agent.depth_level,
                    "agent spawned"
                );
                self.events.publish(OrchestratorEvent::AgentSpawned {
                    agent_id: agent.id,
                    parent_id: agent.parent_id,
                });
                Ok(agent)
            }
            Err(e) => {
                if let Err(cleanup) = self.workspaces.delete(id).await {
                    warn!(agent_id = %id, error = %cleanup, "workspace cleanup after failed spawn");
                }
                Err(e)
            }
        }
    }

    /// Transition an agent's lifecycle status. Terminal statuses are
    /// absorbing; a terminal transition runs budget reclamation in the same
    /// store transaction and publishes a lifecycle event.
    pub async fn update_status(&self, id: Uuid, to: AgentStatus) -> Result<AgentRecord> {
        self.apply_transition(id, to, None).await
    }

    /// Record an execution outcome together with the terminal transition.
    pub async fn record_outcome(
        &self,
        id: Uuid,
        to: AgentStatus,
        patch: ExecutionPatch,
    ) -> Result<AgentRecord> {
        self.apply_transition(id, to, Some(patch)).await
    }

    async fn apply_transition(
        &self,
        id: Uuid,
        to: AgentStatus,
        patch: Option<ExecutionPatch>,
    ) -> Result<AgentRecord> {
        let agent = self.store.transition_agent(id, to, patch.as_ref()).await?;
        info!(agent_id = %id, status = ?to, "agent status changed");
        if to == AgentStatus::Terminated {
            if let Err(e) = self.workspaces.delete(id).await {
                warn!(agent_id = %id, error = %e, "workspace cleanup on termination");
            }
        }
        self.events.publish(OrchestratorEvent::AgentStatusChanged {
            agent_id: id,
            status: to,
        });
        Ok(agent)
    }

    /// Terminate an agent and its whole subtree. All non-terminal members
    /// transition to `terminated` in one store transaction; each transition
    /// fires the same reclamation as [`AgentLifecycleService::update_status`].
    pub async fn terminate_tree(&self, root_id: Uuid, reason: &str) -> Result<Vec<AgentRecord>> {
        if self.store.get_agent(root_id).await.is_none() {
            return Err(OrchestratorError::NotFound(format!("agent {root_id}")));
        }
        let _ = self
            .store
            .set_control_state(root_id, ControlState::Terminating)
            .await;

        let mut targets = vec![root_id];
        targets.extend(self.store.descendants(root_id).await.into_iter().map(|a| a.id));
        let transitioned = self.store.terminate_agents(&targets, reason).await;

        info!(
            root_id = %root_id,
            terminated = transitioned.len(),
            reason,
            "agent tree terminated"
        );
        for agent in &transitioned {
            if let Err(e) = self.workspaces.delete(agent.id).await {
                warn!(agent_id = %agent.id, error = %e, "workspace cleanup on termination");
            }
            self.events.publish(OrchestratorEvent::AgentStatusChanged {
                agent_id: agent.id,
                status: AgentStatus::Terminated,
            });
        }
        Ok(transitioned)
    }

    /// Pause a running agent so the execution worker stops claiming it.
    pub async fn pause(&self, id: Uuid) -> Result<AgentRecord> {
        self.store.set_control_state(id, ControlState::Paused).await
    }

    /// Resume a paused agent.
    pub async fn resume(&self, id: Uuid) -> Result<AgentRecord> {
        self.store.set_control_state(id, ControlState::Running).await
    }

    pub async fn get(&self, id: Uuid) -> Result<AgentRecord> {
        self.store
            .get_agent(id)
            .await
            .ok_or_else(|| OrchestratorError::NotFound(format!("agent {id}")))
    }
}
