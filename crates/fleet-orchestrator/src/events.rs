//! Lifecycle Event Bus
//!
//! Broadcast channel carrying orchestration events to the background workers.
//! The workflow poller subscribes so node reconciliation is event-driven in
//! steady state; the periodic tick remains the backstop for transitions that
//! happen outside the direct code path.

use crate::model::AgentStatus;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Events published by the lifecycle service.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    AgentSpawned {
        agent_id: Uuid,
        parent_id: Option<Uuid>,
    },
    AgentStatusChanged {
        agent_id: Uuid,
        status: AgentStatus,
    },
}

impl OrchestratorEvent {
    /// True for transitions into an absorbing agent status.
    pub fn is_terminal_transition(&self) -> bool {
        matches!(
            self,
            OrchestratorEvent::AgentStatusChanged { status, .. } if status.is_terminal()
        )
    }
}

/// Fan-out bus over `tokio::sync::broadcast`. Publishing never blocks and
/// never fails; subscribers that lag simply miss events and catch up on the
/// next poller tick.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: OrchestratorEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
