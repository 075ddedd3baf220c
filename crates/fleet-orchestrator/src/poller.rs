//! Workflow Poller
//!
//! Reconciles terminal agents with the workflow nodes they were spawned
//! for. In steady state the poller wakes on lifecycle events, so graph
//! advancement is effectively event-driven; the periodic tick guarantees
//! progress when a terminal transition happened outside the engine's code
//! path (crash recovery, external termination, lagged subscribers).
//!
//! Safe to invoke concurrently with the engine: node advances use
//! optimistic status guards, so a duplicate reconciliation is a no-op.

use crate::engine::WorkflowEngine;
use crate::events::EventBus;
use crate::model::AgentStatus;
use crate::store::Store;
use crate::PollerConfig;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct WorkflowPoller {
    store: Arc<Store>,
    engine: Arc<WorkflowEngine>,
    events: EventBus,
    config: PollerConfig,
}

impl WorkflowPoller {
    pub fn new(
        store: Arc<Store>,
        engine: Arc<WorkflowEngine>,
        events: EventBus,
        config: PollerConfig,
    ) -> Self {
        Self {
            store,
            engine,
            events,
            config,
        }
    }

    /// Run until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        // Holding the bus keeps the channel open for the poller's lifetime.
        let mut rx = self.events.subscribe();
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval = ?self.config.interval, "workflow poller started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.reconcile().await;
                }
                event = rx.recv() => match event {
                    Ok(event) if event.is_terminal_transition() => {
                        self.reconcile().await;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "poller lagged behind the event bus");
                        self.reconcile().await;
                    }
                    Err(RecvError::Closed) => {
                        // Tick-driven reconciliation continues.
                        rx = self.events.subscribe();
                    }
                },
            }
        }
        info!("workflow poller stopped");
    }

    /// One reconciliation pass. Returns the number of nodes advanced.
    pub async fn reconcile(&self) -> usize {
        let stale = self.store.nodes_awaiting_reconciliation().await;
        let mut advanced = 0usize;
        for (node, agent) in stale {
            let outcome = match agent.status {
                AgentStatus::Completed => {
                    self.engine
                        .process_completed_node(agent.id, agent.result.clone())
                        .await
                }
                AgentStatus::Failed | AgentStatus::Terminated => {
                    let reason = agent
                        .error
                        .as_deref()
                        .unwrap_or("agent reached a terminal status");
                    self.engine.process_failed_node(agent.id, reason).await
                }
                _ => continue,
            };
            match outcome {
                Ok(()) => advanced += 1,
                Err(e) => {
                    warn!(
                        node_id = %node.id,
                        agent_id = %agent.id,
                        error = %e,
                        "reconciling workflow node"
                    );
                }
            }
        }
        if advanced > 0 {
            debug!(advanced, "workflow poller reconciled nodes");
        }
        advanced
    }
}
