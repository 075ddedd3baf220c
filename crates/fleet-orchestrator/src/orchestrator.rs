//! Orchestrator Facade
//!
//! Wires the store, services, engine and background workers together.
//! Collaborators (store, executor, workspace isolator) are passed in rather
//! than constructed globally, so the whole stack stays testable.

use crate::budget::BudgetService;
use crate::engine::WorkflowEngine;
use crate::events::EventBus;
use crate::executor::LlmExecutor;
use crate::hierarchy::HierarchyService;
use crate::lifecycle::AgentLifecycleService;
use crate::messaging::{run_retention_sweeper, MessageQueue};
use crate::poller::WorkflowPoller;
use crate::store::Store;
use crate::worker::ExecutionWorker;
use crate::workflow::WorkflowService;
use crate::workspace::WorkspaceManager;
use crate::OrchestratorConfig;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<Store>,
    events: EventBus,
    hierarchy: Arc<HierarchyService>,
    budgets: Arc<BudgetService>,
    lifecycle: Arc<AgentLifecycleService>,
    messages: Arc<MessageQueue>,
    workflows: Arc<WorkflowService>,
    engine: Arc<WorkflowEngine>,
    executor: Arc<dyn LlmExecutor>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<Store>,
        executor: Arc<dyn LlmExecutor>,
        workspaces: Arc<dyn WorkspaceManager>,
    ) -> Self {
        let events = EventBus::new(config.event_capacity);
        let hierarchy = Arc::new(HierarchyService::new(
            store.clone(),
            config.max_hierarchy_depth,
        ));
        let budgets = Arc::new(BudgetService::new(store.clone()));
        let lifecycle = Arc::new(AgentLifecycleService::new(
            store.clone(),
            workspaces,
            events.clone(),
            config.max_hierarchy_depth,
        ));
        let messages = Arc::new(MessageQueue::new(store.clone()));
        let workflows = Arc::new(WorkflowService::new(store.clone()));
        let engine = Arc::new(WorkflowEngine::new(
            store.clone(),
            lifecycle.clone(),
            workflows.clone(),
        ));
        Self {
            config,
            store,
            events,
            hierarchy,
            budgets,
            lifecycle,
            messages,
            workflows,
            engine,
            executor,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<Store> {
        self.store.clone()
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    pub fn hierarchy(&self) -> Arc<HierarchyService> {
        self.hierarchy.clone()
    }

    pub fn budgets(&self) -> Arc<BudgetService> {
        self.budgets.clone()
    }

    pub fn lifecycle(&self) -> Arc<AgentLifecycleService> {
        self.lifecycle.clone()
    }

    pub fn messages(&self) -> Arc<MessageQueue> {
        self.messages.clone()
    }

    pub fn workflows(&self) -> Arc<WorkflowService> {
        self.workflows.clone()
    }

    pub fn engine(&self) -> Arc<WorkflowEngine> {
        self.engine.clone()
    }

    /// Build an execution worker over this orchestrator's services.
    pub fn execution_worker(&self) -> ExecutionWorker {
        ExecutionWorker::new(
            self.store.clone(),
            self.budgets.clone(),
            self.lifecycle.clone(),
            self.executor.clone(),
            self.config.worker.clone(),
        )
    }

    /// Build a workflow poller over this orchestrator's services.
    pub fn workflow_poller(&self) -> WorkflowPoller {
        WorkflowPoller::new(
            self.store.clone(),
            self.engine.clone(),
            self.events.clone(),
            self.config.poller.clone(),
        )
    }

    /// Spawn the background loops: execution worker, workflow poller and
    /// message retention sweeper. All stop when `cancel` fires.
    pub fn spawn_background(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let worker = self.execution_worker();
        let poller = self.workflow_poller();
        let queue = self.messages.clone();
        let retention = self.config.retention.clone();

        let worker_cancel = cancel.clone();
        let poller_cancel = cancel.clone();
        let sweeper_cancel = cancel.clone();
        vec![
            tokio::spawn(async move { worker.run(worker_cancel).await }),
            tokio::spawn(async move { poller.run(poller_cancel).await }),
            tokio::spawn(run_retention_sweeper(queue, retention, sweeper_cancel)),
        ]
    }
}
