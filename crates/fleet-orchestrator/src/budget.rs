//! Budget Service
//!
//! Token accounting across the hierarchy. Allocation happens inside the
//! spawn transaction (the child's `allocated` is reserved on the parent);
//! this service covers the remaining flows: strict consumption, saturating
//! charges for executor overruns, and exactly-once reclamation at terminal
//! transitions.

use crate::model::BudgetRecord;
use crate::store::Store;
use crate::{OrchestratorError, Result};
use std::sync::Arc;
use uuid::Uuid;

pub struct BudgetService {
    store: Arc<Store>,
}

impl BudgetService {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub async fn get(&self, agent_id: Uuid) -> Result<BudgetRecord> {
        self.store
            .get_budget(agent_id)
            .await
            .ok_or_else(|| OrchestratorError::NotFound(format!("budget {agent_id}")))
    }

    /// Tokens the agent can still spend itself.
    pub async fn available(&self, agent_id: Uuid) -> Result<u64> {
        Ok(self.get(agent_id).await?.available())
    }

    /// Strict consumption: fails with `BudgetExhausted` when the guard
    /// `used + reserved + tokens <= allocated` does not hold, leaving the
    /// budget unchanged.
    pub async fn consume(&self, agent_id: Uuid, tokens: u64) -> Result<BudgetRecord> {
        self.store.consume_budget(agent_id, tokens).await
    }

    /// Charge actual executor consumption, clamped to the available headroom
    /// so the budget invariant holds even when the executor overran. Returns
    /// the amount charged; a short charge signals an overrun to the caller.
    pub async fn charge(&self, agent_id: Uuid, tokens: u64) -> Result<u64> {
        self.store.charge_budget(agent_id, tokens).await
    }

    /// Return a terminated agent's unused tokens to its parent. Idempotent:
    /// the `reclaimed` flag guarantees exactly-once semantics no matter how
    /// many times the terminal transition is replayed. Reclamation never
    /// cascades; each level reclaims at its own terminal transition.
    pub async fn reclaim(&self, agent_id: Uuid) -> Result<bool> {
        let reclaimed = self.store.reclaim_budget(agent_id).await?;
        if reclaimed {
            tracing::debug!(agent_id = %agent_id, "budget reclaimed");
        }
        Ok(reclaimed)
    }
}
