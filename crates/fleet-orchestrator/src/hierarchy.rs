//! Agent Hierarchy Service
//!
//! Ancestor/descendant views over the parent forest, cycle checks for spawn
//! requests, and depth queries. The authoritative parent link is
//! `AgentRecord.parent_id`; the store's children index is maintained in the
//! same transaction as every spawn, so both views always agree.

use crate::model::AgentRecord;
use crate::store::Store;
use crate::{OrchestratorError, Result};
use std::sync::Arc;
use uuid::Uuid;

pub struct HierarchyService {
    store: Arc<Store>,
    max_depth: u32,
}

impl HierarchyService {
    pub fn new(store: Arc<Store>, max_depth: u32) -> Self {
        Self { store, max_depth }
    }

    /// Ancestor chain from the immediate parent up to the root.
    pub async fn ancestors(&self, id: Uuid) -> Vec<AgentRecord> {
        self.store.ancestors(id).await
    }

    /// All transitive descendants, breadth-first.
    pub async fn descendants(&self, id: Uuid) -> Vec<AgentRecord> {
        self.store.descendants(id).await
    }

    /// True when attaching `child` under `parent` would close a cycle:
    /// the child is the parent itself or one of its ancestors.
    pub async fn would_create_cycle(&self, parent: Uuid, child: Uuid) -> bool {
        parent == child || self.store.is_ancestor(child, parent).await
    }

    /// Depth of an agent in its tree, root = 0. Walks the ancestor chain and
    /// cross-checks the recorded depth level, bounded by the configured
    /// maximum so a corrupted chain cannot loop forever.
    pub async fn depth(&self, id: Uuid) -> Result<u32> {
        let agent = self
            .store
            .get_agent(id)
            .await
            .ok_or_else(|| OrchestratorError::NotFound(format!("agent {id}")))?;
        let walked = self.store.ancestors(id).await.len() as u32;
        if walked > self.max_depth {
            return Err(OrchestratorError::DepthLimitExceeded(format!(
                "agent {id} ancestor chain exceeds the configured maximum {}",
                self.max_depth
            )));
        }
        Ok(agent.depth_level.max(walked))
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }
}
