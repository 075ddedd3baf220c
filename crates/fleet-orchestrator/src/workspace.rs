//! Workspace Isolation
//!
//! Each agent owns an isolated mutable directory for the lifetime of its
//! execution. Creation happens during spawn (outside the store lock, with a
//! compensating delete if the spawn transaction fails); teardown happens on
//! termination.

use crate::{OrchestratorError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::PathBuf;
use uuid::Uuid;

/// An allocated workspace.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub path: PathBuf,
    pub tag: String,
}

/// The workspace isolator contract.
#[async_trait]
pub trait WorkspaceManager: Send + Sync {
    async fn create(&self, agent_id: Uuid) -> Result<Workspace>;
    async fn delete(&self, agent_id: Uuid) -> Result<()>;
}

/// Filesystem-backed workspaces: one directory per agent under a base path.
pub struct LocalWorkspaceManager {
    base: PathBuf,
    active: DashMap<Uuid, Workspace>,
}

impl LocalWorkspaceManager {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            active: DashMap::new(),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

#[async_trait]
impl WorkspaceManager for LocalWorkspaceManager {
    async fn create(&self, agent_id: Uuid) -> Result<Workspace> {
        let tag = format!("ws-{}", &agent_id.simple().to_string()[..12]);
        let path = self.base.join(agent_id.to_string());
        tokio::fs::create_dir_all(&path).await.map_err(|e| {
            OrchestratorError::WorkspaceUnavailable(format!(
                "could not create {}: {e}",
                path.display()
            ))
        })?;
        let workspace = Workspace { path, tag };
        self.active.insert(agent_id, workspace.clone());
        Ok(workspace)
    }

    async fn delete(&self, agent_id: Uuid) -> Result<()> {
        let Some((_, workspace)) = self.active.remove(&agent_id) else {
            return Ok(());
        };
        tokio::fs::remove_dir_all(&workspace.path)
            .await
            .or_else(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Ok(())
                } else {
                    Err(OrchestratorError::WorkspaceUnavailable(format!(
                        "could not remove {}: {e}",
                        workspace.path.display()
                    )))
                }
            })
    }
}
