//! Daemon configuration: a flat JSON file with env-overridable defaults.

use fleet_orchestrator::{OrchestratorConfig, PollerConfig, RetentionConfig, WorkerConfig};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// JSON snapshot the store persists to; omit for a purely in-memory run.
    pub snapshot_path: Option<PathBuf>,
    pub snapshot_interval_secs: u64,
    pub workspace_root: PathBuf,
    pub executor_url: String,
    pub executor_timeout_secs: u64,
    pub worker_interval_ms: u64,
    pub worker_claim_limit: usize,
    pub worker_concurrency: usize,
    pub worker_max_commit_retries: u32,
    pub poller_interval_secs: u64,
    pub retention_sweep_secs: u64,
    pub retention_max_age_secs: u64,
    pub max_hierarchy_depth: u32,
    pub event_capacity: usize,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            snapshot_path: Some(PathBuf::from("fleet-state.json")),
            snapshot_interval_secs: 30,
            workspace_root: PathBuf::from("workspaces"),
            executor_url: env::var("FLEET_EXECUTOR_URL")
                .unwrap_or_else(|_| "http://localhost:3033/execute".to_string()),
            executor_timeout_secs: 300,
            worker_interval_ms: 1000,
            worker_claim_limit: 8,
            worker_concurrency: 4,
            worker_max_commit_retries: 3,
            poller_interval_secs: 5,
            retention_sweep_secs: 60,
            retention_max_age_secs: 24 * 60 * 60,
            max_hierarchy_depth: 10,
            event_capacity: 256,
        }
    }
}

impl FleetConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_hierarchy_depth: self.max_hierarchy_depth,
            event_capacity: self.event_capacity,
            worker: WorkerConfig {
                interval: Duration::from_millis(self.worker_interval_ms),
                claim_limit: self.worker_claim_limit,
                concurrency: self.worker_concurrency,
                executor_timeout: Duration::from_secs(self.executor_timeout_secs),
                max_commit_retries: self.worker_max_commit_retries,
            },
            poller: PollerConfig {
                interval: Duration::from_secs(self.poller_interval_secs),
            },
            retention: RetentionConfig {
                interval: Duration::from_secs(self.retention_sweep_secs),
                max_age: Duration::from_secs(self.retention_max_age_secs),
            },
        }
    }
}
