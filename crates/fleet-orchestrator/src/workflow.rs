//! Workflow Template Service
//!
//! CRUD for reusable workflow blueprints and template → graph
//! instantiation: budget percentages become concrete allocations, `{TASK}`
//! placeholders are substituted, and template-local node ids are mapped to
//! persisted UUIDs so dependencies resolve.

use crate::model::*;
use crate::store::Store;
use crate::{OrchestratorError, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Placeholder substituted with the concrete task at instantiation.
pub const TASK_PLACEHOLDER: &str = "{TASK}";

/// Caller-facing template definition; bookkeeping fields are filled in on
/// creation.
#[derive(Debug, Clone)]
pub struct TemplateSpec {
    pub name: String,
    pub description: String,
    pub category: Option<String>,
    pub node_templates: Vec<NodeTemplate>,
    pub edge_patterns: Vec<EdgePattern>,
    pub total_estimated_budget: u64,
    pub complexity_rating: f32,
    pub min_budget_required: u64,
    pub created_by: Option<String>,
}

pub struct WorkflowService {
    store: Arc<Store>,
}

impl WorkflowService {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Register a template after validating its shape. Node-level dependency
    /// and cycle checks happen at graph validation, not here.
    pub async fn create_template(&self, spec: TemplateSpec) -> Result<WorkflowTemplate> {
        if spec.node_templates.is_empty() {
            return Err(OrchestratorError::GraphInvalid(
                "template has no nodes".into(),
            ));
        }
        if spec.total_estimated_budget == 0 {
            return Err(OrchestratorError::GraphInvalid(
                "total_estimated_budget must be positive".into(),
            ));
        }
        if spec.min_budget_required == 0 || spec.min_budget_required > spec.total_estimated_budget {
            return Err(OrchestratorError::GraphInvalid(format!(
                "min_budget_required {} must be positive and at most the estimated budget {}",
                spec.min_budget_required, spec.total_estimated_budget
            )));
        }
        if !(0.0..=10.0).contains(&spec.complexity_rating) {
            return Err(OrchestratorError::GraphInvalid(format!(
                "complexity_rating {} outside [0, 10]",
                spec.complexity_rating
            )));
        }
        for node in &spec.node_templates {
            if !(0.0..=100.0).contains(&node.budget_percentage) {
                return Err(OrchestratorError::GraphInvalid(format!(
                    "node {:?} budget percentage {} outside [0, 100]",
                    node.node_id, node.budget_percentage
                )));
            }
        }

        let now = Utc::now();
        let template = WorkflowTemplate {
            id: Uuid::new_v4(),
            name: spec.name,
            description: spec.description,
            category: spec.category,
            node_templates: spec.node_templates,
            edge_patterns: spec.edge_patterns,
            total_estimated_budget: spec.total_estimated_budget,
            complexity_rating: spec.complexity_rating,
            min_budget_required: spec.min_budget_required,
            usage_count: 0,
            success_rate: None,
            enabled: true,
            created_by: spec.created_by,
            created_at: now,
            updated_at: now,
        };
        let template = self.store.insert_template(template).await?;
        info!(template_id = %template.id, name = %template.name, "workflow template created");
        Ok(template)
    }

    pub async fn get_template(&self, id: Uuid) -> Result<WorkflowTemplate> {
        self.store
            .get_template(id)
            .await
            .ok_or_else(|| OrchestratorError::NotFound(format!("template {id}")))
    }

    pub async fn template_by_name(&self, name: &str) -> Option<WorkflowTemplate> {
        self.store.template_by_name(name).await
    }

    pub async fn list_templates(&self) -> Vec<WorkflowTemplate> {
        self.store.list_templates().await
    }

    pub async fn set_template_enabled(&self, id: Uuid, enabled: bool) -> Result<WorkflowTemplate> {
        self.store.set_template_enabled(id, enabled).await
    }

    pub async fn delete_template(&self, id: Uuid) -> Result<()> {
        self.store.delete_template(id).await
    }

    /// Instantiate a template into a concrete graph. The graph is created
    /// `active` with validation still `pending`; the engine validates before
    /// anything executes. No graph is created when the budget gate or the
    /// local-id mapping fails.
    pub async fn instantiate(
        &self,
        template_id: Uuid,
        graph_name: impl Into<String>,
        task: &str,
        budget: u64,
    ) -> Result<WorkflowGraphRecord> {
        let template = self.get_template(template_id).await?;
        if !template.enabled {
            return Err(OrchestratorError::GraphInvalid(format!(
                "template {:?} is disabled",
                template.name
            )));
        }
        if budget < template.min_budget_required {
            return Err(OrchestratorError::InsufficientBudget(format!(
                "budget {budget} below template minimum {}",
                template.min_budget_required
            )));
        }

        let mut node_templates = template.node_templates.clone();
        node_templates.sort_by_key(|t| t.position);

        let id_map: HashMap<&str, Uuid> = node_templates
            .iter()
            .map(|t| (t.node_id.as_str(), Uuid::new_v4()))
            .collect();

        let graph_id = Uuid::new_v4();
        let now = Utc::now();
        let mut nodes = Vec::with_capacity(node_templates.len());
        let mut total_edges = 0usize;
        for node_template in &node_templates {
            let dependencies = node_template
                .dependencies
                .iter()
                .map(|dep| {
                    id_map.get(dep.as_str()).copied().ok_or_else(|| {
                        OrchestratorError::DependencyMissing(format!(
                            "node {:?} depends on unknown node {dep:?}",
                            node_template.node_id
                        ))
                    })
                })
                .collect::<Result<Vec<Uuid>>>()?;
            total_edges += dependencies.len();
            let allocation =
                ((budget as f64) * node_template.budget_percentage / 100.0).floor() as u64;
            nodes.push(WorkflowNodeRecord {
                id: id_map[node_template.node_id.as_str()],
                workflow_graph_id: graph_id,
                agent_id: None,
                role: node_template.role.clone(),
                task_description: node_template
                    .task_template
                    .replace(TASK_PLACEHOLDER, task),
                budget_allocation: allocation,
                dependencies,
                execution_status: NodeExecutionStatus::Pending,
                spawn_timestamp: None,
                completion_timestamp: None,
                result: None,
                error_message: None,
                position: node_template.position,
                metadata: Some(serde_json::json!({
                    "template_node_id": node_template.node_id,
                })),
                created_at: now,
                updated_at: now,
            });
        }

        let graph = WorkflowGraphRecord {
            id: graph_id,
            name: graph_name.into(),
            description: Some(template.description.clone()),
            template_id: Some(template.id),
            parent_agent_id: None,
            status: GraphStatus::Active,
            validation_status: ValidationStatus::Pending,
            validation_errors: Vec::new(),
            total_nodes: nodes.len(),
            total_edges,
            estimated_budget: Some(budget),
            complexity_rating: Some(template.complexity_rating),
            created_at: now,
            updated_at: now,
            validated_at: None,
            completed_at: None,
        };
        let graph = self.store.insert_graph(graph, nodes).await?;
        info!(
            graph_id = %graph.id,
            template = %template.name,
            nodes = graph.total_nodes,
            budget,
            "workflow graph instantiated"
        );
        Ok(graph)
    }
}
