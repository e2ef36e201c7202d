//! In-process `WorkflowStore` backed by concurrent maps.
//!
//! Useful when durability is not needed (embedding, tests). Records live as
//! long as the store.

use std::collections::HashMap;

use conductor_types::error::RepositoryError;
use conductor_types::workflow::{NodeRecord, WorkflowRecord};
use dashmap::DashMap;
use uuid::Uuid;

use super::workflow::WorkflowStore;

#[derive(Debug, Default)]
pub struct InMemoryWorkflowStore {
    workflows: DashMap<Uuid, WorkflowRecord>,
    nodes: DashMap<Uuid, HashMap<String, NodeRecord>>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored workflows.
    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}

impl WorkflowStore for InMemoryWorkflowStore {
    async fn save_workflow(&self, workflow: &WorkflowRecord) -> Result<(), RepositoryError> {
        self.workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn save_node(&self, workflow_id: &Uuid, node: &NodeRecord) -> Result<(), RepositoryError> {
        self.nodes
            .entry(*workflow_id)
            .or_default()
            .insert(node.node_id.clone(), node.clone());
        Ok(())
    }

    async fn load_workflow(&self, id: &Uuid) -> Result<Option<WorkflowRecord>, RepositoryError> {
        Ok(self.workflows.get(id).map(|entry| entry.value().clone()))
    }

    async fn load_nodes(&self, workflow_id: &Uuid) -> Result<Vec<NodeRecord>, RepositoryError> {
        let mut nodes: Vec<NodeRecord> = self
            .nodes
            .get(workflow_id)
            .map(|entry| entry.values().cloned().collect())
            .unwrap_or_default();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(nodes)
    }

    async fn list_workflows(&self, limit: u32) -> Result<Vec<WorkflowRecord>, RepositoryError> {
        let mut all: Vec<WorkflowRecord> = self
            .workflows
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        all.truncate(limit as usize);
        Ok(all)
    }
}
