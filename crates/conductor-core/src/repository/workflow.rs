//! Workflow store trait definition.
//!
//! The in-memory model is authoritative while a workflow runs; the store is
//! a write-behind journal used for durability, audit, and for answering
//! `Status` after a workflow has been evicted from memory.

use conductor_types::error::RepositoryError;
use conductor_types::workflow::{NodeRecord, WorkflowRecord};
use uuid::Uuid;

/// Repository trait for workflow persistence.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowStore: Send + Sync {
    /// Upsert a workflow record by ID.
    fn save_workflow(
        &self,
        workflow: &WorkflowRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Upsert a node record keyed by `(workflow_id, node_id)`.
    fn save_node(
        &self,
        workflow_id: &Uuid,
        node: &NodeRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Load a workflow record by ID.
    fn load_workflow(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRecord>, RepositoryError>> + Send;

    /// Load every node record of a workflow.
    fn load_nodes(
        &self,
        workflow_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<NodeRecord>, RepositoryError>> + Send;

    /// List workflows, most recently created first.
    fn list_workflows(
        &self,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRecord>, RepositoryError>> + Send;
}
