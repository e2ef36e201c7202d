//! Event types for the engine event bus.
//!
//! `EngineEvent` is broadcast on every workflow lifecycle change and every
//! node transition. All variants are Clone + Send + Sync for use with tokio
//! broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{NodeStatus, WorkflowStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A workflow was accepted and queued for admission.
    WorkflowSubmitted { workflow_id: Uuid, name: String },

    /// The coordinator picked the workflow up.
    WorkflowStarted { workflow_id: Uuid },

    /// A node moved along its state machine.
    NodeTransition {
        workflow_id: Uuid,
        node_id: String,
        from: NodeStatus,
        to: NodeStatus,
        attempt: u32,
    },

    /// A failed node will be retried after `delay_ms`.
    NodeRetryScheduled {
        workflow_id: Uuid,
        node_id: String,
        retry_count: u32,
        delay_ms: u64,
        error: String,
    },

    /// The workflow reached a terminal state.
    WorkflowFinished {
        workflow_id: Uuid,
        status: WorkflowStatus,
        duration_ms: u64,
    },
}

impl EngineEvent {
    pub fn workflow_id(&self) -> Uuid {
        match self {
            EngineEvent::WorkflowSubmitted { workflow_id, .. }
            | EngineEvent::WorkflowStarted { workflow_id }
            | EngineEvent::NodeTransition { workflow_id, .. }
            | EngineEvent::NodeRetryScheduled { workflow_id, .. }
            | EngineEvent::WorkflowFinished { workflow_id, .. } => *workflow_id,
        }
    }
}
