//! In-memory state of one workflow run.
//!
//! `WorkflowInstance` bundles the immutable graph, the run's variable store,
//! the node table, and the workflow record. It is shared via `Arc` between
//! the supervisor, the coordinator task, and every node task of the run.
//!
//! Lock order is record -> nodes -> diagnostics; no path acquires them in the
//! opposite direction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use conductor_types::workflow::{
    CancelReason, NodeRecord, NodeStatus, Priority, WorkflowRecord, WorkflowSnapshot,
    WorkflowStatus,
};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::graph::Graph;
use super::variables::VariableStore;

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn mutex_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// NodeTable
// ---------------------------------------------------------------------------

/// A transition that was applied to a node record.
#[derive(Debug, Clone)]
pub struct Transition {
    pub from: NodeStatus,
    /// The record after the transition.
    pub record: NodeRecord,
}

/// A transition rejected by the node state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal node transition {from:?} -> {to}")]
pub struct InvalidTransition {
    /// `None` if the node does not exist.
    pub from: Option<NodeStatus>,
    pub to: NodeStatus,
}

/// Runtime records of every node in a run, keyed by node id.
///
/// Reads are open to everyone; `transition` is crate-private and only
/// called by the node runner.
#[derive(Debug)]
pub struct NodeTable {
    records: RwLock<HashMap<String, NodeRecord>>,
    /// Topological order, used for snapshots.
    order: Vec<String>,
}

impl NodeTable {
    pub fn new(graph: &Graph) -> Self {
        let order: Vec<String> = graph
            .topological_order()
            .into_iter()
            .map(String::from)
            .collect();
        let records = graph
            .nodes()
            .map(|spec| (spec.id.clone(), NodeRecord::pending(spec.id.clone(), spec.kind)))
            .collect();
        Self {
            records: RwLock::new(records),
            order,
        }
    }

    pub fn get(&self, node_id: &str) -> Option<NodeRecord> {
        read_lock(&self.records).get(node_id).cloned()
    }

    pub fn status(&self, node_id: &str) -> Option<NodeStatus> {
        read_lock(&self.records).get(node_id).map(|r| r.status)
    }

    pub fn statuses(&self) -> HashMap<String, NodeStatus> {
        read_lock(&self.records)
            .iter()
            .map(|(id, r)| (id.clone(), r.status))
            .collect()
    }

    /// Copy of every record, in topological order.
    pub fn snapshot(&self) -> Vec<NodeRecord> {
        let records = read_lock(&self.records);
        self.order
            .iter()
            .filter_map(|id| records.get(id).cloned())
            .collect()
    }

    /// Ids of nodes currently in `status`, in topological order.
    pub fn ids_with_status(&self, status: NodeStatus) -> Vec<String> {
        let records = read_lock(&self.records);
        self.order
            .iter()
            .filter(|id| records.get(*id).is_some_and(|r| r.status == status))
            .cloned()
            .collect()
    }

    /// Move `node_id` to `next` and apply `update`, atomically.
    ///
    /// Rejected if the node does not exist or `next` is not reachable from
    /// the current status.
    pub(crate) fn transition(
        &self,
        node_id: &str,
        next: NodeStatus,
        update: impl FnOnce(&mut NodeRecord),
    ) -> Result<Transition, InvalidTransition> {
        let mut records = write_lock(&self.records);
        let Some(record) = records.get_mut(node_id) else {
            return Err(InvalidTransition { from: None, to: next });
        };
        let from = record.status;
        if !from.can_transition_to(next) {
            return Err(InvalidTransition {
                from: Some(from),
                to: next,
            });
        }
        record.status = next;
        update(record);
        Ok(Transition {
            from,
            record: record.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// WorkflowInstance
// ---------------------------------------------------------------------------

/// One submitted workflow and all of its runtime state.
#[derive(Debug)]
pub struct WorkflowInstance {
    id: Uuid,
    graph: Arc<Graph>,
    priority: Priority,
    timeout: Duration,
    variables: VariableStore,
    nodes: NodeTable,
    record: RwLock<WorkflowRecord>,
    cancel: CancellationToken,
    cancel_reason: Mutex<Option<CancelReason>>,
    diagnostics: Mutex<Vec<String>>,
    status_tx: watch::Sender<WorkflowStatus>,
}

impl WorkflowInstance {
    pub fn new(
        id: Uuid,
        graph: Arc<Graph>,
        inputs: Map<String, Value>,
        priority: Priority,
        timeout: Duration,
    ) -> Self {
        let variables = VariableStore::with_inputs(inputs);
        let record = WorkflowRecord {
            id,
            name: graph.name().to_string(),
            status: WorkflowStatus::Pending,
            mode: graph.mode(),
            priority,
            timeout_secs: Some(whole_secs_ceil(timeout)),
            variables: variables.to_json(),
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        let nodes = NodeTable::new(&graph);
        let (status_tx, _) = watch::channel(WorkflowStatus::Pending);

        Self {
            id,
            graph,
            priority,
            timeout,
            variables,
            nodes,
            record: RwLock::new(record),
            cancel: CancellationToken::new(),
            cancel_reason: Mutex::new(None),
            diagnostics: Mutex::new(Vec::new()),
            status_tx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn variables(&self) -> &VariableStore {
        &self.variables
    }

    pub fn nodes(&self) -> &NodeTable {
        &self.nodes
    }

    pub fn status(&self) -> WorkflowStatus {
        read_lock(&self.record).status
    }

    /// Token cancelled when the workflow is cancelled or times out.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_reason(&self) -> Option<CancelReason> {
        *mutex_lock(&self.cancel_reason)
    }

    /// The workflow record with the current variables.
    pub fn record(&self) -> WorkflowRecord {
        let mut record = read_lock(&self.record).clone();
        record.variables = self.variables.to_json();
        record
    }

    /// Receiver that observes `Running` and, once journaled, the terminal status.
    pub fn watch_status(&self) -> watch::Receiver<WorkflowStatus> {
        self.status_tx.subscribe()
    }

    pub fn add_diagnostic(&self, message: impl Into<String>) {
        mutex_lock(&self.diagnostics).push(message.into());
    }

    pub fn diagnostics(&self) -> Vec<String> {
        mutex_lock(&self.diagnostics).clone()
    }

    /// Consistent point-in-time copy of the workflow and its nodes.
    pub fn snapshot(&self) -> WorkflowSnapshot {
        let record = read_lock(&self.record);
        let nodes = self.nodes.snapshot();
        let diagnostics = self.diagnostics();
        WorkflowSnapshot::from_parts(record.clone(), nodes, diagnostics)
    }

    /// Record a cancellation request.
    ///
    /// Returns the workflow status observed when the request was accepted,
    /// or `None` if the workflow is already terminal or already cancelling.
    pub(crate) fn request_cancel(&self, reason: CancelReason) -> Option<WorkflowStatus> {
        let record = read_lock(&self.record);
        if record.status.is_terminal() {
            return None;
        }
        let mut current = mutex_lock(&self.cancel_reason);
        if current.is_some() {
            return None;
        }
        *current = Some(reason);
        self.cancel.cancel();
        Some(record.status)
    }

    /// `Pending -> Running`. Returns `false` if cancellation was requested
    /// while the workflow was queued.
    pub(crate) fn start(&self) -> bool {
        let mut record = write_lock(&self.record);
        if mutex_lock(&self.cancel_reason).is_some()
            || !record.status.can_transition_to(WorkflowStatus::Running)
        {
            return false;
        }
        record.status = WorkflowStatus::Running;
        record.started_at = Some(Utc::now());
        drop(record);
        self.status_tx.send_replace(WorkflowStatus::Running);
        true
    }

    /// Settle the workflow into its terminal status.
    ///
    /// `Cancelled` if cancellation was requested, else `Failed` if any node
    /// failed (or never settled), else `Completed`. Idempotent.
    pub(crate) fn finish(&self) -> WorkflowStatus {
        let mut record = write_lock(&self.record);
        if record.status.is_terminal() {
            return record.status;
        }

        let nodes = self.nodes.snapshot();
        let reason = self.cancel_reason();
        let failed: Vec<&NodeRecord> = nodes
            .iter()
            .filter(|n| matches!(n.status, NodeStatus::Failed | NodeStatus::Running))
            .collect();

        let (status, error) = if let Some(reason) = reason {
            (WorkflowStatus::Cancelled, Some(reason.to_string()))
        } else if let Some(first) = failed.first() {
            let detail = first.error.as_deref().unwrap_or("did not complete");
            let message = if failed.len() == 1 {
                format!("node '{}' failed: {detail}", first.node_id)
            } else {
                format!(
                    "{} nodes failed; first was '{}': {detail}",
                    failed.len(),
                    first.node_id
                )
            };
            (WorkflowStatus::Failed, Some(message))
        } else {
            (WorkflowStatus::Completed, None)
        };

        let results: Map<String, Value> = nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Completed)
            .map(|n| (n.node_id.clone(), n.result.clone().unwrap_or(Value::Null)))
            .collect();

        record.status = status;
        record.error = error;
        record.result = Some(Value::Object(results));
        record.completed_at = Some(Utc::now());
        record.variables = self.variables.to_json();
        status
    }

    /// Publish the settled status to `watch_status` receivers.
    ///
    /// Called once the terminal state has been journaled, so a waiter never
    /// observes a terminal status the store has not seen.
    pub(crate) fn notify_settled(&self) {
        let status = self.status();
        self.status_tx.send_replace(status);
    }

    /// Time from start (or creation, if never started) to completion.
    pub fn duration(&self) -> Duration {
        let record = read_lock(&self.record);
        let start = record.started_at.unwrap_or(record.created_at);
        let end = record.completed_at.unwrap_or_else(Utc::now);
        (end - start).to_std().unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// `duration` in seconds, rounded up so a sub-second timeout never reads as 0.
fn whole_secs_ceil(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}
