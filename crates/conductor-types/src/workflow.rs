//! Workflow domain types for Conductor.
//!
//! Defines the definition-side IR (`WorkflowDefinition`, `NodeSpec`,
//! `EdgeSpec`) that YAML files, pattern templates, and the programmatic
//! builder all produce, plus the runtime records (`WorkflowRecord`,
//! `NodeRecord`, `WorkflowSnapshot`) that the engine mutates and persists.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// The kind of a workflow node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Invokes an external capability.
    #[default]
    Agent,
    /// Evaluates its guard list; the result is a boolean.
    Condition,
    /// Structural fan-out marker.
    Parallel,
    /// Structural grouping marker.
    Sequential,
    /// Collects the results of all predecessors.
    Merge,
    /// Structural fan-out marker carrying a payload.
    Split,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeKind::Agent => "agent",
            NodeKind::Condition => "condition",
            NodeKind::Parallel => "parallel",
            NodeKind::Sequential => "sequential",
            NodeKind::Merge => "merge",
            NodeKind::Split => "split",
        };
        f.write_str(s)
    }
}

/// Scheduling discipline used by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One node at a time in topological order.
    #[default]
    Sequential,
    /// Readiness-driven execution on a bounded pool.
    Parallel,
    /// Level-by-level execution with a barrier between levels.
    Pipeline,
    /// Depth-first traversal following edges whose guards hold.
    Conditional,
}

/// Admission priority for the coordination pool. Higher runs first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionMode::Sequential => "sequential",
            ExecutionMode::Parallel => "parallel",
            ExecutionMode::Pipeline => "pipeline",
            ExecutionMode::Conditional => "conditional",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Node state machine
// ---------------------------------------------------------------------------

/// Status of a single node.
///
/// ```text
/// Pending -> Running -> Completed
///                    -> Failed -> Pending   (retry)
/// Pending | Running  -> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl NodeStatus {
    /// Whether `self -> next` is an edge of the node state machine.
    pub fn can_transition_to(self, next: NodeStatus) -> bool {
        use NodeStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Failed, Pending)
                | (Pending, Cancelled)
                | (Running, Cancelled)
        )
    }

    /// `Completed`, `Failed`, or `Cancelled`.
    ///
    /// A `Failed` node with retries left moves back to `Pending` once the
    /// failed attempt has been journaled, so `Status` may briefly report a
    /// `Failed` node that will still be retried.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
            NodeStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn can_transition_to(self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a workflow was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// `Supervisor::cancel` was called.
    Requested,
    /// The workflow-level timeout elapsed while running.
    TimeoutExceeded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Requested => f.write_str("cancelled by request"),
            CancelReason::TimeoutExceeded => f.write_str("workflow timeout exceeded"),
        }
    }
}

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

/// Reference to an externally provided capability: which agent, which method.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CapabilityRef {
    pub agent: String,
    pub method: String,
}

impl CapabilityRef {
    pub fn new(agent: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            method: method.into(),
        }
    }
}

impl fmt::Display for CapabilityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.agent, self.method)
    }
}

/// A node as declared in a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Unique within a graph.
    pub id: String,
    #[serde(default)]
    pub kind: NodeKind,
    /// Required for `kind = agent`, ignored otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<CapabilityRef>,
    /// Passed to the capability after `{{ key }}` substitution.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    /// JEXL expressions over workflow variables; all must hold.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub guard_conditions: Vec<String>,
    /// Shorthand for unguarded edges from each listed node into this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_retries: u32,
    /// Variable name -> JSON pointer into the result (`""` is the whole result).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            capability: None,
            parameters: Map::new(),
            guard_conditions: Vec::new(),
            depends_on: Vec::new(),
            timeout_secs: None,
            max_retries: 0,
            outputs: BTreeMap::new(),
        }
    }

    /// An agent node bound to `agent.method`.
    pub fn agent(id: impl Into<String>, agent: &str, method: &str) -> Self {
        let mut node = Self::new(id, NodeKind::Agent);
        node.capability = Some(CapabilityRef::new(agent, method));
        node
    }

    /// A condition node whose result is the conjunction of `guards`.
    pub fn condition<I, S>(id: impl Into<String>, guards: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut node = Self::new(id, NodeKind::Condition);
        node.guard_conditions = guards.into_iter().map(Into::into).collect();
        node
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_guard(mut self, guard: impl Into<String>) -> Self {
        self.guard_conditions.push(guard.into());
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_output(mut self, variable: impl Into<String>, pointer: impl Into<String>) -> Self {
        self.outputs.insert(variable.into(), pointer.into());
        self
    }

    pub fn after(mut self, dependency: impl Into<String>) -> Self {
        self.depends_on.push(dependency.into());
        self
    }
}

/// A directed edge `from -> to`, optionally guarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,
}

impl EdgeSpec {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            guard: None,
        }
    }

    pub fn guarded(from: impl Into<String>, to: impl Into<String>, guard: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            guard: Some(guard.into()),
        }
    }
}

/// The canonical workflow definition.
///
/// YAML files, pattern templates, and the programmatic builder all convert
/// to this struct before a graph is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub priority: Priority,
    /// Workflow-level timeout (overrides the engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Initial contents of the variable store.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub inputs: Map<String, Value>,
    pub nodes: Vec<NodeSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edges: Vec<EdgeSpec>,
}

// ---------------------------------------------------------------------------
// Runtime records
// ---------------------------------------------------------------------------

/// Runtime state of one node within one workflow run. Retained for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: String,
    pub kind: NodeKind,
    pub status: NodeStatus,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl NodeRecord {
    /// A fresh record as created when the graph is instantiated for a run.
    pub fn pending(node_id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            node_id: node_id.into(),
            kind,
            status: NodeStatus::Pending,
            retry_count: 0,
            result: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Persisted workflow record (the store's view of a workflow).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    /// UUIDv7 workflow ID.
    pub id: Uuid,
    pub name: String,
    pub status: WorkflowStatus,
    pub mode: ExecutionMode,
    pub priority: Priority,
    /// Workflow timeout, rounded up to whole seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Variable store contents at the time of the last save.
    pub variables: Value,
    /// Results of the completed nodes, keyed by node id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Point-in-time copy of a workflow and its nodes, returned by `Status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub id: Uuid,
    pub name: String,
    pub status: WorkflowStatus,
    pub mode: ExecutionMode,
    pub priority: Priority,
    /// Per-node records in topological order.
    pub nodes: Vec<NodeRecord>,
    pub completed: usize,
    pub total: usize,
    /// `completed / total`, in `[0, 1]`.
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Non-fatal problems recorded during the run (e.g. malformed edge guards).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowSnapshot {
    /// Assemble a snapshot from a record and its node records.
    pub fn from_parts(record: WorkflowRecord, nodes: Vec<NodeRecord>, diagnostics: Vec<String>) -> Self {
        let total = nodes.len();
        let completed = nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Completed)
            .count();
        let progress = if total == 0 {
            // Nothing to run: done once the workflow has completed.
            if record.status == WorkflowStatus::Completed { 1.0 } else { 0.0 }
        } else {
            completed as f64 / total as f64
        };
        Self {
            id: record.id,
            name: record.name,
            status: record.status,
            mode: record.mode,
            priority: record.priority,
            nodes,
            completed,
            total,
            progress,
            result: record.result,
            error: record.error,
            diagnostics,
            created_at: record.created_at,
            started_at: record.started_at,
            completed_at: record.completed_at,
        }
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeRecord> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    /// Status of `node_id`, if the node exists.
    pub fn node_status(&self, node_id: &str) -> Option<NodeStatus> {
        self.node(node_id).map(|n| n.status)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
