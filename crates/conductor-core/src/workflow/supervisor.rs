//! Workflow supervisor: the engine's public entry point.
//!
//! The supervisor owns every in-flight and recent workflow, admits queued
//! workflows into a bounded coordination pool by priority, enforces the
//! workflow-level timeout, and journals state through the `WorkflowStore`.
//!
//! The in-memory model is authoritative while a workflow is held; the store
//! is a write-behind journal used for audit and for `status` of evicted ids.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use conductor_types::config::EngineConfig;
use conductor_types::error::RepositoryError;
use conductor_types::event::EngineEvent;
use conductor_types::workflow::{
    CancelReason, Priority, WorkflowDefinition, WorkflowRecord, WorkflowSnapshot, WorkflowStatus,
};
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::{Semaphore, broadcast};
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::repository::workflow::WorkflowStore;

use super::capability::CapabilityResolver;
use super::coordinator::Coordinator;
use super::definition::{DefinitionError, build_graph, validate_definition};
use super::graph::{Graph, GraphError};
use super::instance::WorkflowInstance;
use super::pattern::{PatternError, PatternRegistry};
use super::retry::RetryPolicy;
use super::runner::NodeRunner;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("invalid graph: {0}")]
    InvalidGraph(#[from] GraphError),

    #[error("invalid definition: {0}")]
    Definition(#[from] DefinitionError),

    #[error("pattern error: {0}")]
    Pattern(#[from] PatternError),

    #[error("no pattern registry configured")]
    NoPatternRegistry,

    #[error("workflow not found: {0}")]
    NotFound(Uuid),

    #[error("store error: {0}")]
    Store(#[from] RepositoryError),
}

// ---------------------------------------------------------------------------
// Admission queue
// ---------------------------------------------------------------------------

/// Queue entry: higher priority first, then submission order.
#[derive(Debug, PartialEq, Eq)]
struct Queued {
    priority: Priority,
    seq: u64,
    id: Uuid,
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

struct Shared<S: WorkflowStore> {
    config: EngineConfig,
    store: Arc<S>,
    coordinator: Coordinator<S>,
    events: EventBus,
    workflows: DashMap<Uuid, Arc<WorkflowInstance>>,
    queue: Mutex<BinaryHeap<Queued>>,
    seq: AtomicU64,
    workflow_permits: Arc<Semaphore>,
}

/// Submits, tracks, and cancels workflows.
///
/// Generic over `S: WorkflowStore` for storage flexibility. Cloning is cheap
/// and clones share all state.
pub struct Supervisor<S: WorkflowStore> {
    shared: Arc<Shared<S>>,
    patterns: Option<Arc<dyn PatternRegistry>>,
}

impl<S: WorkflowStore> Clone for Supervisor<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            patterns: self.patterns.clone(),
        }
    }
}

impl<S: WorkflowStore + 'static> Supervisor<S> {
    pub fn new(config: EngineConfig, store: S, resolver: Arc<dyn CapabilityResolver>) -> Self {
        let store = Arc::new(store);
        let events = EventBus::new(config.event_capacity);
        let runner = NodeRunner::new(
            resolver,
            Arc::clone(&store),
            events.clone(),
            RetryPolicy::from(config.backoff),
            Duration::from_secs(config.default_node_timeout_secs),
        );
        let coordinator = Coordinator::new(Arc::new(runner), config.max_concurrent_nodes);
        let workflow_permits = Arc::new(Semaphore::new(config.max_concurrent_workflows.max(1)));

        Self {
            shared: Arc::new(Shared {
                config,
                store,
                coordinator,
                events,
                workflows: DashMap::new(),
                queue: Mutex::new(BinaryHeap::new()),
                seq: AtomicU64::new(0),
                workflow_permits,
            }),
            patterns: None,
        }
    }

    /// Attach a pattern registry for `submit_pattern`.
    pub fn with_patterns(mut self, registry: Arc<dyn PatternRegistry>) -> Self {
        self.patterns = Some(registry);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.shared.store
    }

    /// Receive every engine event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Queue `graph` for execution and return the new workflow id.
    ///
    /// `timeout` falls back to `default_workflow_timeout_secs`. The workflow
    /// is persisted as `Pending` before this returns.
    pub async fn submit(
        &self,
        graph: Graph,
        inputs: Map<String, Value>,
        priority: Priority,
        timeout: Option<Duration>,
    ) -> Result<Uuid, SupervisorError> {
        let shared = &self.shared;
        let id = Uuid::now_v7();
        let timeout =
            timeout.unwrap_or_else(|| Duration::from_secs(shared.config.default_workflow_timeout_secs));
        let workflow = Arc::new(WorkflowInstance::new(
            id,
            Arc::new(graph),
            inputs,
            priority,
            timeout,
        ));

        shared.store.save_workflow(&workflow.record()).await?;
        for node in workflow.nodes().snapshot() {
            shared.store.save_node(&id, &node).await?;
        }

        shared.workflows.insert(id, Arc::clone(&workflow));
        shared.events.publish(EngineEvent::WorkflowSubmitted {
            workflow_id: id,
            name: workflow.graph().name().to_string(),
        });
        tracing::info!(
            workflow_id = %id,
            name = workflow.graph().name(),
            mode = %workflow.graph().mode(),
            %priority,
            nodes = workflow.graph().len(),
            "workflow submitted"
        );

        let seq = shared.seq.fetch_add(1, Ordering::Relaxed);
        lock(&shared.queue).push(Queued { priority, seq, id });
        tokio::spawn(Shared::admit(Arc::clone(shared)));

        Ok(id)
    }

    /// Validate `def`, build its graph, and submit it with its own inputs,
    /// priority, and timeout.
    pub async fn submit_definition(&self, def: &WorkflowDefinition) -> Result<Uuid, SupervisorError> {
        validate_definition(def)?;
        let graph = build_graph(def)?;
        self.submit(
            graph,
            def.inputs.clone(),
            def.priority,
            def.timeout_secs.map(Duration::from_secs),
        )
        .await
    }

    /// Resolve a named pattern and submit it; `params` also seed the variables.
    pub async fn submit_pattern(
        &self,
        name: &str,
        params: Map<String, Value>,
        priority: Priority,
        timeout: Option<Duration>,
    ) -> Result<Uuid, SupervisorError> {
        let registry = self
            .patterns
            .as_ref()
            .ok_or(SupervisorError::NoPatternRegistry)?;
        let graph = registry.resolve(name, &params)?;
        self.submit(graph, params, priority, timeout).await
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Consistent snapshot of a workflow and its nodes.
    ///
    /// Workflows evicted from memory are loaded from the store.
    pub async fn status(&self, id: Uuid) -> Result<WorkflowSnapshot, SupervisorError> {
        if let Some(workflow) = self.get(id) {
            return Ok(workflow.snapshot());
        }

        let store = &self.shared.store;
        let record = store
            .load_workflow(&id)
            .await?
            .ok_or(SupervisorError::NotFound(id))?;
        let nodes = store.load_nodes(&id).await?;
        Ok(WorkflowSnapshot::from_parts(record, nodes, Vec::new()))
    }

    /// Records of every workflow held in memory, newest first.
    pub fn list(&self) -> Vec<WorkflowRecord> {
        let mut records: Vec<WorkflowRecord> = self
            .shared
            .workflows
            .iter()
            .map(|entry| entry.value().record())
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    /// Wait until the workflow reaches a terminal state and return its snapshot.
    pub async fn wait(&self, id: Uuid) -> Result<WorkflowSnapshot, SupervisorError> {
        let Some(workflow) = self.get(id) else {
            return self.status(id).await;
        };

        let mut status_rx = workflow.watch_status();
        if status_rx.wait_for(|status| status.is_terminal()).await.is_err() {
            tracing::debug!(workflow_id = %id, "status channel closed while waiting");
        }
        Ok(workflow.snapshot())
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    /// Cancel a workflow.
    ///
    /// Returns `false` if the workflow is unknown, already terminal, or
    /// already cancelling. A queued workflow is finalized immediately; a
    /// running one stops scheduling, cancels its pending nodes, and lets
    /// running nodes finish.
    pub async fn cancel(&self, id: Uuid) -> bool {
        let Some(workflow) = self.get(id) else {
            return false;
        };

        match workflow.request_cancel(CancelReason::Requested) {
            None => {
                tracing::debug!(workflow_id = %id, "cancel ignored");
                false
            }
            Some(WorkflowStatus::Pending) => {
                tracing::info!(workflow_id = %id, "queued workflow cancelled");
                self.shared
                    .coordinator
                    .runner()
                    .cancel_pending(&workflow)
                    .await;
                self.shared.settle(&workflow).await;
                true
            }
            Some(_) => {
                tracing::info!(workflow_id = %id, "workflow cancellation requested");
                true
            }
        }
    }

    fn get(&self, id: Uuid) -> Option<Arc<WorkflowInstance>> {
        self.shared
            .workflows
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
    }
}

impl<S: WorkflowStore + 'static> Shared<S> {
    /// Take one coordination slot, then run the highest-priority queued
    /// workflow. One admission task is spawned per submission.
    async fn admit(self: Arc<Self>) {
        let Ok(_permit) = Arc::clone(&self.workflow_permits).acquire_owned().await else {
            return;
        };
        let next = lock(&self.queue).pop();
        let Some(queued) = next else {
            return;
        };
        let Some(workflow) = self
            .workflows
            .get(&queued.id)
            .map(|entry| Arc::clone(entry.value()))
        else {
            return;
        };

        self.run_workflow(workflow).await;
        self.evict_history();
    }

    async fn run_workflow(&self, workflow: Arc<WorkflowInstance>) {
        let id = workflow.id();
        if !workflow.start() {
            tracing::debug!(workflow_id = %id, "workflow cancelled before start");
            return;
        }

        tracing::info!(workflow_id = %id, "workflow started");
        self.events.publish(EngineEvent::WorkflowStarted { workflow_id: id });
        self.persist_record(&workflow).await;

        let exec = self.coordinator.execute(Arc::clone(&workflow));
        tokio::pin!(exec);
        let timed_out = tokio::select! {
            _ = &mut exec => false,
            _ = tokio::time::sleep(workflow.timeout()) => true,
        };
        if timed_out {
            if workflow.request_cancel(CancelReason::TimeoutExceeded).is_some() {
                tracing::warn!(
                    workflow_id = %id,
                    timeout_ms = workflow.timeout().as_millis() as u64,
                    "workflow timeout exceeded, cancelling"
                );
            }
            exec.await;
        }

        self.settle(&workflow).await;
    }

    /// Settle the workflow's terminal status, journal it, and announce it.
    async fn settle(&self, workflow: &WorkflowInstance) {
        let id = workflow.id();
        let status = workflow.finish();
        self.persist_record(workflow).await;
        for node in workflow.nodes().snapshot() {
            if let Err(e) = self.store.save_node(&id, &node).await {
                tracing::warn!(workflow_id = %id, node_id = node.node_id.as_str(), error = %e, "failed to persist node");
            }
        }

        let duration_ms = workflow.duration().as_millis() as u64;
        self.events.publish(EngineEvent::WorkflowFinished {
            workflow_id: id,
            status,
            duration_ms,
        });
        tracing::info!(workflow_id = %id, %status, duration_ms, "workflow finished");
        workflow.notify_settled();
    }

    async fn persist_record(&self, workflow: &WorkflowInstance) {
        if let Err(e) = self.store.save_workflow(&workflow.record()).await {
            tracing::warn!(workflow_id = %workflow.id(), error = %e, "failed to persist workflow");
        }
    }

    /// Drop the oldest terminal workflows beyond `history_limit`.
    fn evict_history(&self) {
        let mut terminal: Vec<(Uuid, WorkflowRecord)> = self
            .workflows
            .iter()
            .filter(|entry| entry.value().status().is_terminal())
            .map(|entry| (*entry.key(), entry.value().record()))
            .collect();
        if terminal.len() <= self.config.history_limit {
            return;
        }

        terminal.sort_by(|a, b| a.1.completed_at.cmp(&b.1.completed_at));
        let excess = terminal.len() - self.config.history_limit;
        for (id, _) in terminal.into_iter().take(excess) {
            self.workflows.remove(&id);
            tracing::debug!(workflow_id = %id, "evicted workflow from memory");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryWorkflowStore;
    use crate::workflow::capability::CapabilityRegistry;
    use crate::workflow::graph::GraphBuilder;
    use crate::workflow::pattern::InMemoryPatternRegistry;
    use crate::workflow::testing::ScriptedCapability;
    use conductor_types::config::BackoffConfig;
    use conductor_types::workflow::{ExecutionMode, NodeSpec, NodeStatus};
    use serde_json::json;

    fn config() -> EngineConfig {
        EngineConfig {
            backoff: BackoffConfig { base_ms: 1, cap_ms: 5 },
            ..EngineConfig::default()
        }
    }

    fn supervisor_with(
        config: EngineConfig,
        capability: &ScriptedCapability,
    ) -> Supervisor<InMemoryWorkflowStore> {
        let registry = CapabilityRegistry::new();
        registry.register("script", capability.clone());
        Supervisor::new(config, InMemoryWorkflowStore::new(), Arc::new(registry))
    }

    fn supervisor(capability: &ScriptedCapability) -> Supervisor<InMemoryWorkflowStore> {
        supervisor_with(config(), capability)
    }

    fn ok(id: &str) -> NodeSpec {
        NodeSpec::agent(id, "script", "ok")
    }

    fn sleepy(id: &str, ms: u64) -> NodeSpec {
        NodeSpec::agent(id, "script", "sleep").with_parameter("ms", json!(ms))
    }

    async fn run(sup: &Supervisor<InMemoryWorkflowStore>, graph: Graph) -> WorkflowSnapshot {
        let id = sup
            .submit(graph, Map::new(), Priority::Normal, None)
            .await
            .unwrap();
        sup.wait(id).await.unwrap()
    }

    async fn wait_until_running(sup: &Supervisor<InMemoryWorkflowStore>, id: Uuid) {
        for _ in 0..200 {
            if sup.status(id).await.unwrap().status == WorkflowStatus::Running {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("workflow {id} never started");
    }

    fn assert_dependency_order(snapshot: &WorkflowSnapshot, graph: &Graph) {
        for node in graph.nodes() {
            let Some(started) = snapshot.node(&node.id).and_then(|n| n.started_at) else {
                continue;
            };
            for pred in graph.predecessors(&node.id) {
                let done = snapshot.node(pred).and_then(|n| n.completed_at).unwrap();
                assert!(done <= started, "{pred} completed after {} started", node.id);
            }
        }
    }

    // -----------------------------------------------------------------------
    // End-to-end scenarios
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn sequential_chain_completes_in_order() {
        let cap = ScriptedCapability::new();
        let sup = supervisor(&cap);
        let graph = GraphBuilder::new(ExecutionMode::Sequential)
            .add_node(ok("a"))
            .add_node(ok("b").after("a"))
            .add_node(ok("c").after("b"))
            .build()
            .unwrap();

        let snap = run(&sup, graph.clone()).await;

        assert_eq!(snap.status, WorkflowStatus::Completed);
        assert_eq!(snap.completed, 3);
        assert_eq!(snap.progress, 1.0);
        let a = snap.node("a").unwrap();
        let b = snap.node("b").unwrap();
        let c = snap.node("c").unwrap();
        assert!(a.completed_at.unwrap() <= b.started_at.unwrap());
        assert!(b.started_at.unwrap() <= c.started_at.unwrap());
        assert_dependency_order(&snap, &graph);
    }

    #[tokio::test]
    async fn parallel_sibling_survives_failure() {
        let cap = ScriptedCapability::new();
        let sup = supervisor(&cap);
        let graph = GraphBuilder::new(ExecutionMode::Parallel)
            .add_node(ok("a"))
            .add_node(NodeSpec::agent("b", "script", "fail").after("a"))
            .add_node(ok("c").after("a"))
            .build()
            .unwrap();

        let snap = run(&sup, graph).await;

        assert_eq!(snap.status, WorkflowStatus::Failed);
        assert_eq!(snap.node_status("b"), Some(NodeStatus::Failed));
        assert_eq!(snap.node_status("c"), Some(NodeStatus::Completed));
        assert!(snap.error.as_deref().unwrap().contains("'b'"));
    }

    #[tokio::test]
    async fn cyclic_graph_is_rejected_before_submit() {
        let result = GraphBuilder::new(ExecutionMode::Sequential)
            .add_node(ok("a"))
            .add_node(ok("b"))
            .add_edge("a", "b")
            .add_edge("b", "a")
            .build();
        assert!(matches!(result, Err(GraphError::Cycle(_))));
    }

    #[tokio::test]
    async fn pipeline_join_starts_after_both_levels() {
        let cap = ScriptedCapability::new();
        let sup = supervisor(&cap);
        let graph = GraphBuilder::new(ExecutionMode::Pipeline)
            .add_node(sleepy("a", 20))
            .add_node(sleepy("b", 40))
            .add_node(ok("c").after("a").after("b"))
            .build()
            .unwrap();

        let snap = run(&sup, graph).await;

        assert_eq!(snap.status, WorkflowStatus::Completed);
        let a_done = snap.node("a").unwrap().completed_at.unwrap();
        let b_done = snap.node("b").unwrap().completed_at.unwrap();
        let c_started = snap.node("c").unwrap().started_at.unwrap();
        assert!(c_started >= a_done.max(b_done));
    }

    #[tokio::test]
    async fn conditional_only_true_branch_runs() {
        let cap = ScriptedCapability::new();
        let sup = supervisor(&cap);
        let graph = GraphBuilder::new(ExecutionMode::Conditional)
            .add_node(
                NodeSpec::agent("a", "script", "emit")
                    .with_parameter("x", json!(1))
                    .with_output("x", "/x"),
            )
            .add_node(ok("b"))
            .add_node(ok("c"))
            .add_guarded_edge("a", "b", "x == 1")
            .add_guarded_edge("a", "c", "x == 0")
            .build()
            .unwrap();

        let snap = run(&sup, graph).await;

        assert_eq!(snap.status, WorkflowStatus::Completed);
        assert_eq!(snap.node_status("b"), Some(NodeStatus::Completed));
        assert_eq!(snap.node_status("c"), Some(NodeStatus::Pending));
        assert_eq!(cap.calls("c"), 0);
        let result = snap.result.unwrap();
        assert!(result.get("c").is_none());
        assert!(result.get("b").is_some());
    }

    #[tokio::test]
    async fn cancel_mid_run_lets_running_nodes_finish() {
        let cap = ScriptedCapability::new();
        let sup = supervisor(&cap);
        let graph = GraphBuilder::new(ExecutionMode::Parallel)
            .add_node(sleepy("r1", 150))
            .add_node(sleepy("r2", 150))
            .add_node(ok("p1").after("r1").after("r2"))
            .add_node(ok("p2").after("r1"))
            .add_node(ok("p3").after("r2"))
            .build()
            .unwrap();

        let id = sup
            .submit(graph, Map::new(), Priority::Normal, None)
            .await
            .unwrap();
        wait_until_running(&sup, id).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(sup.cancel(id).await);

        let snap = sup.wait(id).await.unwrap();
        assert_eq!(snap.status, WorkflowStatus::Cancelled);
        assert_eq!(snap.error.as_deref(), Some("cancelled by request"));
        for running in ["r1", "r2"] {
            assert_eq!(snap.node_status(running), Some(NodeStatus::Completed));
        }
        for pending in ["p1", "p2", "p3"] {
            assert_eq!(snap.node_status(pending), Some(NodeStatus::Cancelled));
            assert!(snap.node(pending).unwrap().started_at.is_none());
            assert_eq!(cap.calls(pending), 0);
        }
    }

    // -----------------------------------------------------------------------
    // Properties
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn retry_bound_is_max_retries_plus_one() {
        let cap = ScriptedCapability::new();
        let sup = supervisor(&cap);
        let graph = GraphBuilder::new(ExecutionMode::Sequential)
            .add_node(NodeSpec::agent("a", "script", "fail").with_max_retries(3))
            .build()
            .unwrap();

        let snap = run(&sup, graph).await;

        assert_eq!(snap.status, WorkflowStatus::Failed);
        assert_eq!(cap.calls("a"), 4);
        assert_eq!(snap.node("a").unwrap().retry_count, 3);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let cap = ScriptedCapability::new();
        let sup = supervisor(&cap);
        let graph = GraphBuilder::new(ExecutionMode::Sequential)
            .add_node(NodeSpec::agent("a", "script", "block").with_parameter("ms", json!(10_000)))
            .add_node(ok("b").after("a"))
            .build()
            .unwrap();

        let id = sup
            .submit(graph, Map::new(), Priority::Normal, None)
            .await
            .unwrap();
        wait_until_running(&sup, id).await;

        assert!(sup.cancel(id).await);
        assert!(!sup.cancel(id).await);
        let snap = sup.wait(id).await.unwrap();
        assert_eq!(snap.status, WorkflowStatus::Cancelled);
        assert_eq!(snap.node_status("a"), Some(NodeStatus::Cancelled));
        assert_eq!(snap.node_status("b"), Some(NodeStatus::Cancelled));

        assert!(!sup.cancel(id).await);
        assert_eq!(sup.status(id).await.unwrap().status, WorkflowStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_unknown_workflow_is_false() {
        let sup = supervisor(&ScriptedCapability::new());
        assert!(!sup.cancel(Uuid::now_v7()).await);
    }

    #[tokio::test]
    async fn dependency_order_holds_in_parallel_mode() {
        let cap = ScriptedCapability::new();
        let sup = supervisor(&cap);
        let graph = GraphBuilder::new(ExecutionMode::Parallel)
            .add_node(sleepy("a", 10))
            .add_node(sleepy("b", 5).after("a"))
            .add_node(sleepy("c", 15).after("a"))
            .add_node(ok("d").after("b").after("c"))
            .add_node(sleepy("e", 1))
            .build()
            .unwrap();

        let snap = run(&sup, graph.clone()).await;

        assert_eq!(snap.status, WorkflowStatus::Completed);
        assert_dependency_order(&snap, &graph);
    }

    #[tokio::test]
    async fn workflow_timeout_cancels_with_reason() {
        let cap = ScriptedCapability::new();
        let sup = supervisor(&cap);
        let graph = GraphBuilder::new(ExecutionMode::Sequential)
            .add_node(NodeSpec::agent("a", "script", "block").with_parameter("ms", json!(10_000)))
            .build()
            .unwrap();

        let id = sup
            .submit(graph, Map::new(), Priority::Normal, Some(Duration::from_millis(50)))
            .await
            .unwrap();
        let snap = sup.wait(id).await.unwrap();

        assert_eq!(snap.status, WorkflowStatus::Cancelled);
        assert_eq!(snap.error.as_deref(), Some("workflow timeout exceeded"));
        assert_eq!(snap.node_status("a"), Some(NodeStatus::Cancelled));
    }

    #[tokio::test]
    async fn higher_priority_is_admitted_first() {
        let cap = ScriptedCapability::new();
        let sup = supervisor_with(
            EngineConfig {
                max_concurrent_workflows: 1,
                ..config()
            },
            &cap,
        );
        let single = |id: &str, ms: u64| {
            GraphBuilder::new(ExecutionMode::Sequential)
                .add_node(sleepy(id, ms))
                .build()
                .unwrap()
        };

        let blocker = sup
            .submit(single("blocker", 100), Map::new(), Priority::Normal, None)
            .await
            .unwrap();
        wait_until_running(&sup, blocker).await;
        let low = sup
            .submit(single("low", 5), Map::new(), Priority::Low, None)
            .await
            .unwrap();
        let high = sup
            .submit(single("high", 5), Map::new(), Priority::Critical, None)
            .await
            .unwrap();

        let low = sup.wait(low).await.unwrap();
        let high = sup.wait(high).await.unwrap();
        assert!(high.started_at.unwrap() < low.started_at.unwrap());
    }

    #[tokio::test]
    async fn queued_workflow_cancels_immediately() {
        let cap = ScriptedCapability::new();
        let sup = supervisor_with(
            EngineConfig {
                max_concurrent_workflows: 1,
                ..config()
            },
            &cap,
        );
        let blocker_graph = GraphBuilder::new(ExecutionMode::Sequential)
            .add_node(sleepy("blocker", 100))
            .build()
            .unwrap();
        let queued_graph = GraphBuilder::new(ExecutionMode::Sequential)
            .add_node(ok("never"))
            .build()
            .unwrap();

        let blocker = sup
            .submit(blocker_graph, Map::new(), Priority::Normal, None)
            .await
            .unwrap();
        wait_until_running(&sup, blocker).await;
        let queued = sup
            .submit(queued_graph, Map::new(), Priority::Normal, None)
            .await
            .unwrap();

        assert!(sup.cancel(queued).await);
        let snap = sup.status(queued).await.unwrap();
        assert_eq!(snap.status, WorkflowStatus::Cancelled);
        assert_eq!(snap.node_status("never"), Some(NodeStatus::Cancelled));
        assert!(snap.started_at.is_none());

        sup.wait(blocker).await.unwrap();
        assert_eq!(cap.calls("never"), 0);
    }

    // -----------------------------------------------------------------------
    // Extras
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn variables_flow_between_nodes() {
        let cap = ScriptedCapability::new();
        let sup = supervisor(&cap);
        let graph = GraphBuilder::new(ExecutionMode::Sequential)
            .add_node(NodeSpec::agent("a", "script", "emit").with_parameter("region", json!("{{ region }}")))
            .add_node(
                NodeSpec::agent("b", "script", "emit")
                    .with_parameter("from_a", json!("{{ a_result }}"))
                    .after("a"),
            )
            .build()
            .unwrap();
        let mut inputs = Map::new();
        inputs.insert("region".to_string(), json!("eu"));

        let id = sup.submit(graph, inputs, Priority::Normal, None).await.unwrap();
        let snap = sup.wait(id).await.unwrap();

        assert_eq!(snap.status, WorkflowStatus::Completed);
        let b = snap.node("b").unwrap().result.clone().unwrap();
        assert_eq!(b["from_a"], json!({ "region": "eu" }));
    }

    #[tokio::test]
    async fn empty_graph_completes_immediately() {
        let sup = supervisor(&ScriptedCapability::new());
        let graph = GraphBuilder::new(ExecutionMode::Parallel).build().unwrap();
        let snap = run(&sup, graph).await;
        assert_eq!(snap.status, WorkflowStatus::Completed);
        assert_eq!(snap.total, 0);
        assert_eq!(snap.progress, 1.0);
    }

    #[tokio::test]
    async fn events_follow_lifecycle() {
        let cap = ScriptedCapability::new();
        let sup = supervisor(&cap);
        let mut events = sup.subscribe();
        let graph = GraphBuilder::new(ExecutionMode::Sequential)
            .add_node(ok("a"))
            .build()
            .unwrap();

        let snap = run(&sup, graph).await;

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.workflow_id(), snap.id);
            kinds.push(match event {
                EngineEvent::WorkflowSubmitted { .. } => "submitted",
                EngineEvent::WorkflowStarted { .. } => "started",
                EngineEvent::NodeTransition { .. } => "node",
                EngineEvent::NodeRetryScheduled { .. } => "retry",
                EngineEvent::WorkflowFinished { status, .. } => {
                    assert_eq!(status, WorkflowStatus::Completed);
                    "finished"
                }
            });
        }
        assert_eq!(kinds, vec!["submitted", "started", "node", "node", "finished"]);
    }

    #[tokio::test]
    async fn store_receives_final_state_and_backs_evicted_status() {
        let cap = ScriptedCapability::new();
        let sup = supervisor_with(
            EngineConfig {
                history_limit: 1,
                ..config()
            },
            &cap,
        );
        let graph = || {
            GraphBuilder::new(ExecutionMode::Sequential)
                .add_node(ok("a"))
                .build()
                .unwrap()
        };

        let first = run(&sup, graph()).await.id;
        let second = run(&sup, graph()).await.id;
        // Eviction runs after the admission task finishes.
        for _ in 0..100 {
            if sup.list().len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let listed: Vec<Uuid> = sup.list().into_iter().map(|r| r.id).collect();
        assert_eq!(listed, vec![second]);

        let stored = sup.store().load_workflow(&first).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkflowStatus::Completed);
        let snap = sup.status(first).await.unwrap();
        assert_eq!(snap.status, WorkflowStatus::Completed);
        assert_eq!(snap.node_status("a"), Some(NodeStatus::Completed));

        assert!(matches!(
            sup.status(Uuid::now_v7()).await,
            Err(SupervisorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn submit_definition_and_pattern() {
        let cap = ScriptedCapability::new();
        let def = WorkflowDefinition {
            name: "greet".to_string(),
            description: None,
            mode: ExecutionMode::Sequential,
            priority: Priority::High,
            timeout_secs: Some(30),
            inputs: Map::new(),
            nodes: vec![NodeSpec::agent("hello", "script", "emit").with_parameter("who", json!("{{ who }}"))],
            edges: Vec::new(),
        };
        let patterns = InMemoryPatternRegistry::new();
        patterns.register(def.clone());
        let sup = supervisor(&cap).with_patterns(Arc::new(patterns));

        let id = sup.submit_definition(&def).await.unwrap();
        let snap = sup.wait(id).await.unwrap();
        assert_eq!(snap.name, "greet");
        assert_eq!(snap.priority, Priority::High);

        let mut params = Map::new();
        params.insert("who".to_string(), json!("world"));
        let id = sup
            .submit_pattern("greet", params, Priority::Normal, None)
            .await
            .unwrap();
        let snap = sup.wait(id).await.unwrap();
        assert_eq!(snap.node("hello").unwrap().result, Some(json!({ "who": "world" })));

        assert!(matches!(
            sup.submit_pattern("nope", Map::new(), Priority::Normal, None).await,
            Err(SupervisorError::Pattern(PatternError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn submit_pattern_without_registry_fails() {
        let sup = supervisor(&ScriptedCapability::new());
        assert!(matches!(
            sup.submit_pattern("any", Map::new(), Priority::Normal, None).await,
            Err(SupervisorError::NoPatternRegistry)
        ));
    }
}
