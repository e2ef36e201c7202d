//! Execution coordinator: schedules a workflow's nodes by execution mode.
//!
//! - **Sequential**: topological order, one node at a time, stop on the
//!   first terminal failure.
//! - **Parallel**: readiness-driven. Ready nodes are spawned into a
//!   `JoinSet`; each completion recomputes readiness. A failure only starves
//!   its own downstream closure; independent branches run to completion.
//! - **Pipeline**: level by level with a barrier between levels; a level
//!   with a failed node stops the run.
//! - **Conditional**: depth-first from the roots, following only edges whose
//!   guard holds (or is absent). Each node runs at most once.
//!
//! Node executions from every workflow share one `Semaphore`, so the total
//! number of running capability invocations is bounded. The coordinator
//! never changes node status itself; it only asks the runner to run or
//! cancel nodes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use conductor_types::workflow::{ExecutionMode, NodeStatus};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::repository::workflow::WorkflowStore;

use super::expression::GuardEvaluator;
use super::graph::Graph;
use super::instance::WorkflowInstance;
use super::runner::{NodeOutcome, NodeRunner};

type NodeTasks = JoinSet<(String, NodeOutcome)>;

/// Drives workflows to completion on a shared node pool.
pub struct Coordinator<S: WorkflowStore> {
    runner: Arc<NodeRunner<S>>,
    node_permits: Arc<Semaphore>,
}

impl<S: WorkflowStore + 'static> Coordinator<S> {
    pub fn new(runner: Arc<NodeRunner<S>>, max_concurrent_nodes: usize) -> Self {
        Self {
            runner,
            node_permits: Arc::new(Semaphore::new(max_concurrent_nodes.max(1))),
        }
    }

    pub fn runner(&self) -> &Arc<NodeRunner<S>> {
        &self.runner
    }

    /// Run every schedulable node of `workflow` according to its mode.
    ///
    /// Returns once no node is running and no more can start. If the
    /// workflow was cancelled, every node still `Pending` is cancelled
    /// before returning.
    pub async fn execute(&self, workflow: Arc<WorkflowInstance>) {
        let mode = workflow.graph().mode();
        tracing::debug!(
            workflow_id = %workflow.id(),
            mode = %mode,
            nodes = workflow.graph().len(),
            "coordinating workflow"
        );

        match mode {
            ExecutionMode::Sequential => self.run_sequential(&workflow).await,
            ExecutionMode::Parallel => self.run_parallel(&workflow).await,
            ExecutionMode::Pipeline => self.run_pipeline(&workflow).await,
            ExecutionMode::Conditional => self.run_conditional(&workflow).await,
        }

        if workflow.is_cancel_requested() {
            let cancelled = self.runner.cancel_pending(&workflow).await;
            tracing::debug!(workflow_id = %workflow.id(), cancelled, "cancelled pending nodes");
        }
    }

    // -----------------------------------------------------------------------
    // Sequential
    // -----------------------------------------------------------------------

    async fn run_sequential(&self, workflow: &WorkflowInstance) {
        let graph = workflow.graph();
        for node_id in graph.topological_order() {
            if workflow.is_cancel_requested() {
                break;
            }
            if !predecessors_completed(workflow, node_id) {
                tracing::debug!(
                    workflow_id = %workflow.id(),
                    node_id,
                    "upstream did not complete, not scheduling"
                );
                continue;
            }

            match self.run_inline(workflow, node_id).await {
                NodeOutcome::Failed => {
                    tracing::debug!(workflow_id = %workflow.id(), node_id, "stopping sequential run after failure");
                    break;
                }
                NodeOutcome::Cancelled => break,
                NodeOutcome::Completed | NodeOutcome::Skipped => {}
            }
        }
    }

    // -----------------------------------------------------------------------
    // Parallel
    // -----------------------------------------------------------------------

    async fn run_parallel(&self, workflow: &Arc<WorkflowInstance>) {
        let mut tasks = NodeTasks::new();
        let mut dispatched: HashSet<String> = HashSet::new();
        let mut cancelling = false;

        self.dispatch_ready(workflow, &mut tasks, &mut dispatched);

        while let Some((node_id, outcome)) = self
            .next_finished(workflow, &mut tasks, &mut cancelling)
            .await
        {
            tracing::debug!(workflow_id = %workflow.id(), node_id = node_id.as_str(), ?outcome, "node finished");
            if outcome == NodeOutcome::Completed {
                self.dispatch_ready(workflow, &mut tasks, &mut dispatched);
            }
        }
    }

    /// Spawn every ready node that has not been dispatched yet.
    fn dispatch_ready(
        &self,
        workflow: &Arc<WorkflowInstance>,
        tasks: &mut NodeTasks,
        dispatched: &mut HashSet<String>,
    ) {
        if workflow.is_cancel_requested() {
            return;
        }
        let statuses = workflow.nodes().statuses();
        for node_id in workflow.graph().ready_nodes(&statuses) {
            if dispatched.insert(node_id.to_string()) {
                self.spawn_node(workflow, tasks, node_id.to_string());
            }
        }
    }

    // -----------------------------------------------------------------------
    // Pipeline
    // -----------------------------------------------------------------------

    async fn run_pipeline(&self, workflow: &Arc<WorkflowInstance>) {
        let graph = workflow.graph();
        let mut cancelling = false;

        for (level_idx, level) in graph.levels().into_iter().enumerate() {
            if workflow.is_cancel_requested() {
                break;
            }

            let mut tasks = NodeTasks::new();
            for node_id in &level {
                if predecessors_completed(workflow, node_id) {
                    self.spawn_node(workflow, &mut tasks, node_id.to_string());
                }
            }
            tracing::debug!(
                workflow_id = %workflow.id(),
                level = level_idx,
                nodes = tasks.len(),
                "processing level"
            );

            let mut level_failed = false;
            while let Some((_, outcome)) = self
                .next_finished(workflow, &mut tasks, &mut cancelling)
                .await
            {
                level_failed |= outcome == NodeOutcome::Failed;
            }

            if level_failed {
                tracing::debug!(
                    workflow_id = %workflow.id(),
                    level = level_idx,
                    "level failed, skipping remaining levels"
                );
                break;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Conditional
    // -----------------------------------------------------------------------

    async fn run_conditional(&self, workflow: &WorkflowInstance) {
        let graph = workflow.graph();
        let mut executed: HashMap<String, NodeOutcome> = HashMap::new();
        let mut activated: HashSet<String> = HashSet::new();
        let mut deferred: Vec<String> = Vec::new();

        let roots = graph.roots();
        activated.extend(roots.iter().map(|id| id.to_string()));
        let mut stack: Vec<String> = roots.iter().rev().map(|id| id.to_string()).collect();

        loop {
            if workflow.is_cancel_requested() {
                break;
            }

            let node_id = match stack.pop() {
                Some(id) => id,
                None => {
                    let unblocked = deferred
                        .iter()
                        .position(|id| join_state(graph, id, &executed, &activated) != JoinState::Blocked);
                    match unblocked {
                        Some(pos) => deferred.remove(pos),
                        None => break,
                    }
                }
            };
            if executed.contains_key(&node_id) {
                continue;
            }

            match join_state(graph, &node_id, &executed, &activated) {
                JoinState::Ready => {}
                JoinState::Blocked => {
                    if !deferred.contains(&node_id) {
                        deferred.push(node_id);
                    }
                    continue;
                }
                JoinState::Abandoned => {
                    tracing::debug!(
                        workflow_id = %workflow.id(),
                        node_id = node_id.as_str(),
                        "upstream failed, branch abandoned"
                    );
                    executed.insert(node_id, NodeOutcome::Skipped);
                    continue;
                }
            }

            let outcome = self.run_inline(workflow, &node_id).await;
            executed.insert(node_id.clone(), outcome);
            if outcome != NodeOutcome::Completed {
                continue;
            }

            let targets = self.fired_edges(workflow, &node_id);
            for target in targets.iter().rev() {
                activated.insert(target.clone());
                stack.push(target.clone());
            }
        }
    }

    /// Targets of `node_id`'s outgoing edges whose guard holds or is absent.
    ///
    /// Malformed guards count as false and are recorded as diagnostics.
    fn fired_edges(&self, workflow: &WorkflowInstance, node_id: &str) -> Vec<String> {
        let context = workflow.variables().to_expression_context();
        let evaluator = GuardEvaluator::new();
        let mut fired = Vec::new();

        for (target, guard) in workflow.graph().edges_from(node_id) {
            let holds = match guard {
                None => true,
                Some(expr) => match evaluator.evaluate_bool(expr, &context) {
                    Ok(holds) => holds,
                    Err(err) => {
                        let message = format!("edge '{node_id}' -> '{target}': {err}");
                        tracing::warn!(workflow_id = %workflow.id(), "{message}");
                        workflow.add_diagnostic(message);
                        false
                    }
                },
            };
            tracing::debug!(
                workflow_id = %workflow.id(),
                from = node_id,
                to = target,
                holds,
                "edge evaluated"
            );
            if holds {
                fired.push(target.to_string());
            }
        }
        fired
    }

    // -----------------------------------------------------------------------
    // Dispatch helpers
    // -----------------------------------------------------------------------

    /// Run a node on the current task, holding a pool permit.
    async fn run_inline(&self, workflow: &WorkflowInstance, node_id: &str) -> NodeOutcome {
        let Ok(_permit) = self.node_permits.acquire().await else {
            return NodeOutcome::Cancelled;
        };
        self.runner.run(workflow, node_id).await
    }

    /// Spawn a node task; the permit is acquired inside the task.
    fn spawn_node(&self, workflow: &Arc<WorkflowInstance>, tasks: &mut NodeTasks, node_id: String) {
        let runner = Arc::clone(&self.runner);
        let permits = Arc::clone(&self.node_permits);
        let workflow = Arc::clone(workflow);

        tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return (node_id, NodeOutcome::Cancelled);
            };
            let outcome = runner.run(&workflow, &node_id).await;
            (node_id, outcome)
        });
    }

    /// Wait for the next node task to finish.
    ///
    /// While waiting, a cancellation request cancels every `Pending` node
    /// (running nodes finish on their own). Returns `None` once the set is
    /// empty.
    async fn next_finished(
        &self,
        workflow: &WorkflowInstance,
        tasks: &mut NodeTasks,
        cancelling: &mut bool,
    ) -> Option<(String, NodeOutcome)> {
        loop {
            let joined = tokio::select! {
                _ = workflow.cancel_token().cancelled(), if !*cancelling => None,
                joined = tasks.join_next() => Some(joined),
            };

            match joined {
                None => {
                    *cancelling = true;
                    let cancelled = self.runner.cancel_pending(workflow).await;
                    tracing::debug!(workflow_id = %workflow.id(), cancelled, "cancellation observed");
                }
                Some(None) => return None,
                Some(Some(Ok(finished))) => return Some(finished),
                Some(Some(Err(err))) => {
                    tracing::error!(workflow_id = %workflow.id(), error = %err, "node task panicked");
                    workflow.add_diagnostic(format!("node task failed: {err}"));
                }
            }
        }
    }
}

fn predecessors_completed(workflow: &WorkflowInstance, node_id: &str) -> bool {
    workflow
        .graph()
        .predecessors(node_id)
        .into_iter()
        .all(|pred| workflow.nodes().status(pred) == Some(NodeStatus::Completed))
}

// ---------------------------------------------------------------------------
// Conditional join rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinState {
    /// Every predecessor is settled and all that ran completed.
    Ready,
    /// Some predecessor may still run.
    Blocked,
    /// Some predecessor can never complete.
    Abandoned,
}

/// What can still happen to a node that has not executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Liveness {
    /// Never activated and every predecessor settled: the branch was not taken.
    Dead,
    /// Downstream of a node that failed, was cancelled, or was skipped.
    Poisoned,
    /// May still be activated.
    Live,
}

/// Whether a node reached by a fired edge may run yet.
///
/// A predecessor is settled once it has completed, or once it is dead.
/// Any predecessor that ended without completing, directly or further
/// upstream, abandons the join.
fn join_state(
    graph: &Graph,
    node_id: &str,
    executed: &HashMap<String, NodeOutcome>,
    activated: &HashSet<String>,
) -> JoinState {
    let mut memo: HashMap<String, Liveness> = HashMap::new();
    let mut state = JoinState::Ready;
    for pred in graph.predecessors(node_id) {
        match executed.get(pred) {
            Some(NodeOutcome::Completed) => {}
            Some(_) => return JoinState::Abandoned,
            None if activated.contains(pred) => state = JoinState::Blocked,
            None => match liveness(graph, pred, executed, activated, &mut memo) {
                Liveness::Dead => {}
                Liveness::Poisoned => return JoinState::Abandoned,
                Liveness::Live => state = JoinState::Blocked,
            },
        }
    }
    state
}

/// Liveness of a node absent from `executed`.
fn liveness(
    graph: &Graph,
    node_id: &str,
    executed: &HashMap<String, NodeOutcome>,
    activated: &HashSet<String>,
    memo: &mut HashMap<String, Liveness>,
) -> Liveness {
    if let Some(&known) = memo.get(node_id) {
        return known;
    }
    let mut result = if activated.contains(node_id) {
        Liveness::Live
    } else {
        Liveness::Dead
    };
    for pred in graph.predecessors(node_id) {
        let upstream = match executed.get(pred) {
            Some(NodeOutcome::Completed) => Liveness::Dead,
            Some(_) => Liveness::Poisoned,
            None => liveness(graph, pred, executed, activated, memo),
        };
        match upstream {
            Liveness::Poisoned => {
                result = Liveness::Poisoned;
                break;
            }
            Liveness::Live => result = Liveness::Live,
            Liveness::Dead => {}
        }
    }
    memo.insert(node_id.to_string(), result);
    result
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
