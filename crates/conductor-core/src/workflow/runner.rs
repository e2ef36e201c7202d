//! Node runner: drives one node through its state machine.
//!
//! The runner is the only component that changes node status. For each
//! attempt it moves the node `Pending -> Running`, dispatches to the node's
//! handler, and then either completes it, schedules a retry
//! (`Running -> Failed -> Pending` plus backoff), or fails it terminally.
//!
//! Every transition is persisted through the `WorkflowStore` (write-behind:
//! failures are logged, never fatal) and published on the `EventBus`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use conductor_types::event::EngineEvent;
use conductor_types::workflow::{NodeKind, NodeSpec, NodeStatus};
use serde_json::Value;

use crate::event::bus::EventBus;
use crate::repository::workflow::WorkflowStore;

use super::capability::CapabilityResolver;
use super::expression::evaluate_guards;
use super::handler::{NodeContext, NodeError, NodeHandler};
use super::instance::{Transition, WorkflowInstance};
use super::retry::RetryPolicy;
use super::variables::result_key;

/// How a single `run` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOutcome {
    Completed,
    /// Terminally failed (retries exhausted or non-retryable error).
    Failed,
    Cancelled,
    /// The node's guards did not hold; it was never started and stays `Pending`.
    Skipped,
}

/// Executes nodes on behalf of the coordinator.
///
/// Generic over `S: WorkflowStore` for storage flexibility.
pub struct NodeRunner<S: WorkflowStore> {
    resolver: Arc<dyn CapabilityResolver>,
    store: Arc<S>,
    events: EventBus,
    retry: RetryPolicy,
    default_timeout: Duration,
}

impl<S: WorkflowStore + 'static> NodeRunner<S> {
    pub fn new(
        resolver: Arc<dyn CapabilityResolver>,
        store: Arc<S>,
        events: EventBus,
        retry: RetryPolicy,
        default_timeout: Duration,
    ) -> Self {
        Self {
            resolver,
            store,
            events,
            retry,
            default_timeout,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Run `node_id` until it reaches a terminal status (or is skipped).
    pub async fn run(&self, workflow: &WorkflowInstance, node_id: &str) -> NodeOutcome {
        let Some(spec) = workflow.graph().node(node_id) else {
            tracing::warn!(workflow_id = %workflow.id(), node_id, "run requested for unknown node");
            return NodeOutcome::Failed;
        };

        if spec.kind != NodeKind::Condition && !spec.guard_conditions.is_empty() {
            let context = workflow.variables().to_expression_context();
            match evaluate_guards(&spec.guard_conditions, &context) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(
                        workflow_id = %workflow.id(),
                        node_id,
                        "node guards did not hold, skipping"
                    );
                    return NodeOutcome::Skipped;
                }
                Err(err) => {
                    if self.begin_attempt(workflow, spec).await.is_none() {
                        return NodeOutcome::Cancelled;
                    }
                    self.fail(workflow, spec, &NodeError::from(err)).await;
                    return NodeOutcome::Failed;
                }
            }
        }

        let handler = NodeHandler::for_kind(spec.kind);
        let timeout = spec
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        loop {
            let Some(attempt) = self.begin_attempt(workflow, spec).await else {
                return NodeOutcome::Cancelled;
            };

            let ctx = NodeContext {
                workflow_id: workflow.id(),
                spec,
                graph: workflow.graph(),
                variables: workflow.variables(),
                resolver: self.resolver.as_ref(),
                timeout,
                attempt,
                cancel: workflow.cancel_token(),
            };

            let err = match handler.execute(&ctx).await {
                Ok(value) => {
                    return self.complete(workflow, spec, value).await;
                }
                Err(NodeError::Cancelled) => {
                    self.settle(workflow, spec, NodeStatus::Cancelled, Some("cancelled".into()))
                        .await;
                    return NodeOutcome::Cancelled;
                }
                Err(err) => err,
            };

            let retry_count = attempt - 1;
            let may_retry = spec.kind != NodeKind::Condition
                && err.is_retryable()
                && RetryPolicy::should_retry(retry_count, spec.max_retries);
            if !may_retry {
                self.fail(workflow, spec, &err).await;
                return NodeOutcome::Failed;
            }

            let delay = self.retry.backoff(retry_count);
            self.schedule_retry(workflow, spec, &err, delay).await;

            if workflow.is_cancel_requested() {
                self.cancel_node(workflow, &spec.id).await;
                return NodeOutcome::Cancelled;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = workflow.cancel_token().cancelled() => {}
            }
        }
    }

    /// Mark every `Pending` node of `workflow` as `Cancelled`.
    ///
    /// Returns the number of nodes cancelled. `Running` nodes are left to
    /// finish on their own.
    pub async fn cancel_pending(&self, workflow: &WorkflowInstance) -> usize {
        let mut cancelled = 0;
        for node_id in workflow.nodes().ids_with_status(NodeStatus::Pending) {
            if self.cancel_node(workflow, &node_id).await {
                cancelled += 1;
            }
        }
        cancelled
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// `Pending -> Running`, or `Pending -> Cancelled` if the workflow is
    /// cancelling. Returns the 1-based attempt number when the node starts.
    async fn begin_attempt(&self, workflow: &WorkflowInstance, spec: &NodeSpec) -> Option<u32> {
        if workflow.is_cancel_requested() {
            self.cancel_node(workflow, &spec.id).await;
            return None;
        }

        match workflow
            .nodes()
            .transition(&spec.id, NodeStatus::Running, |record| {
                record.started_at.get_or_insert_with(Utc::now);
                record.completed_at = None;
            }) {
            Ok(transition) => {
                let attempt = transition.record.retry_count + 1;
                self.report(workflow, transition).await;
                Some(attempt)
            }
            Err(err) => {
                tracing::debug!(
                    workflow_id = %workflow.id(),
                    node_id = spec.id.as_str(),
                    error = %err,
                    "node not startable"
                );
                None
            }
        }
    }

    /// Write the result (and output bindings) into the variable store, then
    /// mark the node `Completed`.
    async fn complete(&self, workflow: &WorkflowInstance, spec: &NodeSpec, value: Value) -> NodeOutcome {
        let variables = workflow.variables();
        for (variable, pointer) in &spec.outputs {
            match value.pointer(pointer) {
                Some(bound) => variables.set(variable.clone(), bound.clone()),
                None => {
                    let message = format!(
                        "node '{}': output '{variable}' pointer '{pointer}' not found in result",
                        spec.id
                    );
                    tracing::warn!(workflow_id = %workflow.id(), "{message}");
                    workflow.add_diagnostic(message);
                }
            }
        }
        variables.set(result_key(&spec.id), value.clone());

        match workflow
            .nodes()
            .transition(&spec.id, NodeStatus::Completed, |record| {
                record.result = Some(value);
                record.error = None;
                record.completed_at = Some(Utc::now());
            }) {
            Ok(transition) => {
                self.report(workflow, transition).await;
                NodeOutcome::Completed
            }
            Err(err) => {
                tracing::warn!(workflow_id = %workflow.id(), node_id = spec.id.as_str(), error = %err, "could not complete node");
                NodeOutcome::Failed
            }
        }
    }

    async fn fail(&self, workflow: &WorkflowInstance, spec: &NodeSpec, err: &NodeError) {
        tracing::warn!(
            workflow_id = %workflow.id(),
            node_id = spec.id.as_str(),
            error = %err,
            "node failed"
        );
        self.settle(workflow, spec, NodeStatus::Failed, Some(err.to_string()))
            .await;
    }

    /// `Running -> status` with `error` and a completion timestamp.
    async fn settle(
        &self,
        workflow: &WorkflowInstance,
        spec: &NodeSpec,
        status: NodeStatus,
        error: Option<String>,
    ) {
        let result = workflow.nodes().transition(&spec.id, status, |record| {
            record.error = error;
            record.completed_at = Some(Utc::now());
        });
        match result {
            Ok(transition) => self.report(workflow, transition).await,
            Err(err) => {
                tracing::warn!(workflow_id = %workflow.id(), node_id = spec.id.as_str(), error = %err, "could not settle node");
            }
        }
    }

    /// `Running -> Failed -> Pending` with `retry_count + 1`.
    async fn schedule_retry(
        &self,
        workflow: &WorkflowInstance,
        spec: &NodeSpec,
        err: &NodeError,
        delay: Duration,
    ) {
        let message = err.to_string();
        let nodes = workflow.nodes();

        let failed = nodes.transition(&spec.id, NodeStatus::Failed, |record| {
            record.error = Some(message.clone());
        });
        let Ok(failed) = failed else {
            return;
        };
        self.report(workflow, failed).await;

        let Ok(pending) = nodes.transition(&spec.id, NodeStatus::Pending, |record| {
            record.retry_count += 1;
        }) else {
            return;
        };
        let retry_count = pending.record.retry_count;
        self.report(workflow, pending).await;

        tracing::warn!(
            workflow_id = %workflow.id(),
            node_id = spec.id.as_str(),
            retry_count,
            max_retries = spec.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %message,
            "retrying node"
        );
        self.events.publish(EngineEvent::NodeRetryScheduled {
            workflow_id: workflow.id(),
            node_id: spec.id.clone(),
            retry_count,
            delay_ms: delay.as_millis() as u64,
            error: message,
        });
    }

    /// `Pending -> Cancelled`. Returns whether the transition happened.
    async fn cancel_node(&self, workflow: &WorkflowInstance, node_id: &str) -> bool {
        let result = workflow
            .nodes()
            .transition(node_id, NodeStatus::Cancelled, |record| {
                record.completed_at = Some(Utc::now());
            });
        match result {
            Ok(transition) => {
                self.report(workflow, transition).await;
                true
            }
            Err(_) => false,
        }
    }

    /// Persist and publish an applied transition.
    async fn report(&self, workflow: &WorkflowInstance, transition: Transition) {
        let Transition { from, record } = transition;
        let attempt = record.retry_count + 1;

        tracing::debug!(
            workflow_id = %workflow.id(),
            node_id = record.node_id.as_str(),
            from = from.as_str(),
            to = record.status.as_str(),
            attempt,
            "node transition"
        );

        if let Err(err) = self.store.save_node(&workflow.id(), &record).await {
            tracing::warn!(
                workflow_id = %workflow.id(),
                node_id = record.node_id.as_str(),
                error = %err,
                "failed to persist node record"
            );
        }

        self.events.publish(EngineEvent::NodeTransition {
            workflow_id: workflow.id(),
            node_id: record.node_id,
            from,
            to: record.status,
            attempt,
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryWorkflowStore;
    use crate::workflow::capability::CapabilityRegistry;
    use crate::workflow::graph::{Graph, GraphBuilder};
    use crate::workflow::testing::ScriptedCapability;
    use conductor_types::workflow::{CancelReason, ExecutionMode, Priority};
    use serde_json::{Map, json};
    use uuid::Uuid;

    struct Harness {
        runner: NodeRunner<InMemoryWorkflowStore>,
        store: Arc<InMemoryWorkflowStore>,
        capability: ScriptedCapability,
        events: EventBus,
    }

    fn harness() -> Harness {
        let capability = ScriptedCapability::new();
        let registry = CapabilityRegistry::new();
        registry.register("script", capability.clone());
        let store = Arc::new(InMemoryWorkflowStore::new());
        let events = EventBus::new(64);
        let runner = NodeRunner::new(
            Arc::new(registry),
            Arc::clone(&store),
            events.clone(),
            RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(4)),
            Duration::from_secs(5),
        );
        Harness {
            runner,
            store,
            capability,
            events,
        }
    }

    fn instance(graph: Graph) -> WorkflowInstance {
        WorkflowInstance::new(
            Uuid::now_v7(),
            Arc::new(graph),
            Map::new(),
            Priority::Normal,
            Duration::from_secs(60),
        )
    }

    fn single(node: NodeSpec) -> WorkflowInstance {
        instance(
            GraphBuilder::new(ExecutionMode::Sequential)
                .add_node(node)
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn completes_and_writes_result_before_signal() {
        let h = harness();
        let wf = single(
            NodeSpec::agent("n", "script", "emit")
                .with_parameter("x", json!(1))
                .with_output("x", "/x"),
        );

        let outcome = h.runner.run(&wf, "n").await;
        assert_eq!(outcome, NodeOutcome::Completed);

        let record = wf.nodes().get("n").unwrap();
        assert_eq!(record.status, NodeStatus::Completed);
        assert_eq!(record.result, Some(json!({ "x": 1 })));
        assert!(record.started_at.unwrap() <= record.completed_at.unwrap());
        assert_eq!(wf.variables().get("n_result"), Some(json!({ "x": 1 })));
        assert_eq!(wf.variables().get("x"), Some(json!(1)));

        let persisted = h.store.load_nodes(&wf.id()).await.unwrap();
        assert_eq!(persisted[0].status, NodeStatus::Completed);
    }

    #[tokio::test]
    async fn missing_output_pointer_is_diagnostic_only() {
        let h = harness();
        let wf = single(NodeSpec::agent("n", "script", "emit").with_output("y", "/nope"));
        assert_eq!(h.runner.run(&wf, "n").await, NodeOutcome::Completed);
        assert_eq!(wf.diagnostics().len(), 1);
        assert!(wf.variables().get("y").is_none());
    }

    #[tokio::test]
    async fn retry_bound_is_max_retries_plus_one() {
        let h = harness();
        let wf = single(NodeSpec::agent("n", "script", "fail").with_max_retries(2));

        assert_eq!(h.runner.run(&wf, "n").await, NodeOutcome::Failed);
        assert_eq!(h.capability.calls("n"), 3);

        let record = wf.nodes().get("n").unwrap();
        assert_eq!(record.status, NodeStatus::Failed);
        assert_eq!(record.retry_count, 2);
        assert!(record.error.unwrap().contains("scripted failure"));
    }

    #[tokio::test]
    async fn flaky_node_recovers_within_retries() {
        let h = harness();
        let wf = single(
            NodeSpec::agent("n", "script", "flaky")
                .with_parameter("fail_times", json!(2))
                .with_max_retries(3),
        );
        let mut rx = h.events.subscribe();

        assert_eq!(h.runner.run(&wf, "n").await, NodeOutcome::Completed);
        assert_eq!(h.capability.calls("n"), 3);
        assert_eq!(wf.nodes().get("n").unwrap().retry_count, 2);

        let mut retries = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, EngineEvent::NodeRetryScheduled { .. }) {
                retries += 1;
            }
        }
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn missing_capability_fails_without_retry() {
        let h = harness();
        let wf = single(NodeSpec::agent("n", "nobody", "ok").with_max_retries(5));

        assert_eq!(h.runner.run(&wf, "n").await, NodeOutcome::Failed);
        let record = wf.nodes().get("n").unwrap();
        assert_eq!(record.retry_count, 0);
        assert!(record.error.unwrap().contains("capability not found"));
    }

    #[tokio::test]
    async fn timeout_is_retried() {
        let h = harness();
        let wf = single(
            NodeSpec::agent("n", "script", "sleep")
                .with_parameter("ms", json!(5_000))
                .with_timeout_secs(0)
                .with_max_retries(1),
        );

        assert_eq!(h.runner.run(&wf, "n").await, NodeOutcome::Failed);
        assert_eq!(h.capability.calls("n"), 2);
        assert!(wf.nodes().get("n").unwrap().error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn condition_node_writes_boolean_and_never_retries() {
        let h = harness();
        let wf = instance(
            GraphBuilder::new(ExecutionMode::Sequential)
                .add_node(NodeSpec::condition("ok", ["1 == 1"]))
                .add_node(NodeSpec::condition("bad", ["((("]).with_max_retries(3))
                .build()
                .unwrap(),
        );

        assert_eq!(h.runner.run(&wf, "ok").await, NodeOutcome::Completed);
        assert_eq!(wf.variables().get("ok_result"), Some(json!(true)));

        assert_eq!(h.runner.run(&wf, "bad").await, NodeOutcome::Failed);
        assert_eq!(wf.nodes().get("bad").unwrap().retry_count, 0);
    }

    #[tokio::test]
    async fn false_guard_skips_without_starting() {
        let h = harness();
        let wf = single(NodeSpec::agent("n", "script", "ok").with_guard("enabled == true"));
        wf.variables().set("enabled", json!(false));

        assert_eq!(h.runner.run(&wf, "n").await, NodeOutcome::Skipped);
        assert_eq!(wf.nodes().status("n"), Some(NodeStatus::Pending));
        assert_eq!(h.capability.total_calls(), 0);
    }

    #[tokio::test]
    async fn malformed_guard_fails_node() {
        let h = harness();
        let wf = single(NodeSpec::agent("n", "script", "ok").with_guard("=== nope"));

        assert_eq!(h.runner.run(&wf, "n").await, NodeOutcome::Failed);
        assert_eq!(h.capability.total_calls(), 0);
        assert!(wf.nodes().get("n").unwrap().error.unwrap().contains("guard error"));
    }

    #[tokio::test]
    async fn cancelled_workflow_never_starts_node() {
        let h = harness();
        let wf = single(NodeSpec::agent("n", "script", "ok"));
        wf.request_cancel(CancelReason::Requested);

        assert_eq!(h.runner.run(&wf, "n").await, NodeOutcome::Cancelled);
        assert_eq!(wf.nodes().status("n"), Some(NodeStatus::Cancelled));
        assert_eq!(h.capability.total_calls(), 0);
    }

    #[tokio::test]
    async fn cancel_during_backoff_stops_retries() {
        let capability = ScriptedCapability::new();
        let registry = CapabilityRegistry::new();
        registry.register("script", capability.clone());
        let runner = NodeRunner::new(
            Arc::new(registry),
            Arc::new(InMemoryWorkflowStore::new()),
            EventBus::new(16),
            RetryPolicy::new(Duration::from_secs(30), Duration::from_secs(30)),
            Duration::from_secs(5),
        );
        let wf = Arc::new(single(NodeSpec::agent("n", "script", "fail").with_max_retries(5)));

        let task = {
            let wf = Arc::clone(&wf);
            tokio::spawn(async move { runner.run(&wf, "n").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        wf.request_cancel(CancelReason::Requested);

        let outcome = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, NodeOutcome::Cancelled);
        assert_eq!(capability.calls("n"), 1);
        assert_eq!(wf.nodes().status("n"), Some(NodeStatus::Cancelled));
    }

    #[tokio::test]
    async fn cancel_pending_leaves_other_states() {
        let h = harness();
        let wf = instance(
            GraphBuilder::new(ExecutionMode::Parallel)
                .add_node(NodeSpec::agent("done", "script", "ok"))
                .add_node(NodeSpec::agent("waiting", "script", "ok"))
                .build()
                .unwrap(),
        );
        h.runner.run(&wf, "done").await;

        assert_eq!(h.runner.cancel_pending(&wf).await, 1);
        assert_eq!(wf.nodes().status("done"), Some(NodeStatus::Completed));
        assert_eq!(wf.nodes().status("waiting"), Some(NodeStatus::Cancelled));
        // Second pass is a no-op.
        assert_eq!(h.runner.cancel_pending(&wf).await, 0);
    }
}
