//! Node handlers: one concrete handler per node kind.
//!
//! `NodeHandler` dispatches a single attempt to the handler for the node's
//! `NodeKind`. Handlers only compute a result; status transitions, retries,
//! and variable writes belong to the node runner.

use std::time::Duration;

use conductor_types::workflow::{NodeKind, NodeSpec};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::capability::{CapabilityError, CapabilityResolver, Invocation};
use super::expression::{ExpressionError, evaluate_guards};
use super::graph::Graph;
use super::variables::{VariableStore, result_key};

// ---------------------------------------------------------------------------
// NodeError
// ---------------------------------------------------------------------------

/// Why a node attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("capability not found: {0}")]
    CapabilityNotFound(String),

    #[error("capability error: {0}")]
    Capability(String),

    #[error("guard error: {0}")]
    Guard(#[from] ExpressionError),

    #[error("cancelled")]
    Cancelled,
}

impl NodeError {
    /// Timeouts and capability-returned errors may be retried; missing
    /// capabilities, malformed guards, and cancellation may not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NodeError::Timeout(_) | NodeError::Capability(_))
    }
}

impl From<CapabilityError> for NodeError {
    fn from(err: CapabilityError) -> Self {
        match err {
            CapabilityError::Cancelled => NodeError::Cancelled,
            other => NodeError::Capability(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// NodeContext
// ---------------------------------------------------------------------------

/// Everything a handler may read during one attempt.
pub struct NodeContext<'a> {
    pub workflow_id: Uuid,
    pub spec: &'a NodeSpec,
    pub graph: &'a Graph,
    pub variables: &'a VariableStore,
    pub resolver: &'a dyn CapabilityResolver,
    pub timeout: Duration,
    /// 1-based attempt number.
    pub attempt: u32,
    pub cancel: &'a CancellationToken,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Invokes the node's capability with substituted parameters under a deadline.
#[derive(Debug, Clone, Copy, Default)]
pub struct AgentNode;

impl AgentNode {
    pub async fn execute(&self, ctx: &NodeContext<'_>) -> Result<Value, NodeError> {
        let capability_ref = ctx
            .spec
            .capability
            .as_ref()
            .ok_or_else(|| NodeError::CapabilityNotFound(format!("node '{}' has none", ctx.spec.id)))?;
        let capability = ctx
            .resolver
            .resolve(capability_ref)
            .ok_or_else(|| NodeError::CapabilityNotFound(capability_ref.to_string()))?;

        let params = ctx.variables.resolve_parameters(&ctx.spec.parameters);
        let invocation = Invocation {
            workflow_id: ctx.workflow_id,
            node_id: ctx.spec.id.clone(),
            attempt: ctx.attempt,
            cancel: ctx.cancel.clone(),
        };

        match tokio::time::timeout(
            ctx.timeout,
            capability.invoke(&invocation, &capability_ref.method, params),
        )
        .await
        {
            Ok(result) => result.map_err(NodeError::from),
            Err(_) => Err(NodeError::Timeout(ctx.timeout)),
        }
    }
}

/// Evaluates the guard list against a snapshot; the result is a boolean.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionNode;

impl ConditionNode {
    pub async fn execute(&self, ctx: &NodeContext<'_>) -> Result<Value, NodeError> {
        let context = ctx.variables.to_expression_context();
        let holds = evaluate_guards(&ctx.spec.guard_conditions, &context)?;
        Ok(Value::Bool(holds))
    }
}

/// Collects the results of every predecessor into one object.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeNode;

impl MergeNode {
    pub async fn execute(&self, ctx: &NodeContext<'_>) -> Result<Value, NodeError> {
        let merged: Map<String, Value> = ctx
            .graph
            .predecessors(&ctx.spec.id)
            .into_iter()
            .filter_map(|pred| {
                ctx.variables
                    .get(&result_key(pred))
                    .map(|value| (pred.to_string(), value))
            })
            .collect();
        Ok(Value::Object(merged))
    }
}

/// Structural markers (`Split`, `Parallel`, `Sequential`): the result is the
/// node's resolved parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThroughNode;

impl PassThroughNode {
    pub async fn execute(&self, ctx: &NodeContext<'_>) -> Result<Value, NodeError> {
        Ok(Value::Object(
            ctx.variables.resolve_parameters(&ctx.spec.parameters),
        ))
    }
}

/// Per-kind dispatch.
#[derive(Debug, Clone, Copy)]
pub enum NodeHandler {
    Agent(AgentNode),
    Condition(ConditionNode),
    Merge(MergeNode),
    PassThrough(PassThroughNode),
}

impl NodeHandler {
    pub fn for_kind(kind: NodeKind) -> Self {
        match kind {
            NodeKind::Agent => NodeHandler::Agent(AgentNode),
            NodeKind::Condition => NodeHandler::Condition(ConditionNode),
            NodeKind::Merge => NodeHandler::Merge(MergeNode),
            NodeKind::Split | NodeKind::Parallel | NodeKind::Sequential => {
                NodeHandler::PassThrough(PassThroughNode)
            }
        }
    }

    pub async fn execute(&self, ctx: &NodeContext<'_>) -> Result<Value, NodeError> {
        match self {
            NodeHandler::Agent(h) => h.execute(ctx).await,
            NodeHandler::Condition(h) => h.execute(ctx).await,
            NodeHandler::Merge(h) => h.execute(ctx).await,
            NodeHandler::PassThrough(h) => h.execute(ctx).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
