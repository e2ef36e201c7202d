//! Capability port: the external business logic an agent node invokes.
//!
//! The engine never knows what a capability does. It resolves a
//! `CapabilityRef` (agent id + method) through an injected
//! `CapabilityResolver` and calls `invoke` with the node's resolved
//! parameters.
//!
//! Dynamic dispatch follows the usual blanket-impl pattern:
//! 1. `Capability` uses native async fn in traits (RPITIT)
//! 2. The object-safe `CapabilityDyn` returns boxed futures and is
//!    blanket-implemented for every `T: Capability`
//! 3. `BoxCapability` wraps `Box<dyn CapabilityDyn>` and delegates

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use conductor_types::workflow::CapabilityRef;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors a capability reports back to the node runner.
///
/// Every variant except `Cancelled` is eligible for retry.
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("{0}")]
    Failed(String),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("invocation cancelled")]
    Cancelled,
}

// ---------------------------------------------------------------------------
// Invocation context
// ---------------------------------------------------------------------------

/// Per-invocation context handed to a capability.
///
/// `cancel` fires when the owning workflow is cancelled. Honoring it is
/// optional; the engine never preempts a running invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub workflow_id: Uuid,
    pub node_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub cancel: CancellationToken,
}

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// An invokable unit of business logic bound to agent nodes.
pub trait Capability: Send + Sync {
    /// Whether this capability implements `method`.
    ///
    /// Unsupported methods resolve as "not found", which is not retried.
    fn supports(&self, method: &str) -> bool {
        let _ = method;
        true
    }

    fn invoke(
        &self,
        invocation: &Invocation,
        method: &str,
        params: Map<String, Value>,
    ) -> impl Future<Output = Result<Value, CapabilityError>> + Send;
}

/// Object-safe version of [`Capability`] with boxed futures.
pub trait CapabilityDyn: Send + Sync {
    fn supports(&self, method: &str) -> bool;

    fn invoke_boxed<'a>(
        &'a self,
        invocation: &'a Invocation,
        method: &'a str,
        params: Map<String, Value>,
    ) -> Pin<Box<dyn Future<Output = Result<Value, CapabilityError>> + Send + 'a>>;
}

/// Blanket implementation: any `Capability` automatically implements `CapabilityDyn`.
impl<T: Capability> CapabilityDyn for T {
    fn supports(&self, method: &str) -> bool {
        Capability::supports(self, method)
    }

    fn invoke_boxed<'a>(
        &'a self,
        invocation: &'a Invocation,
        method: &'a str,
        params: Map<String, Value>,
    ) -> Pin<Box<dyn Future<Output = Result<Value, CapabilityError>> + Send + 'a>> {
        Box::pin(self.invoke(invocation, method, params))
    }
}

/// Type-erased capability for runtime registration.
pub struct BoxCapability {
    inner: Box<dyn CapabilityDyn>,
}

impl BoxCapability {
    pub fn new<T: Capability + 'static>(capability: T) -> Self {
        Self {
            inner: Box::new(capability),
        }
    }

    pub fn supports(&self, method: &str) -> bool {
        self.inner.supports(method)
    }

    pub async fn invoke(
        &self,
        invocation: &Invocation,
        method: &str,
        params: Map<String, Value>,
    ) -> Result<Value, CapabilityError> {
        self.inner.invoke_boxed(invocation, method, params).await
    }
}

impl std::fmt::Debug for BoxCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxCapability").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Maps a `CapabilityRef` to an invokable capability.
pub trait CapabilityResolver: Send + Sync {
    /// `None` means "not found", which fails the node without retry.
    fn resolve(&self, capability: &CapabilityRef) -> Option<Arc<BoxCapability>>;
}

/// Resolver backed by a concurrent map from agent id to capability.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    agents: DashMap<String, Arc<BoxCapability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the capability serving `agent`.
    pub fn register<T: Capability + 'static>(&self, agent: impl Into<String>, capability: T) {
        self.agents
            .insert(agent.into(), Arc::new(BoxCapability::new(capability)));
    }

    pub fn unregister(&self, agent: &str) -> bool {
        self.agents.remove(agent).is_some()
    }

    /// Registered agent ids, sorted.
    pub fn agents(&self) -> Vec<String> {
        let mut agents: Vec<String> = self.agents.iter().map(|e| e.key().clone()).collect();
        agents.sort();
        agents
    }
}

impl CapabilityResolver for CapabilityRegistry {
    fn resolve(&self, capability: &CapabilityRef) -> Option<Arc<BoxCapability>> {
        self.agents
            .get(&capability.agent)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|found| found.supports(&capability.method))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
