//! Scripted capability shared by the engine tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{Map, Value, json};

use super::capability::{Capability, CapabilityError, Invocation};

/// Methods:
/// - `ok`: returns `{ "node": <id>, "params": <params> }`
/// - `fail`: always errors
/// - `flaky`: errors while the node's call count is `<= params.fail_times`
/// - `sleep`: sleeps `params.ms` milliseconds, then behaves like `ok`
/// - `block`: like `sleep`, but returns `Cancelled` once the workflow is cancelled
/// - `emit`: returns its params unchanged
#[derive(Clone, Default)]
pub(crate) struct ScriptedCapability {
    calls: Arc<DashMap<String, AtomicU32>>,
}

impl ScriptedCapability {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// How many times the capability ran for `node_id`.
    pub(crate) fn calls(&self, node_id: &str) -> u32 {
        self.calls
            .get(node_id)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub(crate) fn total_calls(&self) -> u32 {
        self.calls.iter().map(|c| c.load(Ordering::SeqCst)).sum()
    }

    fn record_call(&self, node_id: &str) -> u32 {
        self.calls
            .entry(node_id.to_string())
            .or_default()
            .fetch_add(1, Ordering::SeqCst)
            + 1
    }
}

impl Capability for ScriptedCapability {
    async fn invoke(
        &self,
        invocation: &Invocation,
        method: &str,
        params: Map<String, Value>,
    ) -> Result<Value, CapabilityError> {
        let call = self.record_call(&invocation.node_id);
        match method {
            "ok" => Ok(json!({ "node": invocation.node_id, "params": params })),
            "fail" => Err(CapabilityError::Failed("scripted failure".into())),
            "flaky" => {
                let fail_times = params.get("fail_times").and_then(Value::as_u64).unwrap_or(0);
                if u64::from(call) <= fail_times {
                    Err(CapabilityError::Failed(format!("flaky failure #{call}")))
                } else {
                    Ok(json!({ "node": invocation.node_id, "attempt": invocation.attempt }))
                }
            }
            "sleep" => {
                let ms = params.get("ms").and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!({ "node": invocation.node_id, "params": params }))
            }
            "block" => {
                let ms = params.get("ms").and_then(Value::as_u64).unwrap_or(0);
                tokio::select! {
                    _ = invocation.cancel.cancelled() => Err(CapabilityError::Cancelled),
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                        Ok(json!({ "node": invocation.node_id }))
                    }
                }
            }
            "emit" => Ok(Value::Object(params)),
            other => Err(CapabilityError::Failed(format!("unknown method {other}"))),
        }
    }
}
