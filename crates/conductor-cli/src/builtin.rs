//! The `builtin` capability available to workflows run from the CLI.
//!
//! Methods:
//! - `echo`: returns its parameters unchanged
//! - `sleep`: waits `ms` milliseconds, stopping early on cancellation
//! - `fail`: always fails with `message`
//! - `fail_times`: fails the first `times` attempts of a node, then succeeds

use std::time::Duration;

use conductor_core::workflow::capability::{Capability, CapabilityError, Invocation};
use dashmap::DashMap;
use serde_json::{Map, Value, json};
use uuid::Uuid;

const METHODS: &[&str] = &["echo", "sleep", "fail", "fail_times"];

#[derive(Debug, Default)]
pub struct BuiltinCapability {
    /// Failures handed out so far per (workflow, node).
    failures: DashMap<(Uuid, String), u64>,
}

impl BuiltinCapability {
    pub fn new() -> Self {
        Self::default()
    }
}

fn u64_param(params: &Map<String, Value>, key: &str) -> Result<u64, CapabilityError> {
    match params.get(key) {
        None => Ok(0),
        Some(value) => value.as_u64().ok_or_else(|| {
            CapabilityError::InvalidParameters(format!("'{key}' must be a non-negative integer"))
        }),
    }
}

impl Capability for BuiltinCapability {
    fn supports(&self, method: &str) -> bool {
        METHODS.contains(&method)
    }

    async fn invoke(
        &self,
        invocation: &Invocation,
        method: &str,
        params: Map<String, Value>,
    ) -> Result<Value, CapabilityError> {
        match method {
            "echo" => Ok(Value::Object(params)),
            "sleep" => {
                let ms = u64_param(&params, "ms")?;
                tokio::select! {
                    _ = invocation.cancel.cancelled() => Err(CapabilityError::Cancelled),
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(json!({ "slept_ms": ms })),
                }
            }
            "fail" => {
                let message = params
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("builtin failure");
                Err(CapabilityError::Failed(message.to_string()))
            }
            "fail_times" => {
                let times = u64_param(&params, "times")?;
                let key = (invocation.workflow_id, invocation.node_id.clone());
                let mut failed = self.failures.entry(key).or_insert(0);
                if *failed < times {
                    *failed += 1;
                    Err(CapabilityError::Failed(format!(
                        "planned failure {} of {times}",
                        *failed
                    )))
                } else {
                    Ok(json!({ "attempt": invocation.attempt, "failures": *failed }))
                }
            }
            other => Err(CapabilityError::InvalidParameters(format!(
                "unknown builtin method '{other}'"
            ))),
        }
    }
}
