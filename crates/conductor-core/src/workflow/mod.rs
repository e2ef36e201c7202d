//! Workflow engine: graph model, node execution, scheduling, and supervision.
//!
//! - `graph` -- DAG build/validation, topological order, levels, readiness
//! - `variables` -- per-run variable store and `{{ key }}` substitution
//! - `expression` -- JEXL guard evaluator
//! - `capability` -- capability port, boxed wrapper, and registry
//! - `handler` -- one handler per node kind
//! - `retry` -- exponential backoff policy
//! - `instance` -- runtime state of one workflow run
//! - `runner` -- node state machine (attempts, retries, persistence, events)
//! - `coordinator` -- the four scheduling disciplines
//! - `supervisor` -- submit/status/cancel, admission, timeouts, history
//! - `definition` -- YAML definitions, validation, graph construction
//! - `pattern` -- named template registry port

pub mod capability;
pub mod coordinator;
pub mod definition;
pub mod expression;
pub mod graph;
pub mod handler;
pub mod instance;
pub mod pattern;
pub mod retry;
pub mod runner;
pub mod supervisor;
pub mod variables;

#[cfg(test)]
pub(crate) mod testing;
