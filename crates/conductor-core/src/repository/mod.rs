//! Repository trait definitions (ports).
//!
//! The engine journals workflow and node state through `WorkflowStore`.
//! `conductor-infra` provides the SQLite implementation; `memory` holds an
//! in-process implementation for embedding and tests.

pub mod memory;
pub mod workflow;

pub use memory::InMemoryWorkflowStore;
pub use workflow::WorkflowStore;
