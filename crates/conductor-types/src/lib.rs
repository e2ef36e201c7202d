//! Shared domain types for Conductor.
//!
//! This crate contains the types every other crate speaks: node and edge
//! definitions, workflow and node records, the node/workflow state machines,
//! engine events, engine configuration, and the repository error type.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod workflow;
