//! Workflow engine core for Conductor.
//!
//! This crate defines the engine (graph model, node runner, coordinator,
//! supervisor) and the "ports" it consumes: the `WorkflowStore` repository
//! trait, the `Capability` / `CapabilityResolver` traits, and the
//! `PatternRegistry` trait. It depends only on `conductor-types` -- never on
//! `conductor-infra` or any database/IO crate.

pub mod event;
pub mod repository;
pub mod workflow;
