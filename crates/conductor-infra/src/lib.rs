//! Infrastructure layer for Conductor.
//!
//! Implementations of the ports defined in `conductor-core`: the SQLite
//! `WorkflowStore`, the TOML engine-config loader, and the filesystem
//! `PatternRegistry` over YAML templates.

pub mod config;
pub mod pattern;
pub mod sqlite;
