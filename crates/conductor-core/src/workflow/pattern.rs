//! Pattern registry port: named workflow templates resolved into graphs.
//!
//! A pattern is a `WorkflowDefinition` whose node parameters may reference
//! caller parameters with `{{ key }}`. Resolution instantiates the template
//! and builds a validated `Graph`. The filesystem-backed registry lives in
//! `conductor-infra`.

use std::collections::HashMap;
use std::sync::RwLock;

use conductor_types::workflow::WorkflowDefinition;
use serde_json::{Map, Value};
use thiserror::Error;

use super::definition::{DefinitionError, build_graph, instantiate, validate_definition};
use super::graph::{Graph, GraphError};

#[derive(Debug, Error)]
pub enum PatternError {
    #[error("pattern not found: {0}")]
    NotFound(String),

    #[error("invalid pattern '{name}': {reason}")]
    Invalid { name: String, reason: String },

    #[error("pattern graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("pattern definition error: {0}")]
    Definition(#[from] DefinitionError),
}

/// Resolves a named template into an executable graph.
pub trait PatternRegistry: Send + Sync {
    fn resolve(&self, name: &str, params: &Map<String, Value>) -> Result<Graph, PatternError>;

    /// Registered pattern names, sorted.
    fn names(&self) -> Vec<String>;
}

/// Instantiate `template` with `params`, validate it, and build its graph.
pub fn resolve_template(
    template: &WorkflowDefinition,
    params: &Map<String, Value>,
) -> Result<Graph, PatternError> {
    let def = instantiate(template, params);
    validate_definition(&def)?;
    Ok(build_graph(&def)?)
}

/// Pattern registry backed by definitions held in memory.
#[derive(Default)]
pub struct InMemoryPatternRegistry {
    patterns: RwLock<HashMap<String, WorkflowDefinition>>,
}

impl InMemoryPatternRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `def` under its own name, replacing any previous template.
    pub fn register(&self, def: WorkflowDefinition) {
        let mut patterns = self
            .patterns
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        patterns.insert(def.name.clone(), def);
    }

    pub fn get(&self, name: &str) -> Option<WorkflowDefinition> {
        self.patterns
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }
}

impl PatternRegistry for InMemoryPatternRegistry {
    fn resolve(&self, name: &str, params: &Map<String, Value>) -> Result<Graph, PatternError> {
        let template = self
            .get(name)
            .ok_or_else(|| PatternError::NotFound(name.to_string()))?;
        resolve_template(&template, params)
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .patterns
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
