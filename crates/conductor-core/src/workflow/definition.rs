//! Workflow definition parsing, validation, and filesystem discovery.
//!
//! Converts YAML files into the canonical `WorkflowDefinition`, validates
//! structural constraints (name, unique ids, capability bindings, known
//! dependencies, timeouts) and builds the executable `Graph`.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use conductor_types::workflow::{NodeKind, WorkflowDefinition};
use serde_json::{Map, Value};
use thiserror::Error;

use super::graph::{Graph, GraphError};
use super::variables::resolve_value;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors produced while loading or validating a workflow definition.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// YAML deserialization failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The definition is valid on its own but does not form a DAG.
    #[error("invalid graph: {0}")]
    Graph(#[from] GraphError),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `WorkflowDefinition` back to YAML.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(def).map_err(|e| DefinitionError::Parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Name is non-empty
/// - At least one node exists
/// - Node ids are unique
/// - Agent nodes carry a capability reference
/// - `depends_on` and edge endpoints name existing nodes
/// - Workflow and node timeouts are > 0 when set
///
/// Cycles are detected later by `build_graph`.
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if def.name.trim().is_empty() {
        return Err(DefinitionError::Validation(
            "workflow name must not be empty".to_string(),
        ));
    }

    if def.nodes.is_empty() {
        return Err(DefinitionError::Validation(
            "workflow must have at least one node".to_string(),
        ));
    }

    let mut seen_ids = HashSet::new();
    for node in &def.nodes {
        if !seen_ids.insert(node.id.as_str()) {
            return Err(DefinitionError::Validation(format!(
                "duplicate node id: '{}'",
                node.id
            )));
        }
    }

    for node in &def.nodes {
        if node.kind == NodeKind::Agent && node.capability.is_none() {
            return Err(DefinitionError::Validation(format!(
                "agent node '{}' must declare a capability",
                node.id
            )));
        }
        for dep in &node.depends_on {
            if !seen_ids.contains(dep.as_str()) {
                return Err(DefinitionError::Validation(format!(
                    "node '{}' depends on unknown node '{}'",
                    node.id, dep
                )));
            }
        }
        if node.timeout_secs == Some(0) {
            return Err(DefinitionError::Validation(format!(
                "node '{}' timeout must be > 0",
                node.id
            )));
        }
    }

    for edge in &def.edges {
        for endpoint in [&edge.from, &edge.to] {
            if !seen_ids.contains(endpoint.as_str()) {
                return Err(DefinitionError::Validation(format!(
                    "edge '{}' -> '{}' references unknown node '{}'",
                    edge.from, edge.to, endpoint
                )));
            }
        }
    }

    if def.timeout_secs == Some(0) {
        return Err(DefinitionError::Validation(
            "timeout must be > 0".to_string(),
        ));
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Graph construction
// ---------------------------------------------------------------------------

/// Build the executable graph for a definition, carrying its name.
pub fn build_graph(def: &WorkflowDefinition) -> Result<Graph, GraphError> {
    Ok(Graph::build(def.nodes.clone(), def.edges.clone(), def.mode)?.named(def.name.clone()))
}

/// Instantiate a template definition with caller parameters.
///
/// `{{ key }}` references to `params` are substituted into every node's
/// parameters; references to anything else (e.g. `{{ fetch_result }}`) are
/// left for runtime resolution. `params` are also merged over the
/// definition's `inputs`.
pub fn instantiate(def: &WorkflowDefinition, params: &Map<String, Value>) -> WorkflowDefinition {
    let vars: HashMap<String, Value> = params
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let mut instance = def.clone();
    for node in &mut instance.nodes {
        node.parameters = node
            .parameters
            .iter()
            .map(|(k, v)| (k.clone(), resolve_value(v, &vars)))
            .collect();
    }
    for (key, value) in params {
        instance.inputs.insert(key.clone(), value.clone());
    }
    instance
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load and validate a workflow definition from a YAML file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

/// Save a workflow definition to a YAML file, creating parent directories.
pub fn save_workflow_file(path: &Path, def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_workflow_yaml(def)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Discover workflow definitions directly under `dir` (`.yaml` / `.yml`).
///
/// Files that fail to parse or validate are skipped with a warning. Results
/// are sorted by path. A missing directory yields an empty list.
pub fn discover_definitions(
    dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, DefinitionError> {
    let mut results = Vec::new();
    if !dir.exists() {
        return Ok(results);
    }

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_yaml = path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml");
        if !path.is_file() || !is_yaml {
            continue;
        }
        match load_workflow_file(&path) {
            Ok(def) => results.push((path, def)),
            Err(e) => {
                tracing::warn!(?path, error = %e, "skipping invalid workflow definition");
            }
        }
    }

    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
