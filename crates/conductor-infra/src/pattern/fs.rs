//! `PatternRegistry` over a directory of YAML workflow templates.
//!
//! Each `*.yaml` / `*.yml` file directly under the directory is one pattern,
//! registered under the definition's `name`. Files are re-read on every call
//! so edits take effect without a restart.

use std::path::{Path, PathBuf};

use conductor_core::workflow::definition::discover_definitions;
use conductor_core::workflow::graph::Graph;
use conductor_core::workflow::pattern::{PatternError, PatternRegistry, resolve_template};
use conductor_types::workflow::WorkflowDefinition;
use serde_json::{Map, Value};

/// Patterns loaded from `{data_dir}/patterns`.
#[derive(Debug, Clone)]
pub struct FilePatternRegistry {
    dir: PathBuf,
}

impl FilePatternRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Registry rooted at `{data_dir}/patterns`.
    pub fn in_data_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join("patterns"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Every valid template with the file it came from, sorted by path.
    pub fn definitions(&self) -> Result<Vec<(PathBuf, WorkflowDefinition)>, PatternError> {
        Ok(discover_definitions(&self.dir)?)
    }

    fn find(&self, name: &str) -> Result<WorkflowDefinition, PatternError> {
        let mut matches = self
            .definitions()?
            .into_iter()
            .filter(|(_, def)| def.name == name);

        let Some((path, def)) = matches.next() else {
            return Err(PatternError::NotFound(name.to_string()));
        };
        if let Some((other, _)) = matches.next() {
            return Err(PatternError::Invalid {
                name: name.to_string(),
                reason: format!(
                    "declared by both {} and {}",
                    path.display(),
                    other.display()
                ),
            });
        }
        tracing::debug!(pattern = name, path = %path.display(), "resolved pattern file");
        Ok(def)
    }
}

impl PatternRegistry for FilePatternRegistry {
    fn resolve(&self, name: &str, params: &Map<String, Value>) -> Result<Graph, PatternError> {
        let template = self.find(name)?;
        resolve_template(&template, params)
    }

    fn names(&self) -> Vec<String> {
        match self.definitions() {
            Ok(defs) => {
                let mut names: Vec<String> = defs.into_iter().map(|(_, def)| def.name).collect();
                names.sort();
                names.dedup();
                names
            }
            Err(e) => {
                tracing::warn!(dir = %self.dir.display(), error = %e, "failed to list patterns");
                Vec::new()
            }
        }
    }
}
