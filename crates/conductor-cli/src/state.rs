//! Application state shared by the CLI commands.

use std::path::PathBuf;
use std::sync::Arc;

use conductor_core::workflow::capability::CapabilityRegistry;
use conductor_core::workflow::supervisor::Supervisor;
use conductor_infra::pattern::fs::FilePatternRegistry;
use conductor_infra::sqlite::pool::{DatabasePool, database_url};
use conductor_infra::sqlite::workflow::SqliteWorkflowStore;
use conductor_types::config::EngineConfig;

use crate::builtin::BuiltinCapability;

/// Supervisor pinned to the SQLite store.
pub type ConcreteSupervisor = Supervisor<SqliteWorkflowStore>;

pub struct AppState {
    pub data_dir: PathBuf,
    pub config: EngineConfig,
    pub db_pool: DatabasePool,
}

impl AppState {
    /// Create the data directory if needed and open the database.
    pub async fn init(data_dir: PathBuf, config: EngineConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&data_dir).await?;
        let db_pool = DatabasePool::new(&database_url(&data_dir)).await?;
        Ok(Self {
            data_dir,
            config,
            db_pool,
        })
    }

    pub fn store(&self) -> SqliteWorkflowStore {
        SqliteWorkflowStore::new(self.db_pool.clone())
    }

    /// Supervisor with the `builtin` capability and the data-dir patterns.
    pub fn supervisor(&self) -> ConcreteSupervisor {
        let registry = CapabilityRegistry::new();
        registry.register("builtin", BuiltinCapability::new());

        Supervisor::new(self.config.clone(), self.store(), Arc::new(registry))
            .with_patterns(Arc::new(FilePatternRegistry::in_data_dir(&self.data_dir)))
    }
}
