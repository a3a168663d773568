//! Shared application state.

use std::sync::Arc;

use crate::config::Config;
use crate::executor::SandboxExecutor;
use crate::manager::SandboxManager;
use crate::provider;
use crate::store::SqliteStore;

/// Everything the HTTP handlers and the CLI need, built once per process.
#[derive(Clone)]
pub struct AppState {
    pub manager: SandboxManager,
    pub executor: SandboxExecutor,
}

impl AppState {
    pub fn new(manager: SandboxManager) -> Self {
        Self {
            executor: SandboxExecutor::new(manager.clone()),
            manager,
        }
    }

    /// Open the state database and connect the configured provider.
    pub fn from_config(config: Config) -> Result<Self, String> {
        let provider = provider::from_config(&config)?;
        let store = Arc::new(
            SqliteStore::open(&config.database)
                .map_err(|e| format!("open {}: {}", config.database.display(), e))?,
        );
        let manager = SandboxManager::new(Arc::new(config), provider, store.clone(), store);
        Ok(Self::new(manager))
    }
}
