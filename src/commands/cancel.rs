use anyhow::{anyhow, Result};
use tracing::{info, warn};

use crate::config::Config;
use crate::store::{SqliteStore, TaskStore};

/// Command to ask a running `work` process to cancel a task
pub struct CancelCommand {
    id: i64,
    config: Config,
}

impl CancelCommand {
    pub fn new(id: i64, config: Config) -> Self {
        Self { id, config }
    }

    /// Returns whether a request was recorded
    pub async fn execute(&self) -> Result<bool> {
        let store = SqliteStore::open(&self.config.database_path)?;
        let task = store
            .get(self.id)?
            .ok_or_else(|| anyhow!("Task {} not found", self.id))?;

        if task.status.is_terminal() {
            warn!("Task {} is already {}, nothing to cancel", self.id, task.status);
            return Ok(false);
        }

        store.request_cancel(self.id)?;
        info!("Cancel requested for task {} ({})", self.id, task.status);
        Ok(true)
    }
}
