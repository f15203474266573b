use anyhow::{anyhow, Result};
use std::path::Path;
use tracing::{info, warn};

use crate::config::Config;
use crate::store::{SqliteStore, TaskStore};

/// Command to remove a task record and, best-effort, whatever it produced
pub struct DeleteCommand {
    id: i64,
    config: Config,
}

impl DeleteCommand {
    pub fn new(id: i64, config: Config) -> Self {
        Self { id, config }
    }

    pub async fn execute(&self) -> Result<()> {
        let store = SqliteStore::open(&self.config.database_path)?;
        let task = store
            .get(self.id)?
            .ok_or_else(|| anyhow!("Task {} not found", self.id))?;

        // a running worker kills the process and drops the task on its next poll
        if !task.status.is_terminal() {
            store.request_cancel(self.id)?;
        }

        if !store.delete(self.id)? {
            return Err(anyhow!("Task {} not found", self.id));
        }
        info!("Deleted task {}", self.id);

        remove_output(&task.output_path).await;
        Ok(())
    }
}

async fn remove_output(path: &Path) {
    let result = match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(_) => return,
    };
    match result {
        Ok(()) => info!("Removed output {:?}", path),
        Err(e) => warn!("Failed to remove output {:?}: {}", path, e),
    }
}
