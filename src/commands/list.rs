use anyhow::Result;
use tracing::info;

use crate::config::Config;
use crate::job::Task;
use crate::store::{SqliteStore, TaskStore};

/// Command to print every stored task, newest first
pub struct ListCommand {
    config: Config,
}

impl ListCommand {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn execute(&self) -> Result<Vec<Task>> {
        let store = SqliteStore::open(&self.config.database_path)?;
        let tasks = store.list_all()?;
        info!("{} tasks in {:?}", tasks.len(), self.config.database_path);
        Ok(tasks)
    }

    pub fn print(&self, tasks: &[Task]) {
        if tasks.is_empty() {
            println!("No tasks.");
            return;
        }

        println!(
            "{:>5}  {:<10}  {:<9}  {:>6}  {}",
            "ID", "TYPE", "STATUS", "DONE", "INPUT"
        );
        for task in tasks {
            println!(
                "{:>5}  {:<10}  {:<9}  {:>5.1}%  {}",
                task.id,
                task.kind,
                task.status,
                task.progress,
                task.input_path.display()
            );
            if let Some(error) = &task.error_log {
                println!("       error: {}", error);
            }
        }
    }
}
