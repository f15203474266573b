use anyhow::{anyhow, Result};
use std::path::PathBuf;
use tracing::{info, warn};

use crate::config::Config;
use crate::job::{default_output_path, is_video_file, JobKind, JobParams, NewTask, Task};
use crate::store::{SqliteStore, TaskStore};

/// Command to create a task for an individual media file
pub struct AddCommand {
    input: PathBuf,
    kind: String,
    output: Option<PathBuf>,
    params: Option<String>,
    delete_original: bool,
    config: Config,
}

impl AddCommand {
    pub fn new(
        input: PathBuf,
        kind: String,
        output: Option<PathBuf>,
        params: Option<String>,
        delete_original: bool,
        config: Config,
    ) -> Self {
        Self {
            input,
            kind,
            output,
            params,
            delete_original,
            config,
        }
    }

    pub async fn execute(&self) -> Result<Task> {
        if !self.input.exists() {
            return Err(anyhow!("File does not exist: {:?}", self.input));
        }

        if !self.input.is_file() {
            return Err(anyhow!("Path is not a file: {:?}", self.input));
        }

        if !is_video_file(&self.input) {
            warn!("{:?} does not look like a video file", self.input);
        }

        let kind: JobKind = self.kind.parse()?;
        let params = self.params.clone().unwrap_or_default();
        JobParams::parse(kind, &params)?;

        let output = self.output.clone().unwrap_or_else(|| {
            default_output_path(&self.input, kind, &self.config.default_output_dir, &params)
        });

        let store = SqliteStore::open(&self.config.database_path)?;
        let task = store.create(
            &NewTask::new(self.input.clone(), output, kind.as_str())
                .with_params(params)
                .delete_original(self.delete_original),
        )?;

        info!(
            "Queued {} task {} for {:?} -> {:?}",
            task.kind, task.id, task.input_path, task.output_path
        );
        Ok(task)
    }
}
