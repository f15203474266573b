use anyhow::{anyhow, Context, Result};
use glob::Pattern;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::Config;
use crate::job::{default_output_path, is_video_file, JobKind, JobParams, NewTask, Task};
use crate::store::{SqliteStore, TaskStore};

/// Settings key remembering the directory of the previous scan
pub const LAST_SCAN_DIRECTORY: &str = "last_scan_directory";

/// Options shared by every task a scan creates
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub recursive: bool,
    /// Glob matched against file names, e.g. `*.mkv`
    pub pattern: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub params: Option<String>,
    pub delete_original: bool,
}

/// Command to scan a directory for video files and create a task for each
pub struct ScanCommand {
    directory: Option<PathBuf>,
    kind: String,
    options: ScanOptions,
    config: Config,
}

impl ScanCommand {
    pub fn new(directory: Option<PathBuf>, kind: String, options: ScanOptions, config: Config) -> Self {
        Self {
            directory,
            kind,
            options,
            config,
        }
    }

    pub async fn execute(&self) -> Result<Vec<Task>> {
        let kind: JobKind = self.kind.parse()?;
        let params = self.options.params.clone().unwrap_or_default();
        JobParams::parse(kind, &params)?;

        let pattern = self
            .options
            .pattern
            .as_deref()
            .map(Pattern::new)
            .transpose()
            .context("Invalid file pattern")?;

        let store = SqliteStore::open(&self.config.database_path)?;

        let directory = match &self.directory {
            Some(dir) => dir.clone(),
            None => store
                .get_setting(LAST_SCAN_DIRECTORY)?
                .map(PathBuf::from)
                .ok_or_else(|| anyhow!("No directory given and no previous scan to reuse"))?,
        };

        if !directory.exists() {
            return Err(anyhow!("Directory does not exist: {:?}", directory));
        }

        if !directory.is_dir() {
            return Err(anyhow!("Path is not a directory: {:?}", directory));
        }

        info!("🔎 Scanning directory: {:?}", directory);

        let files = find_video_files(&directory, self.options.recursive, pattern.as_ref());
        info!("Found {} video files. Now creating tasks...", files.len());

        let output_dir = self
            .options
            .output_dir
            .clone()
            .unwrap_or_else(|| self.config.default_output_dir.clone());

        let mut tasks = Vec::with_capacity(files.len());
        for input in files {
            let output = default_output_path(&input, kind, &output_dir, &params);
            let task = store.create(
                &NewTask::new(input, output, kind.as_str())
                    .with_params(params.clone())
                    .delete_original(self.options.delete_original),
            )?;
            info!("➕ Queueing task {} for: {:?}", task.id, task.input_path);
            tasks.push(task);
        }

        let remembered = std::fs::canonicalize(&directory).unwrap_or(directory);
        store.set_setting(LAST_SCAN_DIRECTORY, &remembered.to_string_lossy())?;

        info!("✅ Scan complete. Added {} new tasks.", tasks.len());
        Ok(tasks)
    }
}

/// Video files under `directory`, sorted by path
pub fn find_video_files(directory: &Path, recursive: bool, pattern: Option<&Pattern>) -> Vec<PathBuf> {
    let max_depth = if recursive { usize::MAX } else { 1 };

    WalkDir::new(directory)
        .max_depth(max_depth)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|path| is_video_file(path))
        .filter(|path| match pattern {
            Some(pattern) => path
                .file_name()
                .map(|name| pattern.matches(&name.to_string_lossy()))
                .unwrap_or(false),
            None => true,
        })
        .inspect(|path| debug!("Matched {:?}", path))
        .collect()
}
