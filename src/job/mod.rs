use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Error, Result};

const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "avi", "mov", "flv", "wmv", "webm", "m4v", "mpg", "mpeg",
];

/// Lifecycle status of a task
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Finished,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Finished => "finished",
            TaskStatus::Error => "error",
        }
    }

    /// Finished and error are terminal; nothing moves a task out of them
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Finished | TaskStatus::Error)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "finished" => Ok(TaskStatus::Finished),
            "error" => Ok(TaskStatus::Error),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Supported kinds of media processing
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Re-encode with explicit codecs, bitrate and resolution
    Transcode,
    /// Change container, re-encoding only where the container requires it
    Remux,
    /// Cut a time range with stream copy
    Trim,
    /// Extract still frames at a fixed interval
    Thumbnail,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Transcode => "transcode",
            JobKind::Remux => "remux",
            JobKind::Trim => "trim",
            JobKind::Thumbnail => "thumbnail",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "transcode" => Ok(JobKind::Transcode),
            "remux" => Ok(JobKind::Remux),
            "trim" => Ok(JobKind::Trim),
            "thumbnail" => Ok(JobKind::Thumbnail),
            _ => Err(Error::UnknownJobKind(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TranscodeParams {
    /// e.g. libx264, libx265, libvpx-vp9
    pub video_codec: Option<String>,
    /// e.g. aac, libmp3lame
    pub audio_codec: Option<String>,
    /// e.g. 2M, 5M
    pub bitrate: Option<String>,
    /// e.g. 1920x1080
    pub resolution: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RemuxParams {
    /// Target container, with or without the leading dot
    pub output_extension: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TrimParams {
    /// Offset such as 00:00:10
    pub start_time: Option<String>,
    /// Length such as 00:05:00
    pub duration: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ThumbnailParams {
    /// Seconds between frames
    pub interval: u32,
    /// Frame size as WIDTHxHEIGHT
    pub scale: String,
}

impl Default for ThumbnailParams {
    fn default() -> Self {
        Self {
            interval: 5,
            scale: "320x240".to_string(),
        }
    }
}

/// Typed parameters for one job kind, decoded from the task's JSON payload
#[derive(Debug, Clone, PartialEq)]
pub enum JobParams {
    Transcode(TranscodeParams),
    Remux(RemuxParams),
    Trim(TrimParams),
    Thumbnail(ThumbnailParams),
}

impl JobParams {
    /// Decode the payload for `kind`. An empty payload selects the defaults.
    pub fn parse(kind: JobKind, payload: &str) -> Result<Self> {
        Ok(match kind {
            JobKind::Transcode => JobParams::Transcode(decode(kind, payload)?),
            JobKind::Remux => JobParams::Remux(decode(kind, payload)?),
            JobKind::Trim => JobParams::Trim(decode(kind, payload)?),
            JobKind::Thumbnail => JobParams::Thumbnail(decode(kind, payload)?),
        })
    }
}

fn decode<T: DeserializeOwned + Default>(kind: JobKind, payload: &str) -> Result<T> {
    let payload = payload.trim();
    if payload.is_empty() || payload == "null" {
        return Ok(T::default());
    }
    serde_json::from_str(payload).map_err(|source| Error::InvalidParams {
        kind: kind.as_str(),
        source,
    })
}

/// A persisted unit of media-processing work
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: i64,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    /// Raw job kind as submitted; unknown kinds fail at dispatch
    #[serde(rename = "type")]
    pub kind: String,
    /// JSON parameter payload for the job kind
    pub params: String,
    pub status: TaskStatus,
    pub progress: f64,
    pub error_log: Option<String>,
    pub delete_original: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn job_kind(&self) -> Result<JobKind> {
        self.kind.parse()
    }

    /// Display label used in progress events
    pub fn file_name(&self) -> String {
        self.input_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// A task as submitted, before the store assigns it an identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub params: String,
    #[serde(default)]
    pub delete_original: bool,
}

impl NewTask {
    pub fn new(
        input_path: impl Into<PathBuf>,
        output_path: impl Into<PathBuf>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            input_path: input_path.into(),
            output_path: output_path.into(),
            kind: kind.into(),
            params: String::new(),
            delete_original: false,
        }
    }

    pub fn with_params(mut self, params: impl Into<String>) -> Self {
        self.params = params.into();
        self
    }

    pub fn delete_original(mut self, delete: bool) -> Self {
        self.delete_original = delete;
        self
    }
}

/// Ephemeral notification of a task's progress, never persisted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub task_id: i64,
    pub progress: f64,
    pub status: TaskStatus,
    pub file_name: String,
    pub message: String,
}

impl ProgressEvent {
    pub fn new(task: &Task, status: TaskStatus, progress: f64, message: impl Into<String>) -> Self {
        Self {
            task_id: task.id,
            progress,
            status,
            file_name: task.file_name(),
            message: message.into(),
        }
    }
}

/// Check whether a path looks like a video file by its extension
pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .map(|ext| VIDEO_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// Derive an output path for `input` when the caller did not provide one.
///
/// Thumbnail extraction produces a directory, every other kind a single file.
pub fn default_output_path(input: &Path, kind: JobKind, output_dir: &Path, params: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let original_ext = input
        .extension()
        .map(|e| e.to_string_lossy().into_owned());

    let (suffix, ext) = match kind {
        JobKind::Transcode => ("_transcoded", Some("mp4".to_string())),
        JobKind::Remux => {
            // a malformed payload is reported when the task runs, not here
            let requested = match JobParams::parse(kind, params) {
                Ok(JobParams::Remux(p)) => p.output_extension,
                _ => None,
            };
            let ext = requested
                .map(|e| e.trim_start_matches('.').to_string())
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| "mp4".to_string());
            ("_remuxed", Some(ext))
        }
        JobKind::Trim => ("_trimmed", original_ext),
        JobKind::Thumbnail => ("_thumbs", None),
    };

    let file_name = match ext {
        Some(ext) => format!("{stem}{suffix}.{ext}"),
        None => format!("{stem}{suffix}"),
    };
    output_dir.join(file_name)
}
