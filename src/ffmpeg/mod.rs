pub mod progress;

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::job::{JobKind, JobParams, RemuxParams, ThumbnailParams, TranscodeParams, TrimParams};

pub use progress::ProgressCallback;

/// Arguments placed before the job-specific ones so progress goes to stderr
const PROGRESS_ARGS: [&str; 5] = ["-progress", "pipe:2", "-nostats", "-loglevel", "error"];

/// FFmpeg wrapper that turns one task into one supervised subprocess
#[derive(Debug, Clone)]
pub struct FFmpegProcessor {
    binary: String,
    threads: u32,
}

impl FFmpegProcessor {
    pub fn new(binary: impl Into<String>, threads: u32) -> Self {
        Self {
            binary: binary.into(),
            threads,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.ffmpeg_path.clone(), config.ffmpeg_threads)
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Build the full argument list for a job, progress flags included.
    ///
    /// Fails before anything is spawned when the payload does not decode.
    pub fn build_args(
        &self,
        kind: JobKind,
        input: &Path,
        output: &Path,
        params: &str,
    ) -> Result<Vec<String>> {
        let mut args: Vec<String> = PROGRESS_ARGS.iter().map(|s| s.to_string()).collect();
        if self.threads > 0 {
            args.extend(["-threads".to_string(), self.threads.to_string()]);
        }

        let input = input.to_string_lossy().into_owned();
        match JobParams::parse(kind, params)? {
            JobParams::Transcode(p) => transcode_args(&mut args, input, output, p),
            JobParams::Remux(p) => remux_args(&mut args, input, output, p),
            JobParams::Trim(p) => trim_args(&mut args, input, output, p),
            JobParams::Thumbnail(p) => thumbnail_args(&mut args, input, output, p),
        }
        Ok(args)
    }

    /// Query the input's total duration in seconds.
    ///
    /// Any failure yields zero, which makes progress report 0 until the final
    /// completion sample.
    pub async fn probe_duration(&self, input: &Path) -> f64 {
        let output = Command::new(&self.binary)
            .arg("-i")
            .arg(input)
            .stdin(Stdio::null())
            .output()
            .await;

        match output {
            Ok(output) => {
                let text = format!(
                    "{}{}",
                    String::from_utf8_lossy(&output.stdout),
                    String::from_utf8_lossy(&output.stderr)
                );
                progress::parse_duration(&text).unwrap_or_else(|| {
                    debug!("No duration found for {:?}", input);
                    0.0
                })
            }
            Err(e) => {
                warn!("Failed to probe duration of {:?}: {}", input, e);
                0.0
            }
        }
    }

    /// Start the job's process and return as soon as it is running.
    ///
    /// Two reader activities are attached: stderr is parsed for progress and
    /// reported through `callback`, stdout is only logged. The caller waits on
    /// the returned [`RunningJob`].
    pub async fn spawn(
        &self,
        kind: JobKind,
        input: &Path,
        output: &Path,
        params: &str,
        callback: ProgressCallback,
    ) -> Result<RunningJob> {
        let args = self.build_args(kind, input, output, params)?;

        if kind == JobKind::Thumbnail {
            tokio::fs::create_dir_all(output).await?;
        }

        let total_duration = self.probe_duration(input).await;
        debug!("Executing FFmpeg command: {} {}", self.binary, args.join(" "));

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stderr = child.stderr.take().ok_or_else(|| {
            Error::Io(std::io::Error::other("ffmpeg stderr was not captured"))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            Error::Io(std::io::Error::other("ffmpeg stdout was not captured"))
        })?;

        let progress = tokio::spawn(progress::read_progress(
            BufReader::new(stderr),
            total_duration,
            callback,
        ));
        let log = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("ffmpeg stdout: {}", line);
            }
        });

        info!(
            "FFmpeg started for {:?} (pid {:?}, duration {:.2}s)",
            input,
            child.id(),
            total_duration
        );

        Ok(RunningJob {
            child,
            readers: [progress, log],
        })
    }
}

/// A started encoder process plus the activities reading its output
#[derive(Debug)]
pub struct RunningJob {
    child: Child,
    readers: [JoinHandle<()>; 2],
}

impl RunningJob {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for the process to exit, or kill it when `kill` fires.
    ///
    /// Both readers are drained before returning, so the final progress
    /// sample has been delivered by the time the outcome is known.
    pub async fn wait(mut self, mut kill: oneshot::Receiver<()>) -> Result<()> {
        let outcome = tokio::select! {
            status = self.child.wait() => Some(status),
            Ok(()) = &mut kill => None,
        };

        let result = match outcome {
            Some(status) => status.map_err(Error::from).and_then(check_status),
            None => {
                info!("Killing ffmpeg (pid {:?})", self.child.id());
                match self.child.kill().await {
                    Ok(()) => Err(Error::Killed),
                    Err(e) => Err(Error::Io(e)),
                }
            }
        };

        for reader in self.readers {
            if let Err(e) = reader.await {
                warn!("ffmpeg output reader failed: {}", e);
            }
        }
        result
    }
}

fn check_status(status: ExitStatus) -> Result<()> {
    if status.success() {
        Ok(())
    } else {
        Err(Error::Process(status.to_string()))
    }
}

fn transcode_args(args: &mut Vec<String>, input: String, output: &Path, p: TranscodeParams) {
    args.extend(["-i".to_string(), input, "-y".to_string()]);
    let options = [
        ("-c:v", p.video_codec),
        ("-c:a", p.audio_codec),
        ("-b:v", p.bitrate),
        ("-s", p.resolution),
    ];
    for (flag, value) in options {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            args.extend([flag.to_string(), value]);
        }
    }
    args.push(output.to_string_lossy().into_owned());
}

fn remux_args(args: &mut Vec<String>, input: String, output: &Path, p: RemuxParams) {
    let ext = p
        .output_extension
        .map(|e| e.trim_start_matches('.').to_lowercase())
        .filter(|e| !e.is_empty())
        .or_else(|| {
            output
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
        })
        .unwrap_or_default();

    args.extend(["-i".to_string(), input]);
    let codec: &[&str] = match ext.as_str() {
        "mp4" | "m4v" | "flv" => &["-c:v", "libx264", "-c:a", "aac"],
        "m3u8" => &["-c:v", "libx264", "-c:a", "aac", "-f", "hls"],
        _ => &["-c", "copy"],
    };
    args.extend(codec.iter().map(|s| s.to_string()));
    args.extend(["-y".to_string(), output.to_string_lossy().into_owned()]);
}

fn trim_args(args: &mut Vec<String>, input: String, output: &Path, p: TrimParams) {
    args.extend(["-i".to_string(), input]);
    if let Some(start) = p.start_time.filter(|v| !v.is_empty()) {
        args.extend(["-ss".to_string(), start]);
    }
    if let Some(duration) = p.duration.filter(|v| !v.is_empty()) {
        args.extend(["-t".to_string(), duration]);
    }
    args.extend(
        ["-c", "copy", "-y"]
            .iter()
            .map(|s| s.to_string())
            .chain([output.to_string_lossy().into_owned()]),
    );
}

fn thumbnail_args(args: &mut Vec<String>, input: String, output: &Path, p: ThumbnailParams) {
    let interval = if p.interval == 0 { 5 } else { p.interval };
    let scale = if p.scale.is_empty() {
        ThumbnailParams::default().scale
    } else {
        p.scale
    };

    let stem = Path::new(&input)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "frame".to_string());
    let pattern = output.join(format!("{stem}_thumb_%04d.jpg"));

    args.extend([
        "-i".to_string(),
        input,
        "-vf".to_string(),
        format!("fps=1/{interval},scale={scale}"),
        "-y".to_string(),
        pattern.to_string_lossy().into_owned(),
    ]);
}
