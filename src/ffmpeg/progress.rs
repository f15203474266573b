//! Progress derivation from ffmpeg's diagnostic stream.

use regex::Regex;
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::debug;

/// Receives `(progress, message)` for every parsed diagnostic line.
pub type ProgressCallback = Arc<dyn Fn(f64, &str) + Send + Sync + 'static>;

/// Message passed with the synthetic final sample
pub const COMPLETED_MESSAGE: &str = "Completed";

fn time_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"time=(\d{2}):(\d{2}):(\d{2}\.\d{2})").expect("valid time regex")
    })
}

fn duration_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Duration: (\d{2}):(\d{2}):(\d{2}\.\d{2})").expect("valid duration regex")
    })
}

fn to_seconds(hours: &str, minutes: &str, seconds: &str) -> Option<f64> {
    let hours: f64 = hours.parse().ok()?;
    let minutes: f64 = minutes.parse().ok()?;
    let seconds: f64 = seconds.parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Elapsed seconds from the last `time=HH:MM:SS.ff` token in `line`
pub fn parse_time_token(line: &str) -> Option<f64> {
    let caps = time_regex().captures_iter(line).last()?;
    to_seconds(&caps[1], &caps[2], &caps[3])
}

/// Total seconds from the `Duration: HH:MM:SS.ff` header of a probe
pub fn parse_duration(text: &str) -> Option<f64> {
    let caps = duration_regex().captures(text)?;
    to_seconds(&caps[1], &caps[2], &caps[3])
}

/// Percentage of `total` covered by `elapsed`, capped at 100. Zero when the
/// total is unknown.
pub fn percentage(elapsed: f64, total: f64) -> f64 {
    if total > 0.0 {
        (elapsed / total * 100.0).min(100.0)
    } else {
        0.0
    }
}

/// Consume `reader` line by line until it closes, invoking `callback` once per
/// line carrying a time token, then once more with 100 as a terminal signal.
///
/// The final sample is sent whether or not the process succeeded; callers
/// learn the real outcome from the process exit status.
pub async fn read_progress<R>(reader: R, total_duration: f64, callback: ProgressCallback)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!("ffmpeg stderr: {}", line);
                if let Some(elapsed) = parse_time_token(&line) {
                    callback(percentage(elapsed, total_duration), &line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("ffmpeg stderr closed with error: {}", e);
                break;
            }
        }
    }
    callback(100.0, COMPLETED_MESSAGE);
}
