use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Configuration for the encoder, the store and the task pipeline
#[derive(Debug, Clone)]
pub struct Config {
    pub ffmpeg_path: String,
    pub ffmpeg_threads: u32,
    pub default_output_dir: PathBuf,
    pub database_path: PathBuf,
    pub queue_capacity: usize,
    pub subscriber_capacity: usize,
    pub broadcast_capacity: usize,
    pub cancel_intent_ttl: u64,
    pub sleep_interval: u64,
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            ffmpeg_path: env::var("VIDEOFORGE_FFMPEG").unwrap_or(defaults.ffmpeg_path),
            ffmpeg_threads: parse_var("VIDEOFORGE_THREADS", defaults.ffmpeg_threads),
            default_output_dir: env::var("VIDEOFORGE_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.default_output_dir),
            database_path: env::var("VIDEOFORGE_DB")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            queue_capacity: parse_var("VIDEOFORGE_QUEUE_CAPACITY", defaults.queue_capacity),
            subscriber_capacity: parse_var(
                "VIDEOFORGE_SUBSCRIBER_CAPACITY",
                defaults.subscriber_capacity,
            ),
            broadcast_capacity: parse_var(
                "VIDEOFORGE_BROADCAST_CAPACITY",
                defaults.broadcast_capacity,
            ),
            cancel_intent_ttl: parse_var("VIDEOFORGE_CANCEL_TTL", defaults.cancel_intent_ttl),
            sleep_interval: parse_var("SLEEP_INTERVAL", defaults.sleep_interval),
        }
    }

    pub fn cancel_intent_ttl(&self) -> Duration {
        Duration::from_secs(self.cancel_intent_ttl)
    }

    pub fn sleep_interval(&self) -> Duration {
        Duration::from_secs(self.sleep_interval)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ffmpeg_threads: 0,
            default_output_dir: PathBuf::from("output"),
            database_path: PathBuf::from("videoforge.db"),
            queue_capacity: 100,
            subscriber_capacity: 256,
            broadcast_capacity: 256,
            cancel_intent_ttl: 3600,
            sleep_interval: 60,
        }
    }
}

/// Unset or unparsable values fall back to the default
fn parse_var<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
