//! Error types shared by the store, supervisor and queue.

use thiserror::Error;

/// Result type for task pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while persisting, launching or supervising a task.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown task type: {0}")]
    UnknownJobKind(String),

    #[error("invalid {kind} parameters: {source}")]
    InvalidParams {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ffmpeg exited with {0}")]
    Process(String),

    #[error("ffmpeg process was killed")]
    Killed,

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("failed to signal task {0}: process already exited")]
    Signal(i64),

    #[error("task queue is closed")]
    QueueClosed,
}

impl Error {
    /// Whether the error was raised before any subprocess could start.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::UnknownJobKind(_) | Self::InvalidParams { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_classification() {
        assert!(Error::UnknownJobKind("upscale".into()).is_validation());
        let source = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(Error::InvalidParams {
            kind: "trim",
            source
        }
        .is_validation());
        assert!(!Error::Killed.is_validation());
        assert!(!Error::Process("exit status: 1".into()).is_validation());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            Error::UnknownJobKind("upscale".into()).to_string(),
            "unknown task type: upscale"
        );
        assert_eq!(
            Error::Signal(7).to_string(),
            "failed to signal task 7: process already exited"
        );
    }
}
