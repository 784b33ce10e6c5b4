use std::time::Duration;
use thiserror::Error;

/// Errors raised inside the download engine
///
/// None of these cross a worker boundary: each is captured per job and folded
/// into a result code.
#[derive(Error, Debug)]
pub enum DownloadError {
    /// Executable missing or not runnable
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    /// Child was spawned without the requested pipe
    #[error("Process {0} pipe unavailable")]
    MissingPipe(&'static str),

    /// No output for longer than the stall timeout
    #[error("Downloader produced no output for {0:?}")]
    Stalled(Duration),

    /// Transient network failure reported on stderr
    #[error("Network error reported by downloader: {0}")]
    Network(String),

    /// Non-zero (or signal) exit status
    #[error("Downloader exited with status {0}")]
    ProcessExit(i32),

    /// Invalid operator-supplied output filter
    #[error("Invalid output filter pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DownloadError {
    /// Stalls and network failures are retried by the owning worker
    pub fn is_retryable(&self) -> bool {
        matches!(self, DownloadError::Stalled(_) | DownloadError::Network(_))
    }
}
