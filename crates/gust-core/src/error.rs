//! Error types for the gust engine.

use std::time::Duration;

use thiserror::Error;

/// Failure value produced when a host keeps answering 429 past the retry
/// budget. Carries the wait the limiter computed from the last response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rate limited (429), retry after {}", format_wait(.wait))]
pub struct RateLimitError {
    pub wait: Duration,
}

/// Renders a wait duration with a unit suffix: `5s`, `1.5s`, `250ms`.
fn format_wait(wait: &Duration) -> String {
    let ms = wait.as_millis();
    if ms == 0 {
        "0s".to_string()
    } else if ms < 1000 {
        format!("{ms}ms")
    } else if ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{:.1}s", wait.as_secs_f64())
    }
}

/// Errors that can occur in the gust engine.
#[derive(Debug, Error)]
pub enum GustError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    RateLimited(#[from] RateLimitError),

    #[error("server returned {status} for {url}")]
    Status { status: u16, url: String },

    #[error("server ignored range request for {url}")]
    RangeNotSupported { url: String },

    #[error("expected {expected} bytes, server delivered {actual}")]
    RangeMismatch { expected: u64, actual: u64 },

    #[error("chunk {index} failed after {attempts} attempts: {source}")]
    ChunkFailed {
        index: u32,
        attempts: u32,
        #[source]
        source: Box<GustError>,
    },

    #[error("download cancelled")]
    Cancelled,

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("worker task failed: {0}")]
    Worker(String),
}

impl GustError {
    /// Whether a chunk worker may retry after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            GustError::Network(_) | GustError::RangeMismatch { .. } => true,
            GustError::Status { status, .. } => *status == 408 || *status >= 500,
            _ => false,
        }
    }

    /// Statuses that abort the whole download without a retry: the resource
    /// moved, is gone, or a validator no longer matches.
    pub fn is_fatal_status(status: u16) -> bool {
        matches!(status, 404 | 410 | 412 | 416) || (300..400).contains(&status)
    }
}
