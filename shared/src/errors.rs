/// Unified error types for the relay.
use std::time::Duration;
use thiserror::Error;

/// Top-level error type for translation and relay operations.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Upstream unreachable: {0}")]
    Unreachable(String),

    #[error("Upstream returned HTTP {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    #[error("Download failed: {0}")]
    JobFailed(String),

    #[error("Upstream stream ended before the download finished")]
    StreamEnded,

    #[error("Download timed out after {:.1}s", .elapsed.as_secs_f64())]
    Timeout { elapsed: Duration },
}

impl RelayError {
    /// Stable machine-readable identifier for error responses.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Validation(_) => "validation",
            RelayError::Unreachable(_) => "upstream_unreachable",
            RelayError::UpstreamStatus { .. } => "upstream_status",
            RelayError::JobFailed(_) => "job_failed",
            RelayError::StreamEnded => "stream_ended",
            RelayError::Timeout { .. } => "timeout",
        }
    }

    /// Whether the caller caused this error (as opposed to the upstream).
    pub fn is_user_error(&self) -> bool {
        matches!(self, RelayError::Validation(_))
    }

    /// Elapsed time for timeout errors.
    pub fn elapsed(&self) -> Option<Duration> {
        match self {
            RelayError::Timeout { elapsed } => Some(*elapsed),
            _ => None,
        }
    }
}

/// Result type alias for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;
