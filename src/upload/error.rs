use std::time::Duration;

use thiserror::Error;

use super::auth::AuthRequired;

const MAX_BODY_IN_ERROR: usize = 200;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UploadError {
    /// Timeout, 5xx, 408 or a dropped connection.
    #[error("transient upload failure: {0}")]
    Transient(String),
    /// The server could not be reached at all.
    #[error("server unreachable: {0}")]
    Unreachable(String),
    #[error("rate limited by server")]
    RateLimited { retry_after: Option<Duration> },
    #[error("rejected by server (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error(transparent)]
    AuthRequired(#[from] AuthRequired),
    /// The request could not be built on this side.
    #[error("local upload error: {0}")]
    Local(String),
}

impl UploadError {
    /// Counts against the attempt budget and goes through backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UploadError::Transient(_) | UploadError::Unreachable(_) | UploadError::RateLimited { .. }
        )
    }
}

/// Maps a non-2xx status to the failure class that decides the job's fate.
pub fn classify_status(status: u16, body: &str, retry_after: Option<Duration>) -> UploadError {
    match status {
        401 => UploadError::AuthRequired(AuthRequired),
        408 => UploadError::Transient(format!("HTTP 408: {}", excerpt(body))),
        429 => UploadError::RateLimited { retry_after },
        500..=599 => UploadError::Transient(format!("HTTP {status}: {}", excerpt(body))),
        _ => UploadError::Rejected {
            status,
            message: excerpt(body),
        },
    }
}

fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(MAX_BODY_IN_ERROR) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}
