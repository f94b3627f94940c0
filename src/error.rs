//! Error taxonomies callers match on.
//!
//! Application glue uses `anyhow`; these enums exist where a caller needs to
//! tell failures apart (the load cache's waiters, the answer stream's
//! consumer).

use thiserror::Error;

/// Why a document could not be made queryable.
///
/// `Clone` so every caller coalesced onto one load observes the same error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("source document is empty or unavailable: {0}")]
    EmptySourceBlob(String),
    /// The backend refused the upload; the message is its own.
    #[error("upload rejected: {0}")]
    UploadRejected(String),
    #[error("existence check failed: {0}")]
    ExistenceCheckFailed(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("cache persistence failed: {0}")]
    Persistence(String),
    #[error("load cancelled")]
    Cancelled,
    /// A recent load for this document failed; reset the entry to retry.
    #[error("previous load failed: {0}")]
    PreviousFailure(String),
}

impl LoadError {
    /// Short machine-readable kind, stored alongside the message.
    pub fn kind(&self) -> &'static str {
        match self {
            LoadError::BackendUnavailable(_) => "backend_unavailable",
            LoadError::EmptySourceBlob(_) => "empty_source_blob",
            LoadError::UploadRejected(_) => "upload_rejected",
            LoadError::ExistenceCheckFailed(_) => "existence_check_failed",
            LoadError::Transport(_) => "transport",
            LoadError::Persistence(_) => "persistence",
            LoadError::Cancelled => "cancelled",
            LoadError::PreviousFailure(_) => "previous_failure",
        }
    }
}

/// Failure while consuming an answer stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("answer stream timed out after {0}s")]
    StreamTimeout(u64),
    #[error("malformed event frame: {0}")]
    MalformedEventFrame(String),
    /// The backend reported an error, in-band or by status code.
    #[error("backend error: {0}")]
    Backend(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for StreamError {
    fn from(e: reqwest::Error) -> Self {
        StreamError::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_error_messages_are_readable() {
        let e = LoadError::UploadRejected("file too large".to_string());
        assert_eq!(e.to_string(), "upload rejected: file too large");
        assert_eq!(e.kind(), "upload_rejected");
        assert_eq!(LoadError::Cancelled.to_string(), "load cancelled");
    }
}
