//! Error types
//!
//! One crate-wide taxonomy. Every suspension site decides locally whether to
//! recover, wrap, or surface; nothing here is ever turned into a panic.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for all core operations.
#[derive(Debug, Error, Clone)]
pub enum Error {
    /// Access control rejected the request. Surfaced to the session after a
    /// fixed penalty sleep; never retried.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// An authentication backend failed for reasons unrelated to the
    /// credentials themselves.
    #[error("authentication backend error: {0}")]
    AuthenticationInternal(String),

    /// Another publisher is already active on the path.
    #[error("someone is already publishing to path '{0}'")]
    AlreadyPublishing(String),

    /// The publisher was evicted by a newer one (override enabled).
    #[error("superseded by another publisher on path '{0}'")]
    Superseded(String),

    /// Reader could not attach: the path exists but carries no stream.
    #[error("path '{0}' is not ready")]
    PathNotReady(String),

    /// No configuration entry matches the requested path name.
    #[error("path '{0}' is not configured")]
    PathNotFound(String),

    /// The path name itself is malformed.
    #[error("invalid path name '{0}': {1}")]
    InvalidPathName(String, String),

    /// The path reached its configured reader limit.
    #[error("path '{0}' has reached its reader limit")]
    TooManyReaders(String),

    /// The reader's async queue exceeded capacity; closes only that reader.
    #[error("reader queue of {0} elements is full")]
    ReaderOverflow(usize),

    /// Cancellation propagated from a parent. Swallowed at the session
    /// boundary and logged at info level.
    #[error("terminated")]
    Terminated,

    /// A static source failed upstream; triggers the retry loop.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Stream construction or write-side setup failed.
    #[error("invalid stream: {0}")]
    InvalidStream(String),

    /// Recorder I/O failure; tears down the segmenter for a restart.
    #[error("write error: {0}")]
    Write(String),

    /// Unrecoverable; propagated to process exit.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Write(e.to_string())
    }
}

impl Error {
    /// Whether the error ends only the requesting session, not the server.
    pub fn is_session_scoped(&self) -> bool {
        !matches!(self, Error::Fatal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = Error::AlreadyPublishing("live/cam1".into());
        assert_eq!(
            err.to_string(),
            "someone is already publishing to path 'live/cam1'"
        );

        let err = Error::ReaderOverflow(64);
        assert_eq!(err.to_string(), "reader queue of 64 elements is full");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: Error = io.into();
        assert!(matches!(err, Error::Write(_)));
    }

    #[test]
    fn test_session_scoped() {
        assert!(Error::Terminated.is_session_scoped());
        assert!(!Error::Fatal("bind failed".into()).is_session_scoped());
    }
}
