use std::time::Duration;

use thiserror::Error;

/// Failure talking to the media server.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("media server returned status {0}")]
    Status(u16),
    #[error("fetch aborted after {0:?}")]
    Timeout(Duration),
    #[error("invalid stream url: {0}")]
    Url(String),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

/// Failure reported by a tag parser.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The tag extends past the bytes that were loaded. Reading more of the
    /// file may succeed.
    #[error("tag needs {needed} bytes but only {available} were loaded")]
    Truncated { needed: usize, available: usize },
    #[error("no tag found")]
    NoTag,
    #[error("malformed tag: {0}")]
    Malformed(String),
    /// The parser went away without invoking either callback.
    #[error("parser dropped its callbacks")]
    Abandoned,
}

impl ParseError {
    pub fn is_truncated(&self) -> bool {
        matches!(self, ParseError::Truncated { .. })
    }
}

/// Everything that can stop a single tag read. None of these reach callers of
/// the queue; they are logged and turned into a `None` result.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("backlog full ({0} waiting)")]
    Saturated(usize),
    #[error("{kind} fetch failed: {source}")]
    Fetch {
        kind: &'static str,
        #[source]
        source: FetchError,
    },
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("parse timed out after {0:?}")]
    ParseTimeout(Duration),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ReadError {
    pub(crate) fn fetch(kind: &'static str, source: FetchError) -> Self {
        ReadError::Fetch { kind, source }
    }
}

/// Rejected queue settings.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_concurrent must be between 1 and {max}, got {got}")]
    Concurrency { got: usize, max: usize },
    #[error("max_backlog must be at least 1")]
    Backlog,
}
