//! Error types for the fetcher library.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while listing or downloading files.
#[derive(Error, Debug)]
pub enum Error {
    /// DNS, connect or timeout failure talking to a remote source.
    #[error("Source unreachable: {url}: {reason}")]
    SourceUnreachable {
        /// URL that could not be reached.
        url: String,
        /// Underlying transport error text.
        reason: String,
    },

    /// The remote answered with a non-success HTTP status.
    #[error("HTTP {status} from {url}")]
    Status {
        /// URL that was requested.
        url: String,
        /// HTTP status code.
        status: u16,
    },

    /// A ranged request starting past byte 0 was answered with the whole
    /// body, so the server does not actually honour ranges.
    #[error("Server ignored Range request for {url}")]
    RangeIgnored {
        /// URL that was requested.
        url: String,
    },

    /// A listing page or API response had an unexpected shape.
    #[error("Parse error: {0}")]
    Parse(String),

    /// The destination tree could not be created or written.
    #[error("Filesystem error at {}: {source}", path.display())]
    Filesystem {
        /// Path being created or written.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// I/O error outside the destination tree (protocol files, cache).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),

    /// No platform with the requested identifier is configured.
    #[error("Platform {0} not supported")]
    UnknownPlatform(String),

    /// A source or reference could not be turned into a URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// HTTP transport error after the connection was established.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A bounded wait ran out.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The operation was cancelled cooperatively.
    #[error("Cancelled")]
    Cancelled,
}

impl Error {
    /// Wraps an I/O error that happened on a destination path.
    pub fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Whether a chunk attempt that failed with this error may be retried.
    ///
    /// Connection problems, timeouts, 5xx and 429 are transient; every other
    /// 4xx and all filesystem errors fail immediately.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SourceUnreachable { .. } | Self::Timeout(_) | Self::Http(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// A specialized `Result` type for fetcher operations.
pub type Result<T> = std::result::Result<T, Error>;
