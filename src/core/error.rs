//! Error types for CouchDB REST operations.
//!
//! This module defines every failure an [`Operation`](crate::core::client::Operation)
//! or a [`ChangeTracker`](crate::core::changes::ChangeTracker) can surface.
//! The [`Result`] type alias provides a convenient shorthand for fallible calls.
//!
//! # Error Categories
//!
//! | Category | Variants | Retryable |
//! |----------|----------|-----------|
//! | Transport | `Transport`, `Io`, `Timeout` | Yes |
//! | HTTP status | `Status` | 502/503/504 only |
//! | Parse | `BodyParse`, `Json` | No (tracker retries the connection) |
//! | Authentication | `Unauthorized` | No |
//! | Cancellation | `Cancelled` | No |
//! | Misuse | `Usage`, `InvalidUrl`, `Config` | No |
//!
//! # Examples
//!
//! ```
//! use couch_rs::CouchError;
//!
//! let err = CouchError::status(404);
//! assert_eq!(err.status_code(), Some(404));
//! assert!(!err.is_retryable());
//!
//! assert!(CouchError::Timeout.is_retryable());
//! ```

use std::io;
use thiserror::Error;

/// Result type for CouchDB REST operations.
pub type Result<T> = std::result::Result<T, CouchError>;

/// Errors that can occur while talking to a CouchDB server.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CouchError {
    /// Lower-level network failure: DNS, refused connection, reset.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Network I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The request or an idle change feed timed out.
    #[error("Operation timed out")]
    Timeout,

    /// The server answered with a status of 300 or greater.
    #[error("HTTP {status}: {reason}")]
    Status { status: u16, reason: String },

    /// Authentication kept failing after a credential was supplied.
    #[error("Authentication failed (HTTP {0})")]
    Unauthorized(u16),

    /// A response body could not be understood.
    #[error("Body parse error: {0}")]
    BodyParse(String),

    /// JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The operation was cancelled or the tracker was stopped.
    #[error("Operation cancelled")]
    Cancelled,

    /// The API was used in a way that breaks one of its ownership rules.
    #[error("Usage error: {0}")]
    Usage(String),

    /// A URL could not be built or parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CouchError {
    /// Builds a [`CouchError::Status`] with the canonical reason phrase.
    pub fn status(status: u16) -> Self {
        let reason = reqwest::StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Unknown")
            .to_string();
        CouchError::Status { status, reason }
    }

    /// HTTP status carried by this error, if any.
    #[inline]
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match self {
            CouchError::Status { status, .. } => Some(*status),
            CouchError::Unauthorized(status) => Some(*status),
            _ => None,
        }
    }

    /// Check if this error is transient.
    ///
    /// Returns `true` for transport failures, timeouts, I/O errors and
    /// HTTP 502, 503 and 504.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            CouchError::Transport(_) | CouchError::Timeout | CouchError::Io(_) => true,
            CouchError::Status { status, .. } => matches!(status, 502 | 503 | 504),
            _ => false,
        }
    }

    /// Check if this is an authentication challenge or failure.
    #[inline]
    #[must_use]
    pub fn is_access_denied(&self) -> bool {
        match self {
            CouchError::Status { status, .. } => matches!(status, 401 | 407),
            CouchError::Unauthorized(_) => true,
            _ => false,
        }
    }

    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CouchError::Cancelled)
    }

    /// An owned copy, for handing out errors that are stored behind an `Arc`.
    ///
    /// Wrapped `io` and `serde_json` errors are rebuilt from their message.
    pub fn duplicate(&self) -> CouchError {
        match self {
            CouchError::Transport(msg) => CouchError::Transport(msg.clone()),
            CouchError::Io(e) => CouchError::Io(io::Error::new(e.kind(), e.to_string())),
            CouchError::Timeout => CouchError::Timeout,
            CouchError::Status { status, reason } => CouchError::Status {
                status: *status,
                reason: reason.clone(),
            },
            CouchError::Unauthorized(status) => CouchError::Unauthorized(*status),
            CouchError::BodyParse(msg) => CouchError::BodyParse(msg.clone()),
            CouchError::Json(e) => CouchError::BodyParse(e.to_string()),
            CouchError::Cancelled => CouchError::Cancelled,
            CouchError::Usage(msg) => CouchError::Usage(msg.clone()),
            CouchError::InvalidUrl(msg) => CouchError::InvalidUrl(msg.clone()),
            CouchError::Config(msg) => CouchError::Config(msg.clone()),
        }
    }
}

impl From<reqwest::Error> for CouchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CouchError::Timeout
        } else {
            CouchError::Transport(err.to_string())
        }
    }
}

impl From<url::ParseError> for CouchError {
    fn from(err: url::ParseError) -> Self {
        CouchError::InvalidUrl(err.to_string())
    }
}
