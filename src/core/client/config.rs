//! Configuration for the CouchDB client.
//!
//! This module defines the [`ClientConfig`] struct that controls how
//! [`Operation`](super::Operation)s are sent: retry policy, timeouts and
//! request logging.
//!
//! # Configuration Options
//!
//! | Option | Default | Description |
//! |--------|---------|-------------|
//! | `max_retries` | 2 | Automatic retries on transient transport failures |
//! | `retry_delay_ms` | 250 | Base delay between retries |
//! | `request_timeout_ms` | 30000 | Timeout for buffered requests |
//! | `connection_timeout_secs` | 30 | Connection establishment timeout |
//! | `log_level` | `Nothing` | Per-request logging detail |
//!
//! # Examples
//!
//! ```
//! use couch_rs::{ClientConfig, LogLevel};
//!
//! let config = ClientConfig {
//!     max_retries: 5,
//!     log_level: LogLevel::RequestUrls,
//!     ..Default::default()
//! };
//! assert_eq!(config.retry_delay_ms, 250);
//! ```

use crate::core::client::retry::RetryConfig;
use std::time::Duration;

/// How much of each request gets logged through `tracing`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    #[default]
    Nothing,
    /// Method and URL of every request, status of every response.
    RequestUrls,
    /// Also request and response headers.
    RequestHeaders,
}

/// Configuration for the CouchDB client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    /// Retries for transient failures (transport errors, 502/503/504).
    pub max_retries: u32,

    /// Base retry delay in milliseconds.
    ///
    /// Later retries wait longer, up to four times this value.
    pub retry_delay_ms: u64,

    /// Request timeout in milliseconds for buffered requests.
    ///
    /// Change feeds are not subject to it; they use heartbeat idle detection.
    pub request_timeout_ms: u64,

    /// Connection timeout in seconds.
    pub connection_timeout_secs: u64,

    /// Request logging detail.
    pub log_level: LogLevel,

    /// Proxy URL (optional).
    pub proxy_url: String,

    /// `User-Agent` sent with every request.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            max_retries: 2,
            retry_delay_ms: 250,
            request_timeout_ms: 30000,
            connection_timeout_secs: 30,
            log_level: LogLevel::Nothing,
            proxy_url: String::new(),
            user_agent: concat!("couch_rs/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl ClientConfig {
    /// Retry policy used by operations.
    pub fn retry_config(&self) -> RetryConfig {
        let initial = Duration::from_millis(self.retry_delay_ms);
        RetryConfig::default()
            .with_max_retries(self.max_retries)
            .with_initial_backoff(initial)
            .with_backoff_step(initial)
            .with_max_backoff(initial * 4)
    }

    #[inline]
    pub fn logs_urls(&self) -> bool {
        self.log_level >= LogLevel::RequestUrls
    }

    #[inline]
    pub fn logs_headers(&self) -> bool {
        self.log_level >= LogLevel::RequestHeaders
    }
}
