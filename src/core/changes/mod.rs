//! Database change feeds.
//!
//! A [`ChangeTracker`] follows `<db>/_changes` in one of three [`FeedMode`]s
//! and reports each entry to a [`ChangeClient`]. Connections that fail or end
//! are re-issued from the last sequence number seen, so a client sees every
//! change at least once across reconnects.
//!
//! # Examples
//!
//! ```no_run
//! # async fn demo() -> couch_rs::Result<()> {
//! use couch_rs::changes::{ChangeEvent, ChangeTracker, ChannelClient, FeedMode, TrackerConfig};
//! use couch_rs::CouchClient;
//! use std::sync::Arc;
//!
//! let db = CouchClient::new().resource("http://localhost:5984/recipes")?;
//! let (client, events) = ChannelClient::new();
//! let tracker = ChangeTracker::new(db, Arc::new(client), TrackerConfig::new(FeedMode::Continuous));
//! tracker.start();
//!
//! while let Ok(event) = events.recv().await {
//!     match event {
//!         ChangeEvent::Change(change) => println!("{} -> {}", change.seq, change.id),
//!         ChangeEvent::Stopped(error) => {
//!             eprintln!("feed stopped: {:?}", error);
//!             break;
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod client;
mod parser;
mod tracker;

pub use client::{ChangeClient, ChangeEvent, ChannelClient};
pub use parser::ChangeParser;
pub use tracker::ChangeTracker;

use crate::core::client::RetryConfig;
use std::collections::BTreeMap;
use std::time::Duration;

/// How the `_changes` feed is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FeedMode {
    /// One request, one `{"results": [...]}` body, then the tracker stops.
    OneShot,
    /// Like one-shot, but the server holds the request until something
    /// changes. The tracker re-issues it after every response.
    LongPoll,
    /// One change per line on a connection that stays open.
    #[default]
    Continuous,
}

impl FeedMode {
    /// Value of the `feed` query parameter.
    pub fn as_query(&self) -> &'static str {
        match self {
            FeedMode::OneShot => "normal",
            FeedMode::LongPoll => "longpoll",
            FeedMode::Continuous => "continuous",
        }
    }
}

impl std::fmt::Display for FeedMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_query())
    }
}

impl std::str::FromStr for FeedMode {
    type Err = crate::core::error::CouchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "normal" | "oneshot" | "one-shot" => Ok(FeedMode::OneShot),
            "longpoll" | "long-poll" => Ok(FeedMode::LongPoll),
            "continuous" => Ok(FeedMode::Continuous),
            other => Err(crate::core::error::CouchError::Usage(format!(
                "unknown feed mode: {}",
                other
            ))),
        }
    }
}

/// Tracker lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Stopped,
    Connecting,
    /// Response headers received, reading the body.
    Streaming,
    /// Waiting out the backoff delay after a failure.
    RetryWait,
}

/// Settings for a [`ChangeTracker`].
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub mode: FeedMode,
    /// Sequence number to start from.
    pub since: u64,
    /// Sequence token to start from, for servers whose sequences are not
    /// plain numbers. Sent in place of `since` when set.
    pub since_token: Option<String>,
    /// Filter function name, e.g. `app/important`.
    pub filter: Option<String>,
    /// Extra query parameters passed to the filter.
    pub filter_params: BTreeMap<String, String>,
    pub include_docs: bool,
    /// Server heartbeat interval. Also arms idle detection on the connection.
    /// Not sent for one-shot feeds.
    pub heartbeat: Option<Duration>,
    /// Consecutive failed attempts after which the tracker gives up.
    pub max_retries: u32,
    /// Backoff between attempts. Its own `max_retries` is ignored.
    pub retry: RetryConfig,
}

impl TrackerConfig {
    pub fn new(mode: FeedMode) -> Self {
        TrackerConfig {
            mode,
            ..Default::default()
        }
    }

    pub fn with_since(mut self, since: u64) -> Self {
        self.since = since;
        self
    }

    pub fn with_since_token(mut self, token: impl Into<String>) -> Self {
        self.since_token = Some(token.into());
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_filter_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.filter_params.insert(key.into(), value.into());
        self
    }

    pub fn with_include_docs(mut self, include: bool) -> Self {
        self.include_docs = include;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Option<Duration>) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Backoff policy that allows exactly `max_retries` failed attempts.
    pub(crate) fn effective_retry(&self) -> RetryConfig {
        self.retry
            .clone()
            .with_max_retries(self.max_retries.saturating_sub(1))
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            mode: FeedMode::Continuous,
            since: 0,
            since_token: None,
            filter: None,
            filter_params: BTreeMap::new(),
            include_docs: false,
            heartbeat: Some(Duration::from_secs(30)),
            max_retries: 6,
            retry: RetryConfig::default(),
        }
    }
}
