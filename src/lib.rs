//! couch_rs: the REST core of a CouchDB client.
//!
//! - **Operations**: asynchronous HTTP exchanges with retries, auth challenges
//!   and ordered completion callbacks.
//! - **Resources**: a URL tree that hands credentials down to children.
//! - **Change tracking**: one-shot, long-poll and continuous `_changes` feeds
//!   that reconnect from their last checkpoint.

pub mod core;

// Top-level re-exports for common usage
pub use crate::core::changes;
pub use crate::core::client;
pub use crate::core::error::{CouchError, Result};
pub use crate::core::types;

pub use crate::core::changes::{
    ChangeClient, ChangeEvent, ChangeParser, ChangeTracker, ChannelClient, FeedMode, TrackerConfig,
    TrackerState,
};
pub use crate::core::client::{
    ClientConfig, CouchClient, LogLevel, NativeNetwork, Operation, OperationState, RetryConfig,
};
pub use crate::core::database::Database;
pub use crate::core::resource::{Resource, ResourceCache};
pub use crate::core::traits::{ByteStream, CouchNetwork, StreamingResponse};
pub use crate::core::types::{
    Body, Change, ChangesBatch, CouchRequest, CouchResponse, Credential, Method,
};
