//! CouchDB HTTP client: configuration, transport and operations.

mod config;
mod fetch;
pub mod native_network;
mod operation;
pub mod retry;
pub mod utils;

pub use config::{ClientConfig, LogLevel};
pub use fetch::CouchClient;
pub use native_network::NativeNetwork;
pub use operation::{OnComplete, Operation, OperationState};
pub use retry::{RetryConfig, RetryDecision, RetryState};
