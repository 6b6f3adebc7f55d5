//! CouchDB REST core.
//!
//! # Modules
//!
//! - [`client`] - client handle, transport, retry policy and [`Operation`]s
//! - [`resource`] - URL tree of [`Resource`]s and the [`ResourceCache`]
//! - [`changes`] - `_changes` feed parsing and the [`ChangeTracker`]
//! - [`database`] - [`Database`] handle owning change tracking
//! - [`types`] - requests, responses, bodies, credentials and change entries
//!
//! # Quick Start
//!
//! ```no_run
//! # async fn demo() -> couch_rs::Result<()> {
//! use couch_rs::CouchClient;
//!
//! let client = CouchClient::new();
//! let db = client.database("http://localhost:5984/recipes")?;
//!
//! let batch = db.changes_once(0).await?;
//! for change in &batch.results {
//!     println!("{} {}", change.seq, change.id);
//! }
//! # Ok(())
//! # }
//! ```

pub mod changes;
pub mod client;
pub mod database;
pub mod error;
#[cfg(test)]
pub(crate) mod mock_network;
pub mod resource;
pub mod traits;
pub mod types;

pub use changes::{ChangeClient, ChangeTracker, FeedMode, TrackerConfig, TrackerState};
pub use client::{ClientConfig, CouchClient, LogLevel, Operation, OperationState};
pub use database::Database;
pub use error::{CouchError, Result};
pub use resource::{Resource, ResourceCache};
pub use traits::CouchNetwork;
pub use types::{Body, Change, ChangesBatch, CouchRequest, CouchResponse, Credential, Method};
