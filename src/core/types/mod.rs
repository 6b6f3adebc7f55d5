//! Core data types for the CouchDB REST layer.

mod body;
pub(crate) mod change;
mod credential;
mod request;
mod response;

pub use body::Body;
pub use bytes::Bytes;
pub use change::{Change, ChangesBatch, RevisionRef};
pub use credential::Credential;
pub use request::{CouchRequest, Method};
pub use response::CouchResponse;
