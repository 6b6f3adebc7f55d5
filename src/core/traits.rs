use crate::core::error::Result;
use crate::core::types::{CouchRequest, CouchResponse};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::collections::BTreeMap;

/// Body of a response that is still arriving.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// A response whose head has arrived but whose body is read incrementally.
pub struct StreamingResponse {
    pub status: u16,
    /// Lowercase header names.
    pub headers: BTreeMap<String, String>,
    pub body: ByteStream,
}

impl StreamingResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl std::fmt::Debug for StreamingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Abstraction for the HTTP transport.
///
/// [`NativeNetwork`](crate::core::client::NativeNetwork) is the production
/// implementation; tests plug in scripted transports.
#[async_trait]
pub trait CouchNetwork: Send + Sync + 'static {
    /// Perform a request and buffer the whole response body.
    async fn send(&self, request: CouchRequest) -> Result<CouchResponse>;

    /// Perform a request and hand back the body as a stream of chunks.
    async fn open_stream(&self, request: CouchRequest) -> Result<StreamingResponse>;
}
