//! Scripted transport for unit tests.

use crate::core::error::{CouchError, Result};
use crate::core::traits::{CouchNetwork, StreamingResponse};
use crate::core::types::{CouchRequest, CouchResponse};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

type ErrorFn = Box<dyn Fn() -> CouchError + Send + Sync>;

/// One scripted reply, consumed by the next request.
pub(crate) enum Scripted {
    Response(CouchResponse, Option<Duration>),
    Error(ErrorFn),
    Stream {
        status: u16,
        chunks: Vec<Bytes>,
        /// Keep the body open after the last chunk instead of ending it.
        hold_open: bool,
    },
    /// Never answers.
    Hang,
}

impl Scripted {
    pub(crate) fn response(response: CouchResponse) -> Self {
        Scripted::Response(response, None)
    }

    pub(crate) fn delayed(response: CouchResponse, delay: Duration) -> Self {
        Scripted::Response(response, Some(delay))
    }

    pub(crate) fn error<F>(f: F) -> Self
    where
        F: Fn() -> CouchError + Send + Sync + 'static,
    {
        Scripted::Error(Box::new(f))
    }

    pub(crate) fn stream(status: u16, chunks: &[&str]) -> Self {
        Scripted::Stream {
            status,
            chunks: chunks.iter().map(|c| Bytes::copy_from_slice(c.as_bytes())).collect(),
            hold_open: false,
        }
    }

    pub(crate) fn held_stream(status: u16, chunks: &[&str]) -> Self {
        match Self::stream(status, chunks) {
            Scripted::Stream { status, chunks, .. } => Scripted::Stream {
                status,
                chunks,
                hold_open: true,
            },
            other => other,
        }
    }
}

pub(crate) struct ScriptedNetwork {
    script: Mutex<VecDeque<Scripted>>,
    fallback: Option<Box<dyn Fn() -> Scripted + Send + Sync>>,
    requests: Mutex<Vec<CouchRequest>>,
}

impl ScriptedNetwork {
    pub(crate) fn new(script: Vec<Scripted>) -> Arc<Self> {
        Arc::new(ScriptedNetwork {
            script: Mutex::new(script.into()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Plays `script`, then answers every further request with `fallback()`.
    pub(crate) fn then_always<F>(script: Vec<Scripted>, fallback: F) -> Arc<Self>
    where
        F: Fn() -> Scripted + Send + Sync + 'static,
    {
        Arc::new(ScriptedNetwork {
            script: Mutex::new(script.into()),
            fallback: Some(Box::new(fallback)),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn requests(&self) -> Vec<CouchRequest> {
        self.requests.lock().clone()
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    fn next(&self, request: CouchRequest) -> Option<Scripted> {
        self.requests.lock().push(request);
        let scripted = self.script.lock().pop_front();
        scripted.or_else(|| self.fallback.as_ref().map(|f| f()))
    }
}

#[async_trait]
impl CouchNetwork for ScriptedNetwork {
    async fn send(&self, request: CouchRequest) -> Result<CouchResponse> {
        match self.next(request) {
            Some(Scripted::Response(response, delay)) => {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(response)
            }
            Some(Scripted::Error(f)) => Err(f()),
            Some(Scripted::Stream { status, chunks, .. }) => {
                let body: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
                Ok(CouchResponse::new(status, body))
            }
            Some(Scripted::Hang) => futures::future::pending().await,
            None => Err(CouchError::Transport("script exhausted".into())),
        }
    }

    async fn open_stream(&self, request: CouchRequest) -> Result<StreamingResponse> {
        match self.next(request) {
            Some(Scripted::Response(response, delay)) => {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                let body = response.body.clone();
                Ok(StreamingResponse {
                    status: response.status,
                    headers: response.headers,
                    body: futures::stream::iter(vec![Ok(body)]).boxed(),
                })
            }
            Some(Scripted::Error(f)) => Err(f()),
            Some(Scripted::Stream {
                status,
                chunks,
                hold_open,
            }) => {
                let chunks = futures::stream::iter(chunks.into_iter().map(Ok));
                let body = if hold_open {
                    chunks.chain(futures::stream::pending()).boxed()
                } else {
                    chunks.boxed()
                };
                Ok(StreamingResponse {
                    status,
                    headers: BTreeMap::new(),
                    body,
                })
            }
            Some(Scripted::Hang) => futures::future::pending().await,
            None => Err(CouchError::Transport("script exhausted".into())),
        }
    }
}
