//! A single HTTP request/response exchange.
//!
//! An [`Operation`] can be consumed asynchronously, by registering callbacks
//! with [`Operation::on_completion`], or "synchronously" by awaiting
//! [`Operation::wait`] or any of the response accessors, which wait for
//! completion first.
//!
//! # Lifecycle
//!
//! ```text
//! Unsent --start()--> Loading --response/error/cancel()--> Complete
//! ```
//!
//! Transitions never go backward. Once complete, status, headers, body and
//! error are fixed. At most one network exchange is in flight at a time;
//! automatic retries happen inside the `Loading` state and are counted by
//! [`Operation::retry_count`].
//!
//! Starting an operation spawns a task, so it must happen inside a Tokio
//! runtime.

use crate::core::client::config::ClientConfig;
use crate::core::client::retry::{RetryDecision, RetryState};
use crate::core::client::utils;
use crate::core::error::{CouchError, Result};
use crate::core::resource::Resource;
use crate::core::traits::CouchNetwork;
use crate::core::types::{Body, CouchRequest, CouchResponse, Method};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use url::Url;

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

/// Callback run once an operation completes.
pub type OnComplete = Box<dyn FnOnce() + Send + 'static>;

/// Lifecycle phase of an [`Operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OperationState {
    Unsent,
    Loading,
    Complete,
}

/// Represents an HTTP request to a [`Resource`], and its response.
#[derive(Clone)]
pub struct Operation {
    inner: Arc<OperationInner>,
}

struct OperationInner {
    id: u64,
    resource: Arc<Resource>,
    network: Arc<dyn CouchNetwork>,
    config: Arc<ClientConfig>,
    state: Mutex<OperationData>,
    done: watch::Sender<bool>,
}

struct OperationData {
    phase: OperationState,
    request: CouchRequest,
    retry_count: u32,
    status: u16,
    response_headers: BTreeMap<String, String>,
    body: Option<Body>,
    error: Option<Arc<CouchError>>,
    result_object: Option<Value>,
    on_completes: Vec<OnComplete>,
    /// Set by whichever of the task and `cancel` gets to complete first.
    finishing: bool,
    callbacks_ran: bool,
    task: Option<JoinHandle<()>>,
}

/// What the network exchange produced, before it is turned into operation state.
struct Outcome {
    result: Result<CouchResponse>,
    used_credential: bool,
}

impl Operation {
    /// Creates an operation without starting it.
    ///
    /// Call [`start`](Self::start), [`wait`](Self::wait) or any awaiting
    /// accessor to send it.
    pub fn new(resource: Arc<Resource>, request: CouchRequest) -> Self {
        let client = resource.client();
        let (done, _) = watch::channel(false);
        Operation {
            inner: Arc::new(OperationInner {
                id: NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed),
                network: client.network().clone(),
                config: client.config_arc(),
                resource,
                state: Mutex::new(OperationData {
                    phase: OperationState::Unsent,
                    request,
                    retry_count: 0,
                    status: 0,
                    response_headers: BTreeMap::new(),
                    body: None,
                    error: None,
                    result_object: None,
                    on_completes: Vec::new(),
                    finishing: false,
                    callbacks_ran: false,
                    task: None,
                }),
                done,
            }),
        }
    }

    /// Process-unique identifier.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The resource that created this operation.
    pub fn resource(&self) -> &Arc<Resource> {
        &self.inner.resource
    }

    /// Target URL. May carry query parameters the resource's URL doesn't.
    pub fn url(&self) -> Url {
        self.inner.state.lock().request.url.clone()
    }

    /// Last component of the URL's path.
    pub fn name(&self) -> String {
        let url = self.url();
        url.path_segments()
            .and_then(|mut segments| segments.next_back().map(str::to_string))
            .unwrap_or_default()
    }

    pub fn method(&self) -> Method {
        self.inner.state.lock().request.method
    }

    /// Snapshot of the request as it will be (or was first) sent.
    pub fn request(&self) -> CouchRequest {
        self.inner.state.lock().request.clone()
    }

    pub fn is_read_only(&self) -> bool {
        self.method().is_read_only()
    }

    pub fn is_get(&self) -> bool {
        self.method() == Method::Get
    }

    pub fn is_put(&self) -> bool {
        self.method() == Method::Put
    }

    pub fn is_post(&self) -> bool {
        self.method() == Method::Post
    }

    pub fn is_delete(&self) -> bool {
        self.method() == Method::Delete
    }

    /// Sets a request header. Fails once the operation has started.
    pub fn set_header(&self, name: &str, value: &str) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.phase != OperationState::Unsent {
            return Err(CouchError::Usage(
                "cannot change headers of a started operation".to_string(),
            ));
        }
        state.request.headers.insert(name.to_string(), value.to_string());
        Ok(())
    }

    /// Replaces the request body. Fails once the operation has started.
    pub fn set_request_body(&self, body: impl Into<bytes::Bytes>) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.phase != OperationState::Unsent {
            return Err(CouchError::Usage(
                "cannot change the body of a started operation".to_string(),
            ));
        }
        state.request.body = body.into();
        Ok(())
    }

    // ---------------------------------------------------------------- loading

    /// Sends the request. Later calls do nothing.
    pub fn start(&self) -> &Self {
        let mut state = self.inner.state.lock();
        if state.phase != OperationState::Unsent {
            return self;
        }
        state.phase = OperationState::Loading;
        let request = state.request.clone();
        self.log_request(&request);
        self.inner.resource.operation_did_start(self);

        let op = self.clone();
        state.task = Some(tokio::spawn(async move {
            let outcome = op.perform(request).await;
            op.complete(outcome);
        }));
        self
    }

    /// Registers `on_complete` to run when the operation finishes.
    ///
    /// Callbacks run in registration order, exactly once. Returns `true` if the
    /// operation had already finished and the callback has been run before
    /// this method returns, `false` if it will run later.
    pub fn on_completion<F>(&self, on_complete: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.inner.state.lock();
            if !state.callbacks_ran {
                state.on_completes.push(Box::new(on_complete));
                return false;
            }
        }
        on_complete();
        true
    }

    /// Waits until the operation is complete, starting it if needed.
    ///
    /// Pending completion callbacks have run by the time this returns.
    /// Returns `true` on success.
    pub async fn wait(&self) -> bool {
        self.start();
        let mut done = self.inner.done.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = done.wait_for(|finished| *finished).await;
        self.inner.state.lock().error.is_none()
    }

    /// Waits for all `operations`; `true` if every one succeeded.
    pub async fn wait_all(operations: &[Operation]) -> bool {
        let results = futures::future::join_all(operations.iter().map(|op| op.wait())).await;
        results.into_iter().all(|ok| ok)
    }

    /// Stops the operation, completing it with [`CouchError::Cancelled`].
    ///
    /// Has no effect once the operation is complete.
    pub fn cancel(&self) {
        let task = {
            let mut state = self.inner.state.lock();
            if state.finishing {
                return;
            }
            state.task.take()
        };
        if let Some(task) = task {
            task.abort();
        }
        self.complete(Outcome {
            result: Err(CouchError::Cancelled),
            used_credential: false,
        });
    }

    // --------------------------------------------------------------- response

    pub fn state(&self) -> OperationState {
        self.inner.state.lock().phase
    }

    pub fn is_complete(&self) -> bool {
        self.state() == OperationState::Complete
    }

    /// The terminal error, or `None`. Does not wait.
    pub fn error(&self) -> Option<Arc<CouchError>> {
        self.inner.state.lock().error.clone()
    }

    /// Automatic retries performed so far.
    pub fn retry_count(&self) -> u32 {
        self.inner.state.lock().retry_count
    }

    /// `true` if there is no error and the status is below 300.
    pub async fn is_successful(&self) -> bool {
        self.wait().await
    }

    /// HTTP status of the response; 0 if a lower-level network error occurred.
    pub async fn http_status(&self) -> u16 {
        self.wait().await;
        self.inner.state.lock().status
    }

    /// Response headers, lowercase names.
    pub async fn response_headers(&self) -> BTreeMap<String, String> {
        self.wait().await;
        self.inner.state.lock().response_headers.clone()
    }

    /// Response body with its entity headers.
    pub async fn response_body(&self) -> Option<Body> {
        self.wait().await;
        self.inner.state.lock().body.clone()
    }

    /// Application value associated with the response. Does not wait.
    pub fn result_object(&self) -> Option<Value> {
        self.inner.state.lock().result_object.clone()
    }

    pub fn set_result_object(&self, value: Option<Value>) {
        self.inner.state.lock().result_object = value;
    }

    /// Status and headers if complete, without waiting.
    pub(crate) fn completed_response(&self) -> Option<(u16, BTreeMap<String, String>)> {
        let state = self.inner.state.lock();
        (state.phase == OperationState::Complete)
            .then(|| (state.status, state.response_headers.clone()))
    }

    /// Human-readable log of the request and, if complete, the response.
    pub fn dump(&self) -> String {
        let state = self.inner.state.lock();
        let mut out = String::new();
        let _ = writeln!(out, ">>> {} {}", state.request.method, state.request.url);
        for (k, v) in &state.request.headers {
            let _ = writeln!(out, "    {}: {}", k, v);
        }
        if !state.request.body.is_empty() {
            let _ = writeln!(out, "    [{} bytes]", state.request.body.len());
        }
        match state.phase {
            OperationState::Complete => {
                let _ = writeln!(out, "<<< {}", state.status);
                for (k, v) in &state.response_headers {
                    let _ = writeln!(out, "    {}: {}", k, v);
                }
                if let Some(body) = &state.body {
                    let _ = writeln!(out, "    {}", body.as_string());
                }
                if let Some(error) = &state.error {
                    let _ = writeln!(out, "!!! {}", error);
                }
            }
            phase => {
                let _ = writeln!(out, "... {:?}", phase);
            }
        }
        out
    }

    // --------------------------------------------------------------- internal

    async fn perform(&self, mut request: CouchRequest) -> Outcome {
        let mut retry = RetryState::new(self.inner.config.retry_config());
        let mut used_credential = request.credential.is_some();

        loop {
            let result = self.inner.network.send(request.clone()).await;

            let decision = match &result {
                Ok(response) if matches!(response.status, 401 | 407) => {
                    if !used_credential {
                        if let Some(credential) = self.inner.resource.credential() {
                            tracing::debug!(
                                "{} {} answered {}, retrying with credential",
                                request.method,
                                request.url,
                                response.status
                            );
                            request.credential = Some(credential);
                            used_credential = true;
                            continue;
                        }
                    }
                    RetryDecision::DontRetry
                }
                Ok(response) => retry.should_retry_status(response.status),
                Err(error) => retry.should_retry_error(error),
            };

            match decision {
                RetryDecision::Retry(delay) => {
                    self.inner.state.lock().retry_count = retry.attempts;
                    match &result {
                        Ok(response) => tracing::warn!(
                            "{} {} returned {} (attempt {}), retrying after {:?}",
                            request.method,
                            request.url,
                            response.status,
                            retry.attempts,
                            delay
                        ),
                        Err(e) => tracing::warn!(
                            "{} {} failed (attempt {}), retrying after {:?}: {}",
                            request.method,
                            request.url,
                            retry.attempts,
                            delay,
                            e
                        ),
                    }
                    utils::sleep(delay).await;
                }
                RetryDecision::DontRetry => {
                    return Outcome {
                        result,
                        used_credential,
                    }
                }
            }
        }
    }

    /// Moves the operation to `Complete` and runs callbacks. First caller wins.
    fn complete(&self, outcome: Outcome) {
        {
            let mut state = self.inner.state.lock();
            if state.finishing {
                return;
            }
            state.finishing = true;
        }

        let (status, headers, body, error) = match outcome.result {
            Ok(response) => {
                let error = if response.status >= 300 {
                    if matches!(response.status, 401 | 407) && outcome.used_credential {
                        Some(CouchError::Unauthorized(response.status))
                    } else {
                        Some(CouchError::status(response.status))
                    }
                } else {
                    None
                };
                let body = Body::new(response.body, &response.headers);
                (response.status, response.headers, Some(body), error)
            }
            Err(error) => (0, BTreeMap::new(), None, Some(error)),
        };

        let error = self
            .inner
            .resource
            .operation_will_complete(self, status, &headers, body.as_ref(), error);

        {
            let mut state = self.inner.state.lock();
            state.phase = OperationState::Complete;
            state.status = status;
            state.response_headers = headers;
            state.body = body;
            state.error = error.map(Arc::new);
            state.task = None;
        }

        self.log_response();
        self.inner.resource.operation_did_complete(self);

        // Callbacks registered while earlier ones run are picked up in order.
        loop {
            let batch = {
                let mut state = self.inner.state.lock();
                if state.on_completes.is_empty() {
                    state.callbacks_ran = true;
                    break;
                }
                std::mem::take(&mut state.on_completes)
            };
            for callback in batch {
                callback();
            }
        }

        self.inner.done.send_replace(true);
    }

    fn log_request(&self, request: &CouchRequest) {
        let config = &self.inner.config;
        if config.logs_urls() {
            tracing::info!("{} {}", request.method, request.url);
        } else {
            tracing::debug!("{} {}", request.method, request.url);
        }
        if config.logs_headers() {
            for (k, v) in &request.headers {
                tracing::info!("    {}: {}", k, v);
            }
        }
    }

    fn log_response(&self) {
        let config = &self.inner.config;
        if !config.logs_urls() {
            return;
        }
        let state = self.inner.state.lock();
        match &state.error {
            Some(error) => tracing::info!(
                "{} {} -> {} ({})",
                state.request.method,
                state.request.url,
                state.status,
                error
            ),
            None => tracing::info!(
                "{} {} -> {}",
                state.request.method,
                state.request.url,
                state.status
            ),
        }
        if config.logs_headers() {
            for (k, v) in &state.response_headers {
                tracing::info!("    {}: {}", k, v);
            }
        }
    }
}

impl PartialEq for Operation {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Operation {}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Operation")
            .field("id", &self.inner.id)
            .field("method", &state.request.method)
            .field("url", &state.request.url.as_str())
            .field("phase", &state.phase)
            .field("status", &state.status)
            .finish()
    }
}
