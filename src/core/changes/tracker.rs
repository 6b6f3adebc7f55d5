//! The change-feed state machine.
//!
//! ```text
//! Stopped --start()--> Connecting --2xx--> Streaming --end--> Connecting (long-poll, continuous)
//!                          |                   |        \---> Stopped    (one-shot)
//!                          +---- failure ------+--> RetryWait --delay--> Connecting
//!                                                      \--budget spent--> Stopped
//! ```
//!
//! Every `start()` opens a new session. Work belonging to an older session is
//! discarded, which is how `stop()` guarantees silence: it ends the session
//! while holding the same gate callbacks are delivered under.

use super::client::ChangeClient;
use super::parser::ChangeParser;
use super::{FeedMode, TrackerConfig, TrackerState};
use crate::core::client::utils::{idle_timeout, join_path, sleep};
use crate::core::client::{RetryDecision, RetryState};
use crate::core::error::{CouchError, Result};
use crate::core::resource::Resource;
use crate::core::types::{Change, CouchRequest, Credential};
use futures::StreamExt;
use parking_lot::{Mutex, ReentrantMutex};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Follows a database's `_changes` feed and reports entries to a
/// [`ChangeClient`].
///
/// Dropping the tracker stops it.
pub struct ChangeTracker {
    shared: Arc<TrackerShared>,
}

struct TrackerShared {
    database: Arc<Resource>,
    client: Arc<dyn ChangeClient>,
    config: Mutex<TrackerConfig>,
    session: AtomicU64,
    /// Held while callbacks run and while a session is started or ended.
    gate: ReentrantMutex<()>,
    last_seq: AtomicU64,
    /// Server spelling of the checkpoint, when it is not a plain number.
    since_token: Mutex<Option<String>>,
    state: Mutex<TrackerState>,
    retry_count: AtomicU32,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ChangeTracker {
    /// Creates a stopped tracker for `database`, resuming from `config.since`.
    pub fn new(database: Arc<Resource>, client: Arc<dyn ChangeClient>, config: TrackerConfig) -> Self {
        ChangeTracker {
            shared: Arc::new(TrackerShared {
                database,
                client,
                last_seq: AtomicU64::new(config.since),
                since_token: Mutex::new(config.since_token.clone()),
                config: Mutex::new(config),
                session: AtomicU64::new(0),
                gate: ReentrantMutex::new(()),
                state: Mutex::new(TrackerState::Stopped),
                retry_count: AtomicU32::new(0),
                task: Mutex::new(None),
            }),
        }
    }

    /// Starts following the feed from the last sequence number.
    ///
    /// Returns `true` if the tracker is running afterwards, `false` if no feed
    /// URL can be formed for the database. Does nothing if already running.
    /// Must be called inside a Tokio runtime.
    pub fn start(&self) -> bool {
        let shared = &self.shared;
        let _gate = shared.gate.lock();
        if self.is_running() {
            return true;
        }
        if shared.changes_url().is_none() {
            tracing::warn!("Cannot track changes of a resource without a URL");
            return false;
        }

        let session = shared.session.fetch_add(1, Ordering::SeqCst) + 1;
        *shared.state.lock() = TrackerState::Connecting;
        shared.retry_count.store(0, Ordering::SeqCst);
        tracing::info!(
            "Tracking {} changes of {:?} since {}",
            self.mode(),
            shared.database.url().map(|u| u.to_string()),
            self.last_sequence_number()
        );

        let task = tokio::spawn(run(shared.clone(), session));
        *shared.task.lock() = Some(task);
        true
    }

    /// Stops the tracker. No client callback runs after this returns.
    ///
    /// If a callback is running on another thread, waits for it to finish.
    /// Safe to call from inside a callback, and at any time.
    pub fn stop(&self) {
        let task = {
            let _gate = self.shared.gate.lock();
            self.shared.session.fetch_add(1, Ordering::SeqCst);
            let previous = std::mem::replace(&mut *self.shared.state.lock(), TrackerState::Stopped);
            if previous != TrackerState::Stopped {
                tracing::info!("Stopped tracking changes at {}", self.last_sequence_number());
            }
            self.shared.task.lock().take()
        };
        if let Some(task) = task {
            task.abort();
        }
    }

    pub fn state(&self) -> TrackerState {
        *self.shared.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() != TrackerState::Stopped
    }

    /// Consecutive failed attempts so far.
    pub fn retry_count(&self) -> u32 {
        self.shared.retry_count.load(Ordering::SeqCst)
    }

    pub fn last_sequence_number(&self) -> u64 {
        self.shared.last_seq.load(Ordering::SeqCst)
    }

    /// Sets the checkpoint the next connection resumes from. Clears any
    /// sequence token.
    pub fn set_last_sequence_number(&self, seq: u64) {
        self.shared.last_seq.store(seq, Ordering::SeqCst);
        *self.shared.since_token.lock() = None;
    }

    /// The checkpoint as the server spelled it, for servers whose sequences
    /// are not plain numbers. Sent as `since` in place of the number.
    pub fn last_sequence_token(&self) -> Option<String> {
        self.shared.since_token.lock().clone()
    }

    pub fn set_last_sequence_token(&self, token: Option<String>) {
        *self.shared.since_token.lock() = token;
    }

    pub fn mode(&self) -> FeedMode {
        self.shared.config.lock().mode
    }

    pub fn database(&self) -> &Arc<Resource> {
        &self.shared.database
    }

    pub fn filter(&self) -> Option<String> {
        self.shared.config.lock().filter.clone()
    }

    /// Takes effect on the next connection.
    pub fn set_filter(&self, filter: Option<String>) {
        self.shared.config.lock().filter = filter;
    }

    pub fn filter_params(&self) -> BTreeMap<String, String> {
        self.shared.config.lock().filter_params.clone()
    }

    /// Takes effect on the next connection.
    pub fn set_filter_param(&self, key: impl Into<String>, value: impl Into<String>) {
        self.shared
            .config
            .lock()
            .filter_params
            .insert(key.into(), value.into());
    }

    pub fn config(&self) -> TrackerConfig {
        self.shared.config.lock().clone()
    }
}

impl Drop for ChangeTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ChangeTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeTracker")
            .field("database", &self.shared.database.url().map(|u| u.to_string()))
            .field("mode", &self.mode())
            .field("state", &self.state())
            .field("last_seq", &self.last_sequence_number())
            .finish()
    }
}

impl TrackerShared {
    fn is_current(&self, session: u64) -> bool {
        self.session.load(Ordering::SeqCst) == session
    }

    /// Moves to `state` unless `session` has ended.
    fn set_state(&self, session: u64, state: TrackerState) -> bool {
        let _gate = self.gate.lock();
        if !self.is_current(session) {
            return false;
        }
        *self.state.lock() = state;
        true
    }

    fn changes_url(&self) -> Option<url::Url> {
        self.database.url().and_then(|url| join_path(&url, "_changes"))
    }

    fn feed_request(&self, credential: Option<Credential>) -> Result<CouchRequest> {
        let url = self
            .changes_url()
            .ok_or_else(|| CouchError::Usage("database has no URL".into()))?;
        let config = self.config.lock().clone();
        let since = match self.since_token.lock().clone() {
            Some(token) => token,
            None => self.last_seq.load(Ordering::SeqCst).to_string(),
        };

        let mut request = CouchRequest::get(url)
            .with_header("Accept", "application/json")
            .with_query("feed", config.mode.as_query())
            .with_query("since", &since);
        if config.mode != FeedMode::OneShot {
            if let Some(heartbeat) = config.heartbeat {
                request = request.with_query("heartbeat", &heartbeat.as_millis().to_string());
            }
        }
        if config.include_docs {
            request = request.with_query("include_docs", "true");
        }
        if let Some(filter) = &config.filter {
            request = request.with_query("filter", filter);
        }
        for (key, value) in &config.filter_params {
            request = request.with_query(key, value);
        }
        Ok(request.with_credential(credential))
    }

    /// Hands `changes` to the client in order. Returns `false` once the
    /// session has ended, including when a callback stopped the tracker.
    fn deliver(&self, session: u64, changes: Vec<Change>, parser: &ChangeParser) -> bool {
        let _gate = self.gate.lock();
        for change in changes {
            if !self.is_current(session) {
                return false;
            }
            self.last_seq.fetch_max(change.seq, Ordering::SeqCst);
            *self.since_token.lock() = change.seq_token.clone();
            self.client.received_change(&change);
        }
        if !self.is_current(session) {
            return false;
        }
        if let Some(seq) = parser.last_seq() {
            self.last_seq.fetch_max(seq, Ordering::SeqCst);
            *self.since_token.lock() = parser.last_seq_token().map(str::to_string);
        }
        true
    }

    /// Ends `session` on the tracker's own initiative and tells the client.
    fn end_session(&self, session: u64, error: Option<CouchError>) {
        let _gate = self.gate.lock();
        if !self.is_current(session) {
            return;
        }
        self.session.fetch_add(1, Ordering::SeqCst);
        *self.state.lock() = TrackerState::Stopped;
        drop(self.task.lock().take());
        match &error {
            Some(e) => tracing::error!("Change tracking gave up: {}", e),
            None => tracing::info!(
                "Change feed complete at {}",
                self.last_seq.load(Ordering::SeqCst)
            ),
        }
        self.client.tracker_stopped(error.as_ref());
    }
}

async fn within<F: Future>(limit: Option<Duration>, fut: F) -> Result<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| CouchError::Timeout),
        None => Ok(fut.await),
    }
}

async fn run(shared: Arc<TrackerShared>, session: u64) {
    let (mode, idle, retry_config) = {
        let config = shared.config.lock();
        let idle = match config.mode {
            FeedMode::OneShot => None,
            _ => config.heartbeat.map(idle_timeout),
        };
        (config.mode, idle, config.effective_retry())
    };
    let mut retry = RetryState::new(retry_config);
    let mut credential: Option<Credential> = None;

    loop {
        if !shared.set_state(session, TrackerState::Connecting) {
            return;
        }
        let request = match shared.feed_request(credential.clone()) {
            Ok(request) => request,
            Err(e) => {
                shared.end_session(session, Some(e));
                return;
            }
        };
        tracing::debug!("Connecting to {}", request.url);

        let result = read_feed(&shared, session, request, mode, idle, &mut retry).await;
        if !shared.is_current(session) {
            return;
        }

        let error = match result {
            Ok(_) if mode == FeedMode::OneShot => {
                shared.end_session(session, None);
                return;
            }
            Ok(true) => continue,
            Ok(false) => {
                // Only heartbeats, or nothing at all. Not a failure, but no
                // reason to reconnect at once either.
                let delay = retry.current_backoff();
                if !shared.set_state(session, TrackerState::RetryWait) {
                    return;
                }
                tracing::debug!("Change feed closed without data, reconnecting in {:?}", delay);
                sleep(delay).await;
                continue;
            }
            Err(error) => error,
        };

        if error.is_access_denied() {
            if credential.is_none() {
                credential = shared
                    .client
                    .auth_credential()
                    .or_else(|| shared.database.credential());
                if credential.is_some() {
                    tracing::debug!("Change feed needs authentication, retrying with credential");
                    continue;
                }
                shared.end_session(session, Some(error));
            } else {
                let status = error.status_code().unwrap_or(401);
                shared.end_session(session, Some(CouchError::Unauthorized(status)));
            }
            return;
        }

        match retry.record_failure() {
            RetryDecision::Retry(delay) => {
                shared.retry_count.store(retry.attempts, Ordering::SeqCst);
                if !shared.set_state(session, TrackerState::RetryWait) {
                    return;
                }
                tracing::warn!(
                    "Change feed failed (attempt {}), reconnecting in {:?}: {}",
                    retry.attempts,
                    delay,
                    error
                );
                sleep(delay).await;
            }
            RetryDecision::DontRetry => {
                shared.retry_count.store(retry.attempts, Ordering::SeqCst);
                shared.end_session(session, Some(error));
                return;
            }
        }
    }
}

/// One connection: open it, stream the body through the parser, deliver.
/// Returns whether anything in the body parsed.
async fn read_feed(
    shared: &Arc<TrackerShared>,
    session: u64,
    request: CouchRequest,
    mode: FeedMode,
    idle: Option<Duration>,
    retry: &mut RetryState,
) -> Result<bool> {
    let network = shared.database.client().network().clone();
    let response = within(idle, network.open_stream(request)).await??;
    if !(200..300).contains(&response.status) {
        return Err(CouchError::status(response.status));
    }
    if !shared.set_state(session, TrackerState::Streaming) {
        return Err(CouchError::Cancelled);
    }

    let mut parser = ChangeParser::new(mode);
    let mut body = response.body;
    let mut parsed = 0;
    while let Some(chunk) = within(idle, body.next()).await? {
        let changes = parser.feed(&chunk?);
        if parser.parsed_units() > parsed {
            parsed = parser.parsed_units();
            retry.reset();
            shared.retry_count.store(0, Ordering::SeqCst);
        }
        if !shared.deliver(session, changes, &parser) {
            return Err(CouchError::Cancelled);
        }
    }

    let changes = parser.finish()?;
    if !shared.deliver(session, changes, &parser) {
        return Err(CouchError::Cancelled);
    }
    if parser.parsed_units() > parsed {
        retry.reset();
        shared.retry_count.store(0, Ordering::SeqCst);
    }
    Ok(parser.parsed_units() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::changes::{ChangeEvent, ChannelClient};
    use crate::core::client::{ClientConfig, CouchClient, RetryConfig};
    use crate::core::mock_network::{Scripted, ScriptedNetwork};
    use crate::core::types::CouchResponse;
    use once_cell::sync::OnceCell;

    const HEARTBEAT_FEED: &str = "{\"seq\":5,\"id\":\"a\",\"changes\":[{\"rev\":\"2-x\"}]}\n\n{\"seq\":6,\"id\":\"b\",\"changes\":[{\"rev\":\"1-y\"},{\"rev\":\"1-z\"}]}\n";

    fn db(network: Arc<ScriptedNetwork>) -> Arc<Resource> {
        CouchClient::with_network(network, ClientConfig::default())
            .resource("http://localhost:5984/db")
            .unwrap()
    }

    fn config(mode: FeedMode) -> TrackerConfig {
        TrackerConfig::new(mode).with_heartbeat(None).with_retry(
            RetryConfig::default()
                .with_initial_backoff(Duration::from_millis(5))
                .with_backoff_step(Duration::from_millis(5))
                .with_max_backoff(Duration::from_millis(20)),
        )
    }

    async fn next_event(rx: &async_channel::Receiver<ChangeEvent>) -> ChangeEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a change event")
            .expect("channel closed")
    }

    async fn next_change(rx: &async_channel::Receiver<ChangeEvent>) -> Change {
        match next_event(rx).await {
            ChangeEvent::Change(change) => change,
            other => panic!("expected a change, got {:?}", other),
        }
    }

    async fn wait_for_requests(network: &ScriptedNetwork, count: usize) {
        for _ in 0..500 {
            if network.request_count() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} requests, saw {}", count, network.request_count());
    }

    fn since(request: &CouchRequest) -> Option<String> {
        request.query_param("since")
    }

    #[tokio::test]
    async fn test_one_shot_fetch() {
        let network = ScriptedNetwork::new(vec![Scripted::stream(
            200,
            &[r#"{"results":[{"seq":1,"id":"doc1","changes":[{"rev":"1-abc"}]}],"last_seq":1}"#],
        )]);
        let (client, rx) = ChannelClient::new();
        let tracker = ChangeTracker::new(db(network.clone()), Arc::new(client), config(FeedMode::OneShot));
        assert!(tracker.start());

        let change = next_change(&rx).await;
        assert_eq!(change.id, "doc1");
        assert_eq!(change.revisions().collect::<Vec<_>>(), vec!["1-abc"]);
        assert_eq!(next_event(&rx).await, ChangeEvent::Stopped(None));

        assert_eq!(tracker.last_sequence_number(), 1);
        assert_eq!(tracker.state(), TrackerState::Stopped);

        let request = &network.requests()[0];
        assert_eq!(request.url.path(), "/db/_changes");
        assert_eq!(request.query_param("feed").as_deref(), Some("normal"));
        assert_eq!(since(request).as_deref(), Some("0"));
        assert!(request.query_param("heartbeat").is_none());
    }

    #[tokio::test]
    async fn test_continuous_heartbeat_ignored() {
        let network = ScriptedNetwork::new(vec![Scripted::held_stream(200, &[HEARTBEAT_FEED])]);
        let (client, rx) = ChannelClient::new();
        let tracker = ChangeTracker::new(
            db(network.clone()),
            Arc::new(client),
            config(FeedMode::Continuous).with_heartbeat(Some(Duration::from_secs(10))),
        );
        tracker.start();

        assert_eq!(next_change(&rx).await.seq, 5);
        assert_eq!(next_change(&rx).await.seq, 6);
        assert_eq!(tracker.last_sequence_number(), 6);
        assert_eq!(tracker.state(), TrackerState::Streaming);

        let request = &network.requests()[0];
        assert_eq!(request.query_param("feed").as_deref(), Some("continuous"));
        assert_eq!(request.query_param("heartbeat").as_deref(), Some("10000"));

        tracker.stop();
        assert!(!tracker.is_running());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_single_byte_chunks() {
        let bytes: Vec<String> = HEARTBEAT_FEED.chars().map(String::from).collect();
        let chunks: Vec<&str> = bytes.iter().map(String::as_str).collect();
        let network = ScriptedNetwork::new(vec![Scripted::held_stream(200, &chunks)]);
        let (client, rx) = ChannelClient::new();
        let tracker = ChangeTracker::new(db(network), Arc::new(client), config(FeedMode::Continuous));
        tracker.start();

        let first = next_change(&rx).await;
        let second = next_change(&rx).await;
        let mut parser = ChangeParser::new(FeedMode::Continuous);
        assert_eq!(vec![first, second], parser.feed(HEARTBEAT_FEED.as_bytes()));
        tracker.stop();
    }

    #[tokio::test]
    async fn test_reconnect_keeps_checkpoint() {
        let network = ScriptedNetwork::new(vec![
            Scripted::stream(200, &["{\"seq\":5,\"id\":\"a\",\"changes\":[]}\n"]),
            Scripted::error(|| CouchError::Transport("connection reset".into())),
            Scripted::held_stream(200, &[]),
        ]);
        let (client, rx) = ChannelClient::new();
        let tracker = ChangeTracker::new(
            db(network.clone()),
            Arc::new(client),
            config(FeedMode::Continuous).with_since(3),
        );
        tracker.start();

        assert_eq!(next_change(&rx).await.seq, 5);
        wait_for_requests(&network, 3).await;

        let requests = network.requests();
        assert_eq!(since(&requests[0]).as_deref(), Some("3"));
        assert_eq!(since(&requests[1]).as_deref(), Some("5"));
        assert_eq!(since(&requests[2]).as_deref(), Some("5"));
        tracker.stop();
    }

    #[tokio::test]
    async fn test_retry_exhaustion() {
        let network = ScriptedNetwork::then_always(vec![], || {
            Scripted::error(|| CouchError::Transport("connection refused".into()))
        });
        let (client, rx) = ChannelClient::new();
        let tracker = ChangeTracker::new(
            db(network.clone()),
            Arc::new(client),
            config(FeedMode::Continuous).with_max_retries(3),
        );
        tracker.start();

        assert!(matches!(next_event(&rx).await, ChangeEvent::Stopped(Some(_))));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(network.request_count(), 3);
        assert!(rx.try_recv().is_err());
        assert_eq!(tracker.state(), TrackerState::Stopped);
        assert_eq!(tracker.retry_count(), 3);
    }

    #[tokio::test]
    async fn test_error_status_is_retried() {
        let network = ScriptedNetwork::new(vec![
            Scripted::response(CouchResponse::new(500, r#"{"error":"unknown_error"}"#)),
            Scripted::held_stream(200, &["{\"seq\":1,\"id\":\"a\",\"changes\":[]}\n"]),
        ]);
        let (client, rx) = ChannelClient::new();
        let tracker = ChangeTracker::new(db(network.clone()), Arc::new(client), config(FeedMode::Continuous));
        tracker.start();

        assert_eq!(next_change(&rx).await.seq, 1);
        assert_eq!(network.request_count(), 2);
        assert_eq!(tracker.retry_count(), 0);
        tracker.stop();
    }

    #[tokio::test]
    async fn test_unparsable_long_poll_body_exhausts_retries() {
        let network = ScriptedNetwork::then_always(vec![], || {
            Scripted::response(CouchResponse::new(200, "<html>proxy error</html>"))
        });
        let (client, rx) = ChannelClient::new();
        let tracker = ChangeTracker::new(
            db(network.clone()),
            Arc::new(client),
            config(FeedMode::LongPoll).with_max_retries(2),
        );
        tracker.start();

        assert!(matches!(next_event(&rx).await, ChangeEvent::Stopped(Some(_))));
        assert_eq!(network.request_count(), 2);
        drop(tracker);
    }

    #[tokio::test]
    async fn test_unparsable_continuous_body_exhausts_retries() {
        let network = ScriptedNetwork::then_always(vec![], || {
            Scripted::response(CouchResponse::new(200, "<html>proxy error</html>"))
        });
        let (client, rx) = ChannelClient::new();
        let tracker = ChangeTracker::new(
            db(network.clone()),
            Arc::new(client),
            config(FeedMode::Continuous).with_max_retries(2),
        );
        tracker.start();

        match next_event(&rx).await {
            ChangeEvent::Stopped(Some(message)) => assert!(message.contains("parse")),
            other => panic!("expected a terminal error, got {:?}", other),
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(network.request_count(), 2);
        assert_eq!(tracker.retry_count(), 2);
        assert_eq!(tracker.state(), TrackerState::Stopped);
    }

    #[tokio::test]
    async fn test_heartbeat_only_response_backs_off() {
        let network = ScriptedNetwork::then_always(vec![], || Scripted::stream(200, &["\n", "\n"]));
        let (client, rx) = ChannelClient::new();
        let tracker = ChangeTracker::new(
            db(network.clone()),
            Arc::new(client),
            config(FeedMode::Continuous)
                .with_max_retries(1)
                .with_retry(RetryConfig::default().with_initial_backoff(Duration::from_millis(50))),
        );
        tracker.start();
        tokio::time::sleep(Duration::from_millis(120)).await;

        let count = network.request_count();
        assert!((1..=4).contains(&count), "made {} requests", count);
        assert!(tracker.is_running());
        assert_eq!(tracker.retry_count(), 0);
        tracker.stop();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reconnect_sends_sequence_token() {
        let network = ScriptedNetwork::new(vec![
            Scripted::stream(200, &["{\"seq\":\"7-g1AA\",\"id\":\"a\",\"changes\":[]}\n"]),
            Scripted::error(|| CouchError::Transport("connection reset".into())),
            Scripted::held_stream(200, &[]),
        ]);
        let (client, rx) = ChannelClient::new();
        let tracker = ChangeTracker::new(
            db(network.clone()),
            Arc::new(client),
            config(FeedMode::Continuous).with_since(3).with_since_token("3-g1ZZ"),
        );
        tracker.start();

        let change = next_change(&rx).await;
        assert_eq!(change.seq, 7);
        wait_for_requests(&network, 3).await;

        let requests = network.requests();
        assert_eq!(since(&requests[0]).as_deref(), Some("3-g1ZZ"));
        assert_eq!(since(&requests[1]).as_deref(), Some("7-g1AA"));
        assert_eq!(since(&requests[2]).as_deref(), Some("7-g1AA"));
        assert_eq!(tracker.last_sequence_number(), 7);
        assert_eq!(tracker.last_sequence_token().as_deref(), Some("7-g1AA"));

        tracker.set_last_sequence_number(2);
        assert!(tracker.last_sequence_token().is_none());
        tracker.stop();
    }

    #[tokio::test]
    async fn test_long_poll_reissues_from_last_seq() {
        let network = ScriptedNetwork::new(vec![
            Scripted::stream(200, &[r#"{"results":[{"seq":1,"id":"a","changes":[]}],"last_seq":1}"#]),
            Scripted::stream(200, &[r#"{"results":[{"seq":2,"id":"b","changes":[]}],"last_seq":2}"#]),
            Scripted::Hang,
        ]);
        let (client, rx) = ChannelClient::new();
        let tracker = ChangeTracker::new(
            db(network.clone()),
            Arc::new(client),
            config(FeedMode::LongPoll).with_heartbeat(Some(Duration::from_secs(10))),
        );
        tracker.start();

        assert_eq!(next_change(&rx).await.id, "a");
        assert_eq!(next_change(&rx).await.id, "b");
        wait_for_requests(&network, 3).await;

        let requests = network.requests();
        assert_eq!(requests[0].query_param("feed").as_deref(), Some("longpoll"));
        assert_eq!(since(&requests[1]).as_deref(), Some("1"));
        assert_eq!(since(&requests[2]).as_deref(), Some("2"));
        assert!(tracker.is_running());
        tracker.stop();
    }

    #[tokio::test]
    async fn test_filter_and_include_docs_in_request() {
        let network = ScriptedNetwork::new(vec![Scripted::Hang]);
        let (client, _rx) = ChannelClient::new();
        let tracker = ChangeTracker::new(
            db(network.clone()),
            Arc::new(client),
            config(FeedMode::Continuous)
                .with_filter("app/important")
                .with_include_docs(true),
        );
        tracker.set_filter_param("level", "high");
        tracker.start();
        wait_for_requests(&network, 1).await;

        let request = &network.requests()[0];
        assert_eq!(request.query_param("filter").as_deref(), Some("app/important"));
        assert_eq!(request.query_param("level").as_deref(), Some("high"));
        assert_eq!(request.query_param("include_docs").as_deref(), Some("true"));
        tracker.stop();
    }

    #[tokio::test]
    async fn test_auth_retry_uses_database_credential() {
        let network = ScriptedNetwork::new(vec![
            Scripted::response(CouchResponse::new(401, r#"{"error":"unauthorized"}"#)),
            Scripted::held_stream(200, &["{\"seq\":1,\"id\":\"a\",\"changes\":[]}\n"]),
        ]);
        let db = db(network.clone());
        db.set_credential(Some(Credential::basic("admin", "pw")));
        let (client, rx) = ChannelClient::new();
        let tracker = ChangeTracker::new(db, Arc::new(client), config(FeedMode::Continuous));
        tracker.start();

        assert_eq!(next_change(&rx).await.seq, 1);
        let requests = network.requests();
        assert!(requests[0].credential.is_none());
        assert_eq!(requests[1].credential, Some(Credential::basic("admin", "pw")));
        assert_eq!(tracker.retry_count(), 0);
        tracker.stop();
    }

    #[tokio::test]
    async fn test_auth_prefers_client_credential() {
        let network = ScriptedNetwork::new(vec![
            Scripted::response(CouchResponse::new(401, "")),
            Scripted::Hang,
        ]);
        let db = db(network.clone());
        db.set_credential(Some(Credential::basic("admin", "pw")));
        let (client, _rx) = ChannelClient::new();
        let client = client.with_credential(Credential::bearer("token"));
        let tracker = ChangeTracker::new(db, Arc::new(client), config(FeedMode::Continuous));
        tracker.start();

        wait_for_requests(&network, 2).await;
        assert_eq!(network.requests()[1].credential, Some(Credential::bearer("token")));
        tracker.stop();
    }

    #[tokio::test]
    async fn test_repeated_auth_failure_is_terminal() {
        let network = ScriptedNetwork::then_always(vec![], || {
            Scripted::response(CouchResponse::new(401, ""))
        });
        let db = db(network.clone());
        db.set_credential(Some(Credential::basic("admin", "wrong")));
        let (client, rx) = ChannelClient::new();
        let tracker = ChangeTracker::new(db, Arc::new(client), config(FeedMode::Continuous));
        tracker.start();

        assert!(matches!(next_event(&rx).await, ChangeEvent::Stopped(Some(_))));
        assert_eq!(network.request_count(), 2);
        assert!(!tracker.is_running());
    }

    #[tokio::test]
    async fn test_auth_failure_without_credential() {
        let network = ScriptedNetwork::new(vec![Scripted::response(CouchResponse::new(401, ""))]);
        let (client, rx) = ChannelClient::new();
        let tracker = ChangeTracker::new(db(network.clone()), Arc::new(client), config(FeedMode::Continuous));
        tracker.start();

        assert!(matches!(next_event(&rx).await, ChangeEvent::Stopped(Some(_))));
        assert_eq!(network.request_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_before_any_data() {
        let network = ScriptedNetwork::new(vec![Scripted::Hang]);
        let (client, rx) = ChannelClient::new();
        let tracker = ChangeTracker::new(db(network), Arc::new(client), config(FeedMode::Continuous));
        assert!(tracker.start());
        assert!(tracker.start());
        tracker.stop();
        tracker.stop();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(tracker.state(), TrackerState::Stopped);
    }

    struct StopAfterFirst {
        tracker: Arc<OnceCell<ChangeTracker>>,
        seen: Mutex<Vec<u64>>,
    }

    impl ChangeClient for StopAfterFirst {
        fn received_change(&self, change: &Change) {
            self.seen.lock().push(change.seq);
            if let Some(tracker) = self.tracker.get() {
                tracker.stop();
            }
        }

        fn tracker_stopped(&self, _error: Option<&CouchError>) {
            panic!("explicit stop must not report");
        }
    }

    #[tokio::test]
    async fn test_stop_from_callback_suppresses_rest() {
        let network = ScriptedNetwork::new(vec![Scripted::held_stream(200, &[HEARTBEAT_FEED])]);
        let cell = Arc::new(OnceCell::new());
        let client = Arc::new(StopAfterFirst {
            tracker: cell.clone(),
            seen: Mutex::new(Vec::new()),
        });
        let tracker = ChangeTracker::new(db(network), client.clone(), config(FeedMode::Continuous));
        assert!(cell.set(tracker).is_ok());
        let tracker = cell.get().unwrap();
        tracker.start();

        for _ in 0..200 {
            if !tracker.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*client.seen.lock(), vec![5]);
        assert_eq!(tracker.last_sequence_number(), 5);
    }

    #[tokio::test]
    async fn test_restart_resumes() {
        let network = ScriptedNetwork::new(vec![
            Scripted::stream(200, &[r#"{"results":[{"seq":4,"id":"a","changes":[]}],"last_seq":4}"#]),
            Scripted::stream(200, &[r#"{"results":[],"last_seq":4}"#]),
        ]);
        let (client, rx) = ChannelClient::new();
        let tracker = ChangeTracker::new(db(network.clone()), Arc::new(client), config(FeedMode::OneShot));

        tracker.start();
        next_change(&rx).await;
        assert_eq!(next_event(&rx).await, ChangeEvent::Stopped(None));

        tracker.start();
        assert_eq!(next_event(&rx).await, ChangeEvent::Stopped(None));
        assert_eq!(since(&network.requests()[1]).as_deref(), Some("4"));
    }

    #[test]
    fn test_untitled_database_cannot_start() {
        let network = ScriptedNetwork::new(vec![]);
        let (client, _rx) = ChannelClient::new();
        let tracker = ChangeTracker::new(db(network).untitled(), Arc::new(client), config(FeedMode::OneShot));
        assert!(!tracker.start());
        assert!(!tracker.is_running());
    }
}
