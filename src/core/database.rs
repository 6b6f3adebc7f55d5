//! A CouchDB database and its change tracking.

use crate::core::changes::{ChangeClient, ChangeTracker, FeedMode, TrackerConfig};
use crate::core::client::Operation;
use crate::core::error::{CouchError, Result};
use crate::core::resource::Resource;
use crate::core::types::{ChangesBatch, Method};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Handle to one database. Owns at most one running [`ChangeTracker`] and
/// remembers its checkpoint across restarts.
pub struct Database {
    resource: Arc<Resource>,
    tracker: Mutex<Option<ChangeTracker>>,
    last_seq: AtomicU64,
    last_seq_token: Mutex<Option<String>>,
}

impl Database {
    pub fn new(resource: Arc<Resource>) -> Self {
        Database {
            resource,
            tracker: Mutex::new(None),
            last_seq: AtomicU64::new(0),
            last_seq_token: Mutex::new(None),
        }
    }

    pub fn resource(&self) -> &Arc<Resource> {
        &self.resource
    }

    /// Starts tracking changes, replacing any tracker already running.
    ///
    /// A non-zero `config.since` or a `config.since_token` is used as given,
    /// even if it is older than the stored checkpoint. Otherwise the feed
    /// resumes from the stored checkpoint. To replay from the very start,
    /// call `set_last_sequence_number(0)` first.
    pub fn track_changes(&self, client: Arc<dyn ChangeClient>, mut config: TrackerConfig) -> bool {
        self.stop_tracking();
        if config.since == 0 && config.since_token.is_none() {
            config.since = self.last_seq.load(Ordering::SeqCst);
            config.since_token = self.last_seq_token.lock().clone();
        }
        let tracker = ChangeTracker::new(self.resource.clone(), client, config);
        let started = tracker.start();
        *self.tracker.lock() = Some(tracker);
        started
    }

    /// Stops the current tracker and keeps its checkpoint.
    pub fn stop_tracking(&self) {
        // Taken out first: stopping may wait for a callback that uses `self`.
        let tracker = self.tracker.lock().take();
        if let Some(tracker) = tracker {
            tracker.stop();
            self.last_seq
                .store(tracker.last_sequence_number(), Ordering::SeqCst);
            *self.last_seq_token.lock() = tracker.last_sequence_token();
        }
    }

    pub fn is_tracking_changes(&self) -> bool {
        self.tracker
            .lock()
            .as_ref()
            .is_some_and(|tracker| tracker.is_running())
    }

    /// Feed mode of the current tracker, if any.
    pub fn tracking_mode(&self) -> Option<FeedMode> {
        self.tracker.lock().as_ref().map(|tracker| tracker.mode())
    }

    /// The checkpoint: the current tracker's, or the one kept from the last.
    pub fn last_sequence_number(&self) -> u64 {
        match self.tracker.lock().as_ref() {
            Some(tracker) => tracker.last_sequence_number(),
            None => self.last_seq.load(Ordering::SeqCst),
        }
    }

    /// The checkpoint's sequence token, if the server's sequences are not
    /// plain numbers.
    pub fn last_sequence_token(&self) -> Option<String> {
        match self.tracker.lock().as_ref() {
            Some(tracker) => tracker.last_sequence_token(),
            None => self.last_seq_token.lock().clone(),
        }
    }

    /// Replaces the checkpoint, e.g. with one loaded from disk. Clears the
    /// sequence token.
    pub fn set_last_sequence_number(&self, seq: u64) {
        self.last_seq.store(seq, Ordering::SeqCst);
        *self.last_seq_token.lock() = None;
        if let Some(tracker) = self.tracker.lock().as_ref() {
            tracker.set_last_sequence_number(seq);
        }
    }

    /// Replaces the checkpoint's sequence token, keeping the number.
    pub fn set_last_sequence_token(&self, token: Option<String>) {
        *self.last_seq_token.lock() = token.clone();
        if let Some(tracker) = self.tracker.lock().as_ref() {
            tracker.set_last_sequence_token(token);
        }
    }

    /// Fetches every change after `since` in one request.
    ///
    /// The parsed JSON is left as the operation's result object. The stored
    /// checkpoint is not touched.
    pub async fn changes_once(&self, since: u64) -> Result<ChangesBatch> {
        let op = self.changes_operation(since)?;
        if !op.wait().await {
            return Err(op
                .error()
                .map(|e| e.duplicate())
                .unwrap_or(CouchError::Cancelled));
        }
        let body = op
            .response_body()
            .await
            .ok_or_else(|| CouchError::BodyParse("changes response has no body".into()))?;
        let batch = ChangesBatch::parse(body.content())?;
        op.set_result_object(body.from_json().cloned());
        Ok(batch)
    }

    /// The started `GET _changes?feed=normal` operation behind
    /// [`changes_once`](Self::changes_once).
    pub fn changes_operation(&self, since: u64) -> Result<Operation> {
        let since = since.to_string();
        self.resource
            .child("_changes")
            .send_http(Method::Get, &[("?feed", "normal"), ("?since", &since)])
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.stop_tracking();
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("url", &self.resource.url().map(|u| u.to_string()))
            .field("tracking", &self.is_tracking_changes())
            .field("last_seq", &self.last_sequence_number())
            .finish()
    }
}
