//! Receivers of change-feed events.

use crate::core::error::CouchError;
use crate::core::types::{Change, Credential};

/// Receives what a [`ChangeTracker`](super::ChangeTracker) reads.
///
/// Callbacks run on the tracker's task, one at a time and in feed order.
/// Calling [`ChangeTracker::stop`](super::ChangeTracker::stop) from inside a
/// callback is allowed.
pub trait ChangeClient: Send + Sync + 'static {
    fn received_change(&self, change: &Change);

    /// The tracker has stopped on its own: `None` when a one-shot feed is
    /// done, the terminal error otherwise. Not called after an explicit stop.
    fn tracker_stopped(&self, _error: Option<&CouchError>) {}

    /// Credential to retry with after a 401/407. The tracked database's own
    /// credential is used when this returns `None`.
    fn auth_credential(&self) -> Option<Credential> {
        None
    }
}

/// Event forwarded by [`ChannelClient`].
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Change(Change),
    /// Tracker stopped, with the error message if it gave up.
    Stopped(Option<String>),
}

/// A [`ChangeClient`] that forwards everything over a channel.
#[derive(Debug, Clone)]
pub struct ChannelClient {
    tx: async_channel::Sender<ChangeEvent>,
    credential: Option<Credential>,
}

impl ChannelClient {
    pub fn new() -> (Self, async_channel::Receiver<ChangeEvent>) {
        let (tx, rx) = async_channel::unbounded();
        (
            ChannelClient {
                tx,
                credential: None,
            },
            rx,
        )
    }

    /// Answers authentication challenges with `credential`.
    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    fn forward(&self, event: ChangeEvent) {
        if self.tx.try_send(event).is_err() {
            tracing::debug!("Change event dropped, receiver is gone");
        }
    }
}

impl ChangeClient for ChannelClient {
    fn received_change(&self, change: &Change) {
        self.forward(ChangeEvent::Change(change.clone()));
    }

    fn tracker_stopped(&self, error: Option<&CouchError>) {
        self.forward(ChangeEvent::Stopped(error.map(|e| e.to_string())));
    }

    fn auth_credential(&self) -> Option<Credential> {
        self.credential.clone()
    }
}
