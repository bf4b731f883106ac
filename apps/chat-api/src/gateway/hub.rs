//! Process-wide routing fabric: session registry, channel subscriptions, and
//! user presence.
//!
//! All three maps live behind one reader-writer lock. Mutations take the
//! writer lock; broadcasts snapshot the targets under the reader lock and
//! deliver outside it, so no enqueue ever happens inside a critical section
//! that another broadcaster is waiting on.

use std::collections::{HashMap, HashSet};

use axum::extract::ws::Utf8Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::events::{self, PresenceUpdate};

/// Capacity of each session's outbound queue. Producers never block: an
/// enqueue against a full queue drops the new frame, never a queued one.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// The sending half of a session's outbound queue plus its routing identity.
/// Cheap to clone; the hub keeps one in its registry.
#[derive(Clone)]
pub struct SessionHandle {
    pub id: String,
    pub user_id: String,
    tx: mpsc::Sender<Utf8Bytes>,
}

impl SessionHandle {
    pub fn new(id: String, user_id: String) -> (Self, mpsc::Receiver<Utf8Bytes>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        (Self { id, user_id, tx }, rx)
    }

    /// Non-blocking enqueue. A full queue drops the frame with a warn log; a
    /// closed queue means the session is tearing down and the frame is moot.
    pub fn enqueue(&self, frame: Utf8Bytes) {
        match self.tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(session_id = %self.id, "outbound queue full, dropping frame");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Non-blocking enqueue without the dropped-frame log. Presence updates
    /// use this: a client that misses one resyncs on reconnect.
    fn enqueue_quiet(&self, frame: Utf8Bytes) {
        let _ = self.tx.try_send(frame);
    }
}

#[derive(Default)]
struct HubState {
    /// session id -> handle
    sessions: HashMap<String, SessionHandle>,
    /// channel id -> subscribed session ids. Empty sets are pruned.
    channels: HashMap<String, HashSet<String>>,
    /// user ids with at least one registered session.
    presence: HashSet<String>,
}

/// The hub holds all connected sessions and channel subscriptions.
#[derive(Default)]
pub struct Hub {
    state: RwLock<HubState>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session to the registry and mark its user present. The updated
    /// presence set is pushed to every session, the new one included.
    pub fn register(&self, handle: SessionHandle) {
        let mut state = self.state.write();
        state.presence.insert(handle.user_id.clone());
        state.sessions.insert(handle.id.clone(), handle);
        broadcast_presence_locked(&state);
    }

    /// Remove a session from the registry and from every subscription set.
    /// The user leaves presence only when no other session of theirs
    /// remains. Idempotent.
    pub fn unregister(&self, session_id: &str) {
        let mut state = self.state.write();
        let removed = state.sessions.remove(session_id);
        state.channels.retain(|_, subscribers| {
            subscribers.remove(session_id);
            !subscribers.is_empty()
        });
        if let Some(handle) = removed {
            if !state
                .sessions
                .values()
                .any(|s| s.user_id == handle.user_id)
            {
                state.presence.remove(&handle.user_id);
            }
        }
        broadcast_presence_locked(&state);
    }

    /// Subscribe the session to a channel, creating the set if absent.
    /// Idempotent.
    pub fn subscribe(&self, session_id: &str, channel_id: &str) {
        let mut state = self.state.write();
        state
            .channels
            .entry(channel_id.to_string())
            .or_default()
            .insert(session_id.to_string());
    }

    /// Remove the session from a channel, pruning the set when it empties.
    /// Idempotent.
    pub fn unsubscribe(&self, session_id: &str, channel_id: &str) {
        let mut state = self.state.write();
        if let Some(subscribers) = state.channels.get_mut(channel_id) {
            subscribers.remove(session_id);
            if subscribers.is_empty() {
                state.channels.remove(channel_id);
            }
        }
    }

    /// Deliver the frame to every subscriber of the channel except
    /// `exclude_session_id` (empty string excludes nobody). Never blocks;
    /// full queues drop the frame.
    pub fn broadcast(&self, channel_id: &str, frame: Utf8Bytes, exclude_session_id: &str) {
        let targets: Vec<SessionHandle> = {
            let state = self.state.read();
            let Some(subscribers) = state.channels.get(channel_id) else {
                return;
            };
            subscribers
                .iter()
                .filter(|id| id.as_str() != exclude_session_id)
                .filter_map(|id| state.sessions.get(id).cloned())
                .collect()
        };
        for session in targets {
            session.enqueue(frame.clone());
        }
    }

    /// Deliver the frame to every session of the user. Never blocks.
    pub fn broadcast_to_user(&self, user_id: &str, frame: Utf8Bytes) {
        let targets: Vec<SessionHandle> = {
            let state = self.state.read();
            state
                .sessions
                .values()
                .filter(|s| s.user_id == user_id)
                .cloned()
                .collect()
        };
        for session in targets {
            session.enqueue(frame.clone());
        }
    }
}

/// Push the materialized presence set, sorted and serialized once, to every
/// session. Called with the writer lock held; every enqueue is non-blocking,
/// so the critical section stays bounded.
fn broadcast_presence_locked(state: &HubState) {
    let mut user_ids: Vec<String> = state.presence.iter().cloned().collect();
    user_ids.sort();
    let frame = events::encode(&PresenceUpdate {
        kind: "presence.update",
        user_ids,
    });
    for session in state.sessions.values() {
        session.enqueue_quiet(frame.clone());
    }
}
