//! Store capability surface consumed by the gateway.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use cloak_common::id::{prefix, prefixed_ulid};

use crate::models::message::Message;
use crate::models::session::SessionRecord;

/// Error returned by store operations. Not-found is expressed as `Ok(None)`,
/// `Ok(false)`, or an empty page — never as an error.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] diesel_async::pooled_connection::deadpool::PoolError),
    #[error("store unavailable")]
    Unavailable,
}

/// Database operations used by the gateway.
///
/// `PgStore` satisfies this in production and `MemoryStore` in tests.
#[async_trait]
pub trait Store: Send + Sync {
    /// Look up a live (unexpired) session by credential fingerprint.
    async fn get_session_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<SessionRecord>, StoreError>;

    /// Whether the user belongs to the server that owns the channel.
    async fn is_channel_member(
        &self,
        channel_id: &str,
        user_id: &str,
    ) -> Result<bool, StoreError>;

    /// Persist an encrypted message and return the stored row.
    async fn insert_message(
        &self,
        channel_id: &str,
        sender_id: &str,
        ciphertext: &[u8],
    ) -> Result<Message, StoreError>;

    /// Messages for the channel, newest first, optionally strictly before
    /// the cursor.
    async fn get_messages(
        &self,
        channel_id: &str,
        before: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation (for tests)
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    /// fingerprint -> session record
    sessions: HashMap<String, SessionRecord>,
    /// (channel_id, user_id)
    members: HashSet<(String, String)>,
    messages: Vec<Message>,
}

/// In-memory `Store` seeded directly by tests. `set_failing(true)` turns
/// every call into a transient error.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    insert_count: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_session(&self, record: SessionRecord) {
        self.state
            .lock()
            .sessions
            .insert(record.token_fingerprint.clone(), record);
    }

    pub fn add_member(&self, channel_id: &str, user_id: &str) {
        self.state
            .lock()
            .members
            .insert((channel_id.to_string(), user_id.to_string()));
    }

    pub fn seed_message(&self, message: Message) {
        self.state.lock().messages.push(message);
    }

    /// Number of `insert_message` calls that reached the store.
    pub fn insert_count(&self) -> usize {
        self.insert_count.load(Ordering::SeqCst)
    }

    /// Snapshot of all stored messages, oldest first.
    pub fn messages(&self) -> Vec<Message> {
        self.state.lock().messages.clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_session_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        self.check_available()?;
        let state = self.state.lock();
        Ok(state
            .sessions
            .get(fingerprint)
            .filter(|s| s.expires_at > Utc::now())
            .cloned())
    }

    async fn is_channel_member(
        &self,
        channel_id: &str,
        user_id: &str,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let state = self.state.lock();
        Ok(state
            .members
            .contains(&(channel_id.to_string(), user_id.to_string())))
    }

    async fn insert_message(
        &self,
        channel_id: &str,
        sender_id: &str,
        ciphertext: &[u8],
    ) -> Result<Message, StoreError> {
        self.check_available()?;
        self.insert_count.fetch_add(1, Ordering::SeqCst);
        let message = Message {
            id: prefixed_ulid(prefix::MESSAGE),
            channel_id: channel_id.to_string(),
            sender_id: sender_id.to_string(),
            ciphertext: ciphertext.to_vec(),
            timestamp: Utc::now(),
        };
        self.state.lock().messages.push(message.clone());
        Ok(message)
    }

    async fn get_messages(
        &self,
        channel_id: &str,
        before: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError> {
        self.check_available()?;
        if limit <= 0 {
            return Ok(Vec::new());
        }
        let state = self.state.lock();
        let mut page: Vec<Message> = state
            .messages
            .iter()
            .filter(|m| m.channel_id == channel_id)
            .filter(|m| before.is_none_or(|cursor| m.timestamp < cursor))
            .cloned()
            .collect();
        page.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        page.truncate(limit as usize);
        Ok(page)
    }
}
