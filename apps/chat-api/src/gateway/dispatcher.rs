//! Store-backed frame handlers: message send, history replay, typing relay.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use tokio::time;

use crate::db::store::Store;

use super::events::{
    self, ErrorFrame, HistoryItem, HistoryPayload, HistoryResponse, MessageNew,
    SendMessagePayload, TypingFrame, TypingPayload,
};
use super::hub::{Hub, SessionHandle};

/// Deadline for each store call; exceeding it reports an internal error.
const STORE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default and maximum history page size.
const HISTORY_LIMIT_MAX: i64 = 50;

/// Handles the frame types that touch the store. One instance per session.
pub struct MessageDispatcher {
    store: Arc<dyn Store>,
    hub: Arc<Hub>,
}

impl MessageDispatcher {
    pub fn new(store: Arc<dyn Store>, hub: Arc<Hub>) -> Self {
        Self { store, hub }
    }

    /// `message.send`: authorize, persist, then fan out to the channel with
    /// the sender's own session excluded.
    pub async fn send_message(&self, session: &SessionHandle, raw: &str) {
        let payload: SendMessagePayload = serde_json::from_str(raw).unwrap_or_default();
        if payload.channel_id.is_empty() || payload.ciphertext.is_empty() {
            return send_error(session, "bad_request", "channel_id and ciphertext required");
        }
        match self.check_membership(&payload.channel_id, session).await {
            Ok(true) => {}
            Ok(false) => return send_error(session, "forbidden", "not a channel member"),
            Err(()) => return send_error(session, "internal", "check membership failed"),
        }
        let ciphertext = match BASE64.decode(&payload.ciphertext) {
            Ok(bytes) => bytes,
            Err(_) => return send_error(session, "bad_request", "invalid ciphertext base64"),
        };
        let insert = self
            .store
            .insert_message(&payload.channel_id, &session.user_id, &ciphertext);
        let message = match time::timeout(STORE_TIMEOUT, insert).await {
            Ok(Ok(message)) => message,
            Ok(Err(e)) => {
                tracing::warn!(?e, "insert_message failed");
                return send_error(session, "internal", "failed to store message");
            }
            Err(_) => {
                tracing::warn!("insert_message timed out");
                return send_error(session, "internal", "failed to store message");
            }
        };
        let frame = events::encode(&MessageNew {
            kind: "message.new",
            id: &message.id,
            channel_id: &message.channel_id,
            sender_id: &message.sender_id,
            ciphertext: BASE64.encode(&message.ciphertext),
            timestamp: rfc3339_nanos(message.timestamp),
        });
        self.hub.broadcast(&payload.channel_id, frame, &session.id);
    }

    /// `message.history`: authorize, fetch the newest-first page, reply to
    /// this session only.
    pub async fn history(&self, session: &SessionHandle, raw: &str) {
        let payload: HistoryPayload = serde_json::from_str(raw).unwrap_or_default();
        if payload.channel_id.is_empty() {
            return send_error(session, "bad_request", "channel_id required");
        }
        let mut limit = payload.limit;
        if limit <= 0 || limit > HISTORY_LIMIT_MAX {
            limit = HISTORY_LIMIT_MAX;
        }
        let before = parse_cursor(&payload.before);
        match self.check_membership(&payload.channel_id, session).await {
            Ok(true) => {}
            Ok(false) => return send_error(session, "forbidden", "not a channel member"),
            Err(()) => return send_error(session, "internal", "check membership failed"),
        }
        let fetch = self.store.get_messages(&payload.channel_id, before, limit);
        let messages = match time::timeout(STORE_TIMEOUT, fetch).await {
            Ok(Ok(messages)) => messages,
            Ok(Err(e)) => {
                tracing::warn!(?e, "get_messages failed");
                return send_error(session, "internal", "failed to load history");
            }
            Err(_) => {
                tracing::warn!("get_messages timed out");
                return send_error(session, "internal", "failed to load history");
            }
        };
        let items = messages
            .into_iter()
            .map(|m| HistoryItem {
                id: m.id,
                channel_id: m.channel_id,
                sender_id: m.sender_id,
                ciphertext: BASE64.encode(&m.ciphertext),
                timestamp: rfc3339_nanos(m.timestamp),
            })
            .collect();
        session.enqueue(events::encode(&HistoryResponse {
            kind: "message.history.response",
            messages: items,
        }));
    }

    /// Typing frames are advisory: failures drop silently, and the sender is
    /// not excluded from the relay (clients filter their own echo).
    pub async fn typing(&self, session: &SessionHandle, kind: &str, raw: &str) {
        let payload: TypingPayload = match serde_json::from_str(raw) {
            Ok(payload) => payload,
            Err(_) => return,
        };
        if payload.channel_id.is_empty() {
            return;
        }
        match self.check_membership(&payload.channel_id, session).await {
            Ok(true) => {}
            Ok(false) | Err(()) => return,
        }
        let frame = events::encode(&TypingFrame {
            kind,
            channel_id: &payload.channel_id,
            user_id: &session.user_id,
        });
        self.hub.broadcast(&payload.channel_id, frame, "");
    }

    async fn check_membership(&self, channel_id: &str, session: &SessionHandle) -> Result<bool, ()> {
        let check = self.store.is_channel_member(channel_id, &session.user_id);
        match time::timeout(STORE_TIMEOUT, check).await {
            Ok(Ok(member)) => Ok(member),
            Ok(Err(e)) => {
                tracing::warn!(?e, channel_id, "is_channel_member failed");
                Err(())
            }
            Err(_) => {
                tracing::warn!(channel_id, "is_channel_member timed out");
                Err(())
            }
        }
    }
}

fn send_error(session: &SessionHandle, code: &str, message: &str) {
    session.enqueue(events::encode(&ErrorFrame {
        kind: "error",
        code,
        message,
    }));
}

/// `before` accepts RFC 3339 with or without fractional seconds; anything
/// unparseable means "from the newest".
fn parse_cursor(before: &str) -> Option<DateTime<Utc>> {
    if before.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(before)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn rfc3339_nanos(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}
