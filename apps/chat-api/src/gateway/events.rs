//! Wire-format frames exchanged over the WebSocket.
//!
//! Every frame is a JSON object with a `type` discriminator.

use axum::extract::ws::Utf8Bytes;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Client → server
// ---------------------------------------------------------------------------

/// Envelope read from every inbound text frame. Fields beyond `type` are
/// populated only by the frame types that carry them.
#[derive(Debug, Deserialize)]
pub struct ClientFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub target_user_id: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub payload: String,
}

/// Payload of `message.send`.
#[derive(Debug, Default, Deserialize)]
pub struct SendMessagePayload {
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub ciphertext: String,
}

/// Payload of `message.history`.
#[derive(Debug, Default, Deserialize)]
pub struct HistoryPayload {
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub before: String,
    #[serde(default)]
    pub limit: i64,
}

/// Payload of `typing.start` / `typing.stop`.
#[derive(Debug, Deserialize)]
pub struct TypingPayload {
    #[serde(default)]
    pub channel_id: String,
}

// ---------------------------------------------------------------------------
// Server → client
// ---------------------------------------------------------------------------

/// `message.new` fan-out frame.
#[derive(Debug, Serialize)]
pub struct MessageNew<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub id: &'a str,
    pub channel_id: &'a str,
    pub sender_id: &'a str,
    pub ciphertext: String,
    pub timestamp: String,
}

/// One item of `message.history.response`. The camelCase fields mirror the
/// REST history endpoint and intentionally differ from `message.new`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryItem {
    pub id: String,
    pub channel_id: String,
    pub sender_id: String,
    pub ciphertext: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub messages: Vec<HistoryItem>,
}

/// `typing.start` / `typing.stop` relayed to the channel.
#[derive(Debug, Serialize)]
pub struct TypingFrame<'a> {
    #[serde(rename = "type")]
    pub kind: &'a str,
    pub channel_id: &'a str,
    pub user_id: &'a str,
}

/// `media.key` relayed point-to-point between users.
#[derive(Debug, Serialize)]
pub struct MediaKeyFrame<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub sender_user_id: &'a str,
    pub payload: &'a str,
}

/// Presence snapshot pushed after every register/unregister.
#[derive(Debug, Serialize)]
pub struct PresenceUpdate {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub user_ids: Vec<String>,
}

/// Error reply for client-attributable and internal failures.
#[derive(Debug, Serialize)]
pub struct ErrorFrame<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub code: &'a str,
    pub message: &'a str,
}

/// Serialize a frame into the pre-serialized form queued to sessions.
pub fn encode<T: Serialize>(frame: &T) -> Utf8Bytes {
    serde_json::to_string(frame).unwrap().into()
}
