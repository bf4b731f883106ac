//! Point-to-point relay of opaque key material between users.
//!
//! `media.key` frames carry session-establishment material for the external
//! voice/video substrate. They are never persisted, never acknowledged, and
//! their payloads are never logged.

use super::events::{self, MediaKeyFrame};
use super::hub::{Hub, SessionHandle};

/// Maximum accepted `media.key` payload length in characters.
pub const MAX_MEDIA_KEY_PAYLOAD: usize = 4096;

/// Forward an opaque payload to every session of the target user. Self-relay,
/// empty targets, and oversized payloads are dropped without a reply.
pub fn relay_media_key(hub: &Hub, sender: &SessionHandle, target_user_id: &str, payload: &str) {
    if target_user_id.is_empty() || target_user_id == sender.user_id {
        return;
    }
    if payload.len() > MAX_MEDIA_KEY_PAYLOAD {
        return;
    }
    let frame = events::encode(&MediaKeyFrame {
        kind: "media.key",
        sender_user_id: &sender.user_id,
        payload,
    });
    hub.broadcast_to_user(target_user_id, frame);
}
