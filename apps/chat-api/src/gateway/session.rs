//! Per-connection session: read/write loops and inbound frame dispatch.
//!
//! Lifecycle: the upgrade handler constructs the session, registers it with
//! the hub, and calls [`Session::run`]. The read loop ends on socket close,
//! read error, or missed keep-alive; the session then unregisters, the
//! outbound queue closes, and the write loop drains and sends a close frame.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time;

use cloak_common::id::{prefix, prefixed_ulid};

use super::dispatcher::MessageDispatcher;
use super::events::ClientFrame;
use super::hub::{Hub, SessionHandle};
use super::relay;

/// Per-frame write deadline.
const WRITE_WAIT: Duration = Duration::from_secs(10);
/// Read deadline, refreshed by any inbound frame (pongs included).
const PONG_WAIT: Duration = Duration::from_secs(60);
/// Keep-alive ping interval. Must stay under `PONG_WAIT`.
const PING_PERIOD: Duration = Duration::from_secs(54);
/// Maximum inbound frame size in bytes.
pub const MAX_MESSAGE_SIZE: usize = 512 * 1024;

/// One live connection: identity, outbound queue, and an optional dispatcher
/// for the store-backed frame types.
pub struct Session {
    handle: SessionHandle,
    hub: Arc<Hub>,
    dispatcher: Option<Arc<MessageDispatcher>>,
    rx: mpsc::Receiver<Utf8Bytes>,
}

impl Session {
    pub fn new(
        hub: Arc<Hub>,
        user_id: String,
        dispatcher: Option<Arc<MessageDispatcher>>,
    ) -> Self {
        let (handle, rx) = SessionHandle::new(prefixed_ulid(prefix::SESSION), user_id);
        Self {
            handle,
            hub,
            dispatcher,
            rx,
        }
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    /// Run both loops to completion. Call after `hub.register`. Returns once
    /// the connection is fully torn down.
    pub async fn run(self, socket: WebSocket) {
        let Session {
            handle,
            hub,
            dispatcher,
            rx,
        } = self;
        let (ws_tx, ws_rx) = socket.split();

        let writer = tokio::spawn(write_loop(ws_tx, rx));

        // The read loop gets its own task: a panicking frame handler unwinds
        // only that task, and unregistration below still runs.
        let reader = tokio::spawn(read_loop(ws_rx, handle.clone(), hub.clone(), dispatcher));
        if let Err(e) = reader.await {
            if e.is_panic() {
                tracing::error!(session_id = %handle.id, "frame handler panicked");
            }
        }

        hub.unregister(&handle.id);
        tracing::info!(session_id = %handle.id, user_id = %handle.user_id, "session ended");

        // Unregistration removed the registry's sender; dropping ours closes
        // the queue, and the write loop exits after a close frame.
        drop(handle);
        let _ = writer.await;
    }
}

async fn read_loop(
    mut ws_rx: SplitStream<WebSocket>,
    session: SessionHandle,
    hub: Arc<Hub>,
    dispatcher: Option<Arc<MessageDispatcher>>,
) {
    loop {
        let msg = match time::timeout(PONG_WAIT, ws_rx.next()).await {
            Err(_) => {
                tracing::debug!(session_id = %session.id, "read deadline exceeded");
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                tracing::debug!(session_id = %session.id, ?e, "ws read error");
                return;
            }
            Ok(Some(Ok(msg))) => msg,
        };
        match msg {
            Message::Text(text) => {
                handle_frame(text.as_str(), &session, &hub, dispatcher.as_deref()).await;
            }
            // Control frames only refresh the read deadline above.
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => return,
            Message::Binary(_) => {}
        }
    }
}

/// Route one inbound frame by its `type` tag. Malformed JSON and unknown
/// types are ignored without a reply.
async fn handle_frame(
    raw: &str,
    session: &SessionHandle,
    hub: &Hub,
    dispatcher: Option<&MessageDispatcher>,
) {
    let frame: ClientFrame = match serde_json::from_str(raw) {
        Ok(frame) => frame,
        Err(_) => return,
    };
    match frame.kind.as_str() {
        "subscribe" => {
            if !frame.channel_id.is_empty() {
                hub.subscribe(&session.id, &frame.channel_id);
            }
        }
        "unsubscribe" => {
            if !frame.channel_id.is_empty() {
                hub.unsubscribe(&session.id, &frame.channel_id);
            }
        }
        "message.send" => {
            if let Some(dispatcher) = dispatcher {
                dispatcher.send_message(session, raw).await;
            }
        }
        "message.history" => {
            if let Some(dispatcher) = dispatcher {
                dispatcher.history(session, raw).await;
            }
        }
        "typing.start" | "typing.stop" => {
            if let Some(dispatcher) = dispatcher {
                dispatcher.typing(session, &frame.kind, raw).await;
            }
        }
        "media.key" => {
            relay::relay_media_key(hub, session, &frame.target_user_id, &frame.payload);
        }
        _ => {}
    }
}

async fn write_loop(mut ws_tx: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Utf8Bytes>) {
    let mut ping = time::interval(PING_PERIOD);
    ping.tick().await; // First tick completes immediately; skip it.
    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(payload) => {
                    match time::timeout(WRITE_WAIT, ws_tx.send(Message::Text(payload))).await {
                        Ok(Ok(())) => {}
                        _ => return,
                    }
                }
                None => {
                    // Queue closed after unregister: graceful shutdown.
                    let close = Message::Close(Some(CloseFrame {
                        code: close_code::NORMAL,
                        reason: "".into(),
                    }));
                    let _ = time::timeout(WRITE_WAIT, ws_tx.send(close)).await;
                    return;
                }
            },
            _ = ping.tick() => {
                match time::timeout(WRITE_WAIT, ws_tx.send(Message::Ping(Vec::new().into()))).await {
                    Ok(Ok(())) => {}
                    _ => return,
                }
            }
        }
    }
}
