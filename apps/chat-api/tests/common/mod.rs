//! Shared helpers for gateway integration tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use chat_api::auth::tokens::{sign_token, token_fingerprint};
use chat_api::config::Config;
use chat_api::db::store::MemoryStore;
use chat_api::gateway::hub::Hub;
use chat_api::models::session::SessionRecord;
use chat_api::AppState;

pub const TEST_SECRET: &str = "integration-test-secret";

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a real listener backed by an in-memory store. Returns the bound
/// address and the store for seeding.
pub async fn start_server() -> (SocketAddr, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let config = Config {
        database_url: String::new(),
        jwt_secret: TEST_SECRET.to_string(),
        cors_origin: "*".to_string(),
        port: 0,
    };
    let state = AppState {
        store: store.clone(),
        hub: Arc::new(Hub::new()),
        config: Arc::new(config),
    };
    let app = chat_api::routes::router().with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, store)
}

/// Mint a credential for the user and register its durable session record.
pub fn issue_token(store: &MemoryStore, user_id: &str) -> String {
    let session_id = cloak_common::id::prefixed_ulid(cloak_common::id::prefix::SESSION);
    let expires_at = Utc::now() + chrono::Duration::hours(1);
    let token = sign_token(user_id, &session_id, TEST_SECRET, expires_at).expect("sign token");
    store.put_session(SessionRecord {
        id: session_id,
        user_id: user_id.to_string(),
        token_fingerprint: token_fingerprint(&token),
        expires_at,
    });
    token
}

/// Connect through the query-credential flow.
pub async fn connect_with_token(addr: SocketAddr, token: &str) -> WsClient {
    let url = format!("ws://{addr}/ws?token={token}");
    let (ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("ws connect");
    ws
}

/// Connect un-credentialed and authenticate with an inline `auth` frame.
pub async fn connect_inline_auth(addr: SocketAddr, token: &str) -> WsClient {
    let url = format!("ws://{addr}/ws");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("ws connect");
    let auth = serde_json::json!({ "type": "auth", "token": token });
    ws.send(Message::Text(auth.to_string().into()))
        .await
        .expect("send auth");
    ws
}

pub async fn send_json(ws: &mut WsClient, frame: serde_json::Value) {
    ws.send(Message::Text(frame.to_string().into()))
        .await
        .expect("send frame");
}

/// Read frames until one with the given `type` arrives.
pub async fn recv_of_type(ws: &mut WsClient, kind: &str, wait: Duration) -> serde_json::Value {
    tokio::time::timeout(wait, async {
        loop {
            let msg = ws
                .next()
                .await
                .expect("connection closed")
                .expect("ws error");
            if let Message::Text(text) = msg {
                let value: serde_json::Value = serde_json::from_str(&text).expect("parse frame");
                if value["type"] == kind {
                    return value;
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {kind}"))
}

/// Read presence updates until one satisfies the predicate.
pub async fn recv_presence_until(
    ws: &mut WsClient,
    wait: Duration,
    predicate: impl Fn(&[String]) -> bool,
) -> Vec<String> {
    tokio::time::timeout(wait, async {
        loop {
            let frame = recv_of_type(ws, "presence.update", wait).await;
            let user_ids: Vec<String> = frame["user_ids"]
                .as_array()
                .expect("user_ids array")
                .iter()
                .map(|v| v.as_str().unwrap().to_string())
                .collect();
            if predicate(&user_ids) {
                return user_ids;
            }
        }
    })
    .await
    .expect("timed out waiting for presence condition")
}

/// Assert that no text frame of the given type arrives within the window.
pub async fn assert_silence(ws: &mut WsClient, kind: &str, window: Duration) {
    let result = tokio::time::timeout(window, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let value: serde_json::Value =
                        serde_json::from_str(&text).expect("parse frame");
                    if value["type"] == kind {
                        return value;
                    }
                }
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => std::future::pending::<()>().await,
            }
        }
    })
    .await;
    if let Ok(frame) = result {
        panic!("expected silence but received {kind}: {frame}");
    }
}

/// Subscribe to a channel and wait until the subscription is effective.
///
/// The read loop handles frames in order, so a completed `message.history`
/// round-trip proves the preceding `subscribe` was processed.
pub async fn subscribe_and_sync(ws: &mut WsClient, channel_id: &str, wait: Duration) {
    send_json(ws, serde_json::json!({ "type": "subscribe", "channel_id": channel_id })).await;
    send_json(
        ws,
        serde_json::json!({ "type": "message.history", "channel_id": channel_id }),
    )
    .await;
    recv_of_type(ws, "message.history.response", wait).await;
}
