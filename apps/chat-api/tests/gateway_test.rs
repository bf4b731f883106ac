mod common;

use std::time::Duration;

use futures_util::StreamExt;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error, Message};

use common::{
    assert_silence, connect_inline_auth, connect_with_token, issue_token, recv_of_type,
    recv_presence_until, send_json, start_server, subscribe_and_sync,
};

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(300);

#[tokio::test]
async fn query_token_flow_reaches_live_state() {
    let (addr, store) = start_server().await;
    let token = issue_token(&store, "u1");

    let mut ws = connect_with_token(addr, &token).await;

    let frame = recv_of_type(&mut ws, "presence.update", WAIT).await;
    let user_ids = frame["user_ids"].as_array().unwrap();
    assert!(user_ids.iter().any(|v| v == "u1"));
}

#[tokio::test]
async fn invalid_query_token_is_rejected_before_upgrade() {
    let (addr, _store) = start_server().await;

    let url = format!("ws://{addr}/ws?token=not-a-real-token");
    match tokio_tungstenite::connect_async(&url).await {
        Err(Error::Http(response)) => assert_eq!(response.status(), 401),
        other => panic!("expected HTTP 401 rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn token_disagreeing_with_session_record_is_rejected() {
    let (addr, store) = start_server().await;

    // Credential verifies, but the durable record carries a different
    // session id than the one embedded in the token.
    let token = chat_api::auth::tokens::sign_token(
        "u1",
        "ses_embedded",
        common::TEST_SECRET,
        chrono::Utc::now() + chrono::Duration::hours(1),
    )
    .unwrap();
    store.put_session(chat_api::models::session::SessionRecord {
        id: "ses_other".to_string(),
        user_id: "u1".to_string(),
        token_fingerprint: chat_api::auth::tokens::token_fingerprint(&token),
        expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
    });

    let url = format!("ws://{addr}/ws?token={token}");
    match tokio_tungstenite::connect_async(&url).await {
        Err(Error::Http(response)) => assert_eq!(response.status(), 401),
        other => panic!("expected HTTP 401 rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn inline_auth_flow_reaches_live_state() {
    let (addr, store) = start_server().await;
    let token = issue_token(&store, "u1");

    let mut ws = connect_inline_auth(addr, &token).await;

    let frame = recv_of_type(&mut ws, "presence.update", WAIT).await;
    let user_ids = frame["user_ids"].as_array().unwrap();
    assert!(user_ids.iter().any(|v| v == "u1"));
}

#[tokio::test]
async fn inline_auth_rejects_non_auth_first_frame() {
    let (addr, _store) = start_server().await;

    let url = format!("ws://{addr}/ws");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("ws connect");
    send_json(
        &mut ws,
        serde_json::json!({ "type": "subscribe", "channel_id": "ch1" }),
    )
    .await;

    let close = tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(frame))) => return frame,
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return None,
            }
        }
    })
    .await
    .expect("timed out waiting for close");

    let close = close.expect("close frame with policy violation");
    assert_eq!(close.code, CloseCode::Policy);
}

#[tokio::test]
async fn inline_auth_rejects_invalid_token() {
    let (addr, _store) = start_server().await;

    let url = format!("ws://{addr}/ws");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("ws connect");
    send_json(
        &mut ws,
        serde_json::json!({ "type": "auth", "token": "not-a-real-token" }),
    )
    .await;

    let closed = tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None => return true,
                Some(Ok(_)) => continue,
                Some(Err(_)) => return true,
            }
        }
    })
    .await
    .expect("timed out waiting for close");
    assert!(closed);
}

// S1 — presence aggregation over multi-session users.
#[tokio::test]
async fn presence_tracks_multi_session_users() {
    let (addr, store) = start_server().await;
    let observer_token = issue_token(&store, "observer");
    let u1_token_a = issue_token(&store, "u1");
    let u1_token_b = issue_token(&store, "u1");

    let mut observer = connect_with_token(addr, &observer_token).await;
    recv_presence_until(&mut observer, WAIT, |ids| {
        ids.contains(&"observer".to_string())
    })
    .await;

    let mut session_a = connect_with_token(addr, &u1_token_a).await;
    recv_presence_until(&mut observer, WAIT, |ids| ids.contains(&"u1".to_string())).await;

    let mut session_b = connect_with_token(addr, &u1_token_b).await;
    // Wait until B is registered before tearing A down.
    recv_of_type(&mut session_b, "presence.update", WAIT).await;

    session_a.close(None).await.expect("close session a");

    // B's register and A's unregister each produce one update; u1 must still
    // be present in both.
    for _ in 0..2 {
        let frame = recv_of_type(&mut observer, "presence.update", WAIT).await;
        let ids = frame["user_ids"].as_array().unwrap();
        assert!(ids.iter().any(|v| v == "u1"), "u1 must stay present: {frame}");
    }

    session_b.close(None).await.expect("close session b");
    let ids = recv_presence_until(&mut observer, WAIT, |ids| {
        !ids.contains(&"u1".to_string())
    })
    .await;
    assert!(ids.contains(&"observer".to_string()));
}

// S2/S3 — message.send happy path with sender exclusion.
#[tokio::test]
async fn message_send_fans_out_excluding_sender() {
    let (addr, store) = start_server().await;
    store.add_member("ch1", "u1");
    store.add_member("ch1", "u2");
    let mut sender = connect_with_token(addr, &issue_token(&store, "u1")).await;
    let mut receiver = connect_with_token(addr, &issue_token(&store, "u2")).await;

    subscribe_and_sync(&mut sender, "ch1", WAIT).await;
    subscribe_and_sync(&mut receiver, "ch1", WAIT).await;

    send_json(
        &mut sender,
        serde_json::json!({
            "type": "message.send",
            "channel_id": "ch1",
            "ciphertext": "YWVz"
        }),
    )
    .await;

    let frame = recv_of_type(&mut receiver, "message.new", WAIT).await;
    assert_eq!(frame["channel_id"], "ch1");
    assert_eq!(frame["sender_id"], "u1");
    assert_eq!(frame["ciphertext"], "YWVz");
    assert!(frame["id"].as_str().unwrap().starts_with("msg_"));
    assert!(frame["timestamp"].as_str().unwrap().contains('T'));

    assert_eq!(store.insert_count(), 1);
    assert_eq!(store.messages()[0].ciphertext, b"aes");

    assert_silence(&mut sender, "message.new", QUIET).await;
}

// S4 — forbidden send.
#[tokio::test]
async fn message_send_forbidden_when_not_member() {
    let (addr, store) = start_server().await;
    store.add_member("ch1", "u2");
    let mut sender = connect_with_token(addr, &issue_token(&store, "u1")).await;
    let mut receiver = connect_with_token(addr, &issue_token(&store, "u2")).await;
    subscribe_and_sync(&mut receiver, "ch1", WAIT).await;

    send_json(
        &mut sender,
        serde_json::json!({
            "type": "message.send",
            "channel_id": "ch1",
            "ciphertext": "YWVz"
        }),
    )
    .await;

    let frame = recv_of_type(&mut sender, "error", WAIT).await;
    assert_eq!(frame["code"], "forbidden");
    assert_eq!(store.insert_count(), 0);
    assert_silence(&mut receiver, "message.new", QUIET).await;
}

// S5 — media.key relay and guards.
#[tokio::test]
async fn media_key_relay_and_guards() {
    let (addr, store) = start_server().await;
    let mut sender = connect_inline_auth(addr, &issue_token(&store, "u1")).await;
    let mut target = connect_inline_auth(addr, &issue_token(&store, "u2")).await;
    recv_of_type(&mut sender, "presence.update", WAIT).await;
    recv_of_type(&mut target, "presence.update", WAIT).await;

    send_json(
        &mut sender,
        serde_json::json!({
            "type": "media.key",
            "target_user_id": "u2",
            "payload": "cGF5bG9hZA=="
        }),
    )
    .await;
    let frame = recv_of_type(&mut target, "media.key", WAIT).await;
    assert_eq!(frame["sender_user_id"], "u1");
    assert_eq!(frame["payload"], "cGF5bG9hZA==");

    // Self-relay is dropped.
    send_json(
        &mut sender,
        serde_json::json!({
            "type": "media.key",
            "target_user_id": "u1",
            "payload": "cGF5bG9hZA=="
        }),
    )
    .await;
    assert_silence(&mut sender, "media.key", QUIET).await;

    // Oversized payload is dropped.
    send_json(
        &mut sender,
        serde_json::json!({
            "type": "media.key",
            "target_user_id": "u2",
            "payload": "a".repeat(4097)
        }),
    )
    .await;
    assert_silence(&mut target, "media.key", QUIET).await;
}

// S6 — history replay to the requesting session only.
#[tokio::test]
async fn history_returns_camel_case_items() {
    let (addr, store) = start_server().await;
    store.add_member("ch1", "u1");
    store.seed_message(chat_api::models::message::Message {
        id: "msg_1".to_string(),
        channel_id: "ch1".to_string(),
        sender_id: "u1".to_string(),
        ciphertext: vec![0x61],
        timestamp: chrono::Utc::now(),
    });
    let mut requester = connect_with_token(addr, &issue_token(&store, "u1")).await;
    let mut other = connect_with_token(addr, &issue_token(&store, "u2")).await;

    send_json(
        &mut requester,
        serde_json::json!({ "type": "message.history", "channel_id": "ch1" }),
    )
    .await;

    let frame = recv_of_type(&mut requester, "message.history.response", WAIT).await;
    let item = &frame["messages"][0];
    assert_eq!(item["id"], "msg_1");
    assert_eq!(item["channelId"], "ch1");
    assert_eq!(item["senderId"], "u1");
    assert_eq!(item["ciphertext"], "YQ==");
    assert!(item["timestamp"].as_str().unwrap().contains('T'));

    assert_silence(&mut other, "message.history.response", QUIET).await;
}

#[tokio::test]
async fn typing_echoes_to_sender_and_channel() {
    let (addr, store) = start_server().await;
    store.add_member("ch1", "u1");
    store.add_member("ch1", "u2");
    let mut sender = connect_with_token(addr, &issue_token(&store, "u1")).await;
    let mut other = connect_with_token(addr, &issue_token(&store, "u2")).await;
    subscribe_and_sync(&mut sender, "ch1", WAIT).await;
    subscribe_and_sync(&mut other, "ch1", WAIT).await;

    send_json(
        &mut sender,
        serde_json::json!({ "type": "typing.start", "channel_id": "ch1" }),
    )
    .await;

    for ws in [&mut sender, &mut other] {
        let frame = recv_of_type(ws, "typing.start", WAIT).await;
        assert_eq!(frame["channel_id"], "ch1");
        assert_eq!(frame["user_id"], "u1");
    }
}

#[tokio::test]
async fn malformed_and_unknown_frames_are_ignored() {
    let (addr, store) = start_server().await;
    store.add_member("ch1", "u1");
    let mut ws = connect_with_token(addr, &issue_token(&store, "u1")).await;

    use futures_util::SinkExt;
    ws.send(Message::Text("this is not json".into()))
        .await
        .expect("send garbage");
    send_json(&mut ws, serde_json::json!({ "type": "no.such.frame" })).await;

    // The connection must still be usable afterwards.
    subscribe_and_sync(&mut ws, "ch1", WAIT).await;
}

#[tokio::test]
async fn unsubscribe_stops_fan_out() {
    let (addr, store) = start_server().await;
    store.add_member("ch1", "u1");
    store.add_member("ch1", "u2");
    let mut sender = connect_with_token(addr, &issue_token(&store, "u1")).await;
    let mut receiver = connect_with_token(addr, &issue_token(&store, "u2")).await;
    subscribe_and_sync(&mut sender, "ch1", WAIT).await;
    subscribe_and_sync(&mut receiver, "ch1", WAIT).await;

    send_json(
        &mut receiver,
        serde_json::json!({ "type": "unsubscribe", "channel_id": "ch1" }),
    )
    .await;
    // Round-trip to make sure the unsubscribe was processed.
    send_json(
        &mut receiver,
        serde_json::json!({ "type": "message.history", "channel_id": "ch1" }),
    )
    .await;
    recv_of_type(&mut receiver, "message.history.response", WAIT).await;

    send_json(
        &mut sender,
        serde_json::json!({
            "type": "message.send",
            "channel_id": "ch1",
            "ciphertext": "YWVz"
        }),
    )
    .await;

    assert_silence(&mut receiver, "message.new", QUIET).await;
}
