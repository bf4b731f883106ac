//! WebSocket upgrade handler and the two admission flows.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::header::ORIGIN;
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio::time;

use crate::auth::tokens::{token_fingerprint, verify_token, TokenIdentity};
use crate::error::ApiError;
use crate::AppState;

use super::dispatcher::MessageDispatcher;
use super::events::ClientFrame;
use super::session::{Session, MAX_MESSAGE_SIZE};

/// Deadline for the inline `auth` frame after an un-credentialed upgrade.
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct WsQuery {
    #[serde(default)]
    token: String,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws_upgrade))
}

/// Admission: a `token` query parameter is verified before the upgrade
/// (failures are HTTP 401); without one, the socket is upgraded first and
/// the opening frame must be `{type:"auth", token}` (failures close 1008).
async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    if !origin_allowed(&state.config.cors_origin, &headers) {
        return Err(ApiError::forbidden("origin not allowed"));
    }
    let ws = ws.max_message_size(MAX_MESSAGE_SIZE);

    if query.token.is_empty() {
        return Ok(ws.on_upgrade(move |socket| inline_auth_flow(socket, state)));
    }

    let identity = resolve_identity(&state, &query.token)
        .await
        .ok_or_else(|| ApiError::unauthorized("invalid token"))?;
    Ok(ws.on_upgrade(move |socket| run_session(socket, state, identity)))
}

/// `*` accepts any origin; anything else must match the header exactly.
fn origin_allowed(allowed: &str, headers: &HeaderMap) -> bool {
    if allowed == "*" {
        return true;
    }
    headers.get(ORIGIN).and_then(|v| v.to_str().ok()) == Some(allowed)
}

/// Verify the credential cryptographically and against the durable session
/// record. Every failure collapses to `None`; callers must not reveal which
/// step failed.
async fn resolve_identity(state: &AppState, token: &str) -> Option<TokenIdentity> {
    let identity = verify_token(token, &state.config.jwt_secret).ok()?;
    let fingerprint = token_fingerprint(token);
    let record = state
        .store
        .get_session_by_fingerprint(&fingerprint)
        .await
        .ok()??;
    (record.id == identity.session_id && record.user_id == identity.user_id).then_some(identity)
}

async fn inline_auth_flow(mut socket: WebSocket, state: AppState) {
    let identity = match time::timeout(AUTH_TIMEOUT, read_auth_frame(&mut socket, &state)).await {
        Ok(Some(identity)) => identity,
        Ok(None) | Err(_) => {
            let close = Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: "auth required".into(),
            }));
            let _ = socket.send(close).await;
            return;
        }
    };
    run_session(socket, state, identity).await;
}

/// Read exactly one data frame; it must be `{type:"auth", token}` carrying a
/// credential that resolves. Ping/pong control frames are skipped.
async fn read_auth_frame(socket: &mut WebSocket, state: &AppState) -> Option<TokenIdentity> {
    loop {
        let msg = socket.recv().await?.ok()?;
        let text = match msg {
            Message::Text(text) => text,
            Message::Ping(_) | Message::Pong(_) => continue,
            _ => return None,
        };
        let frame: ClientFrame = serde_json::from_str(text.as_str()).ok()?;
        if frame.kind != "auth" || frame.token.is_empty() {
            return None;
        }
        return resolve_identity(state, &frame.token).await;
    }
}

/// Both admission flows land here with a resolved identity: register with
/// the hub, then run the session loops to completion.
async fn run_session(socket: WebSocket, state: AppState, identity: TokenIdentity) {
    let dispatcher = Arc::new(MessageDispatcher::new(state.store.clone(), state.hub.clone()));
    let session = Session::new(state.hub.clone(), identity.user_id, Some(dispatcher));
    tracing::info!(
        session_id = %session.handle().id,
        user_id = %session.handle().user_id,
        "session established"
    );
    state.hub.register(session.handle().clone());
    session.run(socket).await;
}
