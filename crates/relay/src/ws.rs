// Websocket endpoint: one socket per (client, room).
//
// A connection runs through a fixed lifecycle. The first frame must be an
// `auth` message carrying a collaboration token; after verification the relay
// joins the room, confirms with `auth_ok`, and settles into the event loop:
// socket frames in, room fanout out, heartbeats, and the token expiry timer.

use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use cowrite_common::protocol::messages::{self, decode_client, ClientMessage, ServerMessage};
use cowrite_common::protocol::{ErrorCode, RoomId};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::TOKEN_TTL_SECONDS;
use crate::error::{current_request_id, with_request_id_scope, RelayError};
use crate::rooms::{JoinError, RoomEvent};
use crate::AppState;

/// How often the relay pings an idle socket.
pub const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
/// How long after a ping the pong may take before the socket is dropped.
pub const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
/// Upper bound on a single websocket frame.
pub const MAX_FRAME_BYTES: u32 = 262_144;
/// How long a fresh socket may take to present its `auth` frame.
pub const AUTH_DEADLINE_MS: u64 = 10_000;
/// Lead time before token expiry at which the client is told to refresh.
pub const TOKEN_WARN_LEAD_SECONDS: i64 = 60;

pub fn router() -> Router<AppState> {
    Router::new().route("/rooms/{room_id}", get(room_ws))
}

async fn room_ws(
    ws: WebSocketUpgrade,
    Path(room_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Response, RelayError> {
    let room_id =
        RoomId::parse(&room_id).map_err(|_| RelayError::from_code(ErrorCode::RoomNotFound))?;

    // The middleware's request-id scope ends with the upgrade response, so
    // carry the id into the socket task explicitly.
    let request_id = current_request_id().unwrap_or_else(|| Uuid::new_v4().to_string());
    Ok(ws.max_frame_size(MAX_FRAME_BYTES as usize).on_upgrade(move |socket| {
        with_request_id_scope(request_id, handle_socket(socket, state, room_id))
    }))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, room_id: RoomId) {
    let token = match first_auth_token(&mut socket).await {
        Ok(token) => token,
        Err(code) => {
            debug!(room = %room_id, code = code.as_str(), "socket rejected before auth");
            let _ = reject(&mut socket, code).await;
            return;
        }
    };

    let verified = match state.verifier.verify(&token, &room_id).await {
        Ok(verified) => verified,
        Err(error) => {
            debug!(room = %room_id, %error, "authentication failed");
            let _ = reject(&mut socket, error.code()).await;
            return;
        }
    };

    let mut conn = match state.registry.join(&room_id, &verified.user_id, &verified.user_name).await
    {
        Ok(conn) => conn,
        Err(JoinError::Full) => {
            info!(room = %room_id, user_id = %verified.user_id, "room at capacity");
            let _ = reject(&mut socket, ErrorCode::RoomFull).await;
            return;
        }
        Err(JoinError::Unavailable(error)) => {
            warn!(room = %room_id, %error, "room could not be opened");
            let _ = reject(&mut socket, ErrorCode::ServiceUnavailable).await;
            return;
        }
    };

    info!(
        room = %room_id,
        user_id = %conn.member.user_id,
        conn_id = conn.conn_id,
        "connection joined"
    );

    let hello = ServerMessage::AuthOk {
        user_id: conn.member.user_id.clone(),
        user_name: conn.member.user_name.clone(),
    };
    let opening = if conn.room.is_presence() {
        ServerMessage::PresenceSnapshot { users: conn.room.presence_users() }
    } else {
        state.registry.status_message()
    };
    if send_server(&mut socket, &hello).await.is_err()
        || send_server(&mut socket, &opening).await.is_err()
    {
        state.registry.leave(&conn.room, conn.conn_id).await;
        return;
    }

    // Tokens verified over HTTP carry no expiry; assume a freshly minted one.
    let expires_at =
        verified.expires_at.unwrap_or_else(|| Utc::now() + chrono::Duration::seconds(TOKEN_TTL_SECONDS));
    let (warn_in, expire_in) = token_deadlines(expires_at, Utc::now());
    let mut expiry = Instant::now() + expire_in;
    let mut refresh_warned = false;
    let token_timer = tokio::time::sleep_until(Instant::now() + warn_in);
    tokio::pin!(token_timer);

    let mut heartbeat = tokio::time::interval(Duration::from_millis(HEARTBEAT_INTERVAL_MS));
    heartbeat.reset();
    let heartbeat_timeout = Duration::from_millis(HEARTBEAT_TIMEOUT_MS);
    let mut last_pong = Instant::now();

    'session: loop {
        tokio::select! {
            incoming = socket.recv() => {
                let Some(Ok(frame)) = incoming else { break };
                match frame {
                    Message::Text(text) => {
                        if text.len() > MAX_FRAME_BYTES as usize {
                            let _ = close_oversized(&mut socket).await;
                            break;
                        }
                        let message = match decode_client(&text) {
                            Ok(message) => message,
                            Err(error) => {
                                debug!(room = %room_id, %error, "dropping undecodable client message");
                                continue;
                            }
                        };
                        match message {
                            ClientMessage::Auth { .. } => {
                                debug!(room = %room_id, "ignoring repeated auth");
                            }
                            ClientMessage::TokenRefresh { token } => {
                                match state.verifier.verify(&token, &room_id).await {
                                    Ok(renewed) if renewed.user_id != conn.member.user_id => {
                                        warn!(
                                            room = %room_id,
                                            user_id = %conn.member.user_id,
                                            "refresh token belongs to a different user"
                                        );
                                        let _ = reject(&mut socket, ErrorCode::AuthInvalid).await;
                                        break;
                                    }
                                    Ok(renewed) => {
                                        let renewed_expiry = renewed.expires_at.unwrap_or_else(|| {
                                            Utc::now() + chrono::Duration::seconds(TOKEN_TTL_SECONDS)
                                        });
                                        let (warn_in, expire_in) =
                                            token_deadlines(renewed_expiry, Utc::now());
                                        expiry = Instant::now() + expire_in;
                                        refresh_warned = false;
                                        token_timer.as_mut().reset(Instant::now() + warn_in);
                                        debug!(room = %room_id, user_id = %conn.member.user_id, "token refreshed");
                                    }
                                    Err(error) => {
                                        debug!(room = %room_id, %error, "token refresh rejected");
                                        let _ = reject(&mut socket, error.code()).await;
                                        break;
                                    }
                                }
                            }
                            ClientMessage::SyncRequest {} => {
                                if conn.room.is_presence() {
                                    debug!(room = %room_id, "ignoring sync_request on a presence room");
                                    continue;
                                }
                                let offer = conn.room.sync_offer().await;
                                if socket.send(Message::Binary(offer.into())).await.is_err() {
                                    break;
                                }
                            }
                            ClientMessage::PresenceUpdate { current_path, resource_type, resource_id } => {
                                if !conn.room.is_presence() {
                                    debug!(room = %room_id, "ignoring presence_update on a doc room");
                                    continue;
                                }
                                conn.room.apply_presence(
                                    conn.conn_id,
                                    current_path,
                                    resource_type,
                                    resource_id,
                                );
                            }
                        }
                    }
                    Message::Binary(payload) => {
                        if payload.len() > MAX_FRAME_BYTES as usize {
                            let _ = close_oversized(&mut socket).await;
                            break;
                        }
                        if conn.room.is_presence() {
                            debug!(room = %room_id, "ignoring binary frame on a presence room");
                            continue;
                        }
                        match conn.room.handle_binary(conn.conn_id, &payload).await {
                            Ok(dispatch) => {
                                let synced = dispatch.synced;
                                for reply in dispatch.replies {
                                    if socket.send(Message::Binary(reply.into())).await.is_err() {
                                        break 'session;
                                    }
                                }
                                if synced {
                                    let complete = ServerMessage::SyncComplete {
                                        snapshot_version: conn.room.snapshot_version(),
                                    };
                                    if send_server(&mut socket, &complete).await.is_err() {
                                        break 'session;
                                    }
                                }
                                state.registry.maybe_persist(&conn.room).await;
                            }
                            Err(error) => {
                                warn!(room = %room_id, %error, "dropping malformed sync frame");
                            }
                        }
                    }
                    Message::Ping(payload) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Message::Pong(_) => {
                        last_pong = Instant::now();
                    }
                    Message::Close(_) => break,
                }
            }
            event = conn.events.recv() => {
                match event {
                    Ok(RoomEvent::Binary { from, payload }) => {
                        if from != conn.conn_id
                            && socket.send(Message::Binary(payload.into())).await.is_err()
                        {
                            break;
                        }
                    }
                    Ok(RoomEvent::Text { from, payload }) => {
                        if from != Some(conn.conn_id)
                            && socket.send(Message::Text(payload.into())).await.is_err()
                        {
                            break;
                        }
                    }
                    Ok(RoomEvent::Revoke { user_id, reason }) => {
                        if user_id == conn.member.user_id {
                            info!(room = %room_id, %user_id, "closing revoked connection");
                            let revoked = ServerMessage::PermissionRevoked { reason };
                            let _ = send_server(&mut socket, &revoked).await;
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(room = %room_id, skipped, "fanout lagged; resynchronizing");
                        if conn.room.is_presence() {
                            let snapshot = ServerMessage::PresenceSnapshot {
                                users: conn.room.presence_users(),
                            };
                            if send_server(&mut socket, &snapshot).await.is_err() {
                                break;
                            }
                        } else {
                            let frame = conn.room.full_state_frame().await;
                            if socket.send(Message::Binary(frame.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            _ = heartbeat.tick() => {
                if last_pong.elapsed() > Duration::from_millis(HEARTBEAT_INTERVAL_MS) + heartbeat_timeout {
                    info!(room = %room_id, conn_id = conn.conn_id, "heartbeat timed out");
                    break;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            _ = &mut token_timer => {
                if !refresh_warned && Instant::now() < expiry {
                    refresh_warned = true;
                    let notice = ServerMessage::Error {
                        code: ErrorCode::TokenRefreshRequired.as_str().to_owned(),
                    };
                    if send_server(&mut socket, &notice).await.is_err() {
                        break;
                    }
                    token_timer.as_mut().reset(expiry);
                } else {
                    info!(room = %room_id, user_id = %conn.member.user_id, "token expired without refresh");
                    let _ = reject(&mut socket, ErrorCode::AuthExpired).await;
                    break;
                }
            }
        }
    }

    state.registry.leave(&conn.room, conn.conn_id).await;
    info!(room = %room_id, conn_id = conn.conn_id, "connection closed");
}

/// Wait for the opening `auth` frame. Anything else, or silence past the
/// deadline, rejects the socket.
async fn first_auth_token(socket: &mut WebSocket) -> Result<String, ErrorCode> {
    let deadline = Duration::from_millis(AUTH_DEADLINE_MS);
    let frame = match tokio::time::timeout(deadline, socket.recv()).await {
        Ok(Some(Ok(frame))) => frame,
        Ok(_) => return Err(ErrorCode::ConnectionClosed),
        Err(_) => return Err(ErrorCode::AuthMissing),
    };

    match frame {
        Message::Text(text) => match decode_client(&text) {
            Ok(ClientMessage::Auth { token }) => Ok(token),
            _ => Err(ErrorCode::AuthMissing),
        },
        _ => Err(ErrorCode::AuthMissing),
    }
}

/// When the client must be told to refresh and when the token dies, as
/// offsets from `now`.
fn token_deadlines(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> (Duration, Duration) {
    let remaining = (expires_at - now).num_seconds().max(0) as u64;
    let warn = remaining.saturating_sub(TOKEN_WARN_LEAD_SECONDS as u64);
    (Duration::from_secs(warn), Duration::from_secs(remaining))
}

async fn send_server(socket: &mut WebSocket, message: &ServerMessage) -> Result<()> {
    let payload = messages::encode_server(message).context("failed to encode server message")?;
    socket.send(Message::Text(payload.into())).await.context("failed to send server message")
}

/// `auth_error` followed by a policy close.
async fn reject(socket: &mut WebSocket, code: ErrorCode) -> Result<()> {
    send_server(socket, &ServerMessage::AuthError { code: code.as_str().to_owned() }).await?;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: "authentication required".into(),
        })))
        .await;
    Ok(())
}

async fn close_oversized(socket: &mut WebSocket) -> Result<()> {
    socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::SIZE,
            reason: "frame too large".into(),
        })))
        .await
        .context("failed to send close frame")
}
