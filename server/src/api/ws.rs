//! WebSocket endpoint bridging a browser terminal to the session's login
//! shell.
//!
//! State machine per connection: connecting (validation + spawn) ->
//! streaming (two directions multiplexed in one select loop) -> closing
//! (signal ladder) -> closed. Every rejection sends a human-readable
//! diagnostic line first, then a distinct close code. The bridge reads
//! ledger state but never mutates it.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State as AxumState,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use portable_pty::PtySize;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};
use valhalla_types::{api::close, Session};

use crate::terminal::{
    parse_frame, shutdown_process, EscalationWaits, InboundFrame, ShellSession,
};
use crate::{constant_time_eq, Arena};

#[derive(Deserialize)]
pub(super) struct TerminalQuery {
    token: Option<String>,
}

pub(super) async fn terminal_ws(
    AxumState(arena): AxumState<Arc<Arena>>,
    Path(session_id): Path<i64>,
    Query(query): Query<TerminalQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        handle_terminal(socket, arena, session_id, query.token.unwrap_or_default())
    })
}

/// Diagnostic line then coded close; the caller can distinguish every
/// failure class by its close code.
async fn reject(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Text(format!("\x1b[31mError: {reason}\x1b[0m\r\n")))
        .await;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

async fn handle_terminal(mut socket: WebSocket, arena: Arc<Arena>, session_id: i64, token: String) {
    let session = match arena.ledger.session(session_id) {
        Ok(Some(session)) => session,
        Ok(None) => {
            reject(&mut socket, close::NOT_FOUND, "Session not found").await;
            return;
        }
        Err(err) => {
            error!(%err, session_id, "session lookup failed");
            reject(&mut socket, close::NOT_FOUND, "Session not found").await;
            return;
        }
    };

    if !session.status.is_playable() {
        let reason = format!("Session is {}, not active", session.status.as_str());
        reject(&mut socket, close::NOT_PLAYABLE, &reason).await;
        return;
    }

    if !constant_time_eq(&session.access_token, &token) {
        reject(&mut socket, close::BAD_TOKEN, "Invalid access token").await;
        return;
    }

    if session.linux_uid.is_none() {
        reject(&mut socket, close::MISSING_CREDENTIALS, "Missing credentials").await;
        return;
    }

    let shell = match ShellSession::spawn(&arena.config.login_command, &session.username) {
        Ok(shell) => shell,
        Err(err) => {
            error!(%err, username = %session.username, "failed to start login shell");
            reject(&mut socket, close::CONNECT_FAILED, "Failed to connect to game host").await;
            return;
        }
    };
    arena.metrics.inc_bridge_connects();
    info!(session_id, username = %session.username, "terminal bridge connected");

    run_bridge(socket, arena, session, shell).await;
}

async fn run_bridge(socket: WebSocket, arena: Arc<Arena>, session: Session, shell: ShellSession) {
    let ShellSession {
        master,
        mut process,
        mut output,
        input,
    } = shell;
    let (mut ws_tx, mut ws_rx) = socket.split();
    let idle_timeout = arena.config.idle_timeout;
    let mut last_activity = Instant::now();
    let mut idle_check = tokio::time::interval(Duration::from_secs(1));

    // Both directions run in this one loop; whichever ends first takes the
    // whole bridge through the shared teardown below.
    loop {
        tokio::select! {
            chunk = output.recv() => match chunk {
                Some(data) => {
                    if ws_tx.send(Message::Binary(data)).await.is_err() {
                        break;
                    }
                }
                None => {
                    info!(session_id = session.id, "login shell closed its pty");
                    break;
                }
            },
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    last_activity = Instant::now();
                    match parse_frame(&text) {
                        InboundFrame::Resize { cols, rows } => {
                            if let Err(err) = master.resize(PtySize {
                                rows,
                                cols,
                                pixel_width: 0,
                                pixel_height: 0,
                            }) {
                                warn!(%err, "pty resize failed");
                            }
                        }
                        InboundFrame::Input(data) => {
                            if input.send(data.into_bytes()).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    last_activity = Instant::now();
                    if input.send(data).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = ws_tx.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    info!(session_id = session.id, "client disconnected");
                    break;
                }
                Some(Err(err)) => {
                    warn!(%err, session_id = session.id, "websocket error");
                    break;
                }
            },
            _ = idle_check.tick() => {
                if last_activity.elapsed() > idle_timeout {
                    arena.metrics.inc_bridge_idle_timeouts();
                    info!(session_id = session.id, "idle timeout");
                    let _ = ws_tx
                        .send(Message::Text(
                            "\r\n\x1b[33m[Session timed out due to inactivity]\x1b[0m\r\n"
                                .to_string(),
                        ))
                        .await;
                    break;
                }
            }
        }
    }

    // Closing: stop feeding input, walk the signal ladder, release the pty.
    drop(input);
    let step = shutdown_process(&mut process, EscalationWaits::default()).await;
    info!(session_id = session.id, escalation = ?step, "login shell shut down");
    drop(master);
    let _ = ws_tx.send(Message::Close(None)).await;
    info!(session_id = session.id, "terminal bridge closed");
}
