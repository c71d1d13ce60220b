//! Raw pty WebSocket for browser terminal mode.
//!
//! Output flows to the browser as binary frames. Input arrives either as
//! binary frames (raw bytes) or as JSON control messages
//! `{"type":"input","data":...}` / `{"type":"resize","cols":...,"rows":...}`;
//! the opcode distinguishes data from control.
//!
//! The socket honors the same deadlines as the room sockets (10s write
//! budget, 60s read deadline) and the global shutdown token: on shutdown the
//! pty is killed and the browser gets a 1001 close frame.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path as AxumPath, Query, State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::host::PtyCommand;

use super::resolve_room;
use super::routes::AppState;

#[derive(Debug, Deserialize)]
pub struct TerminalQuery {
    #[serde(default)]
    cols: Option<u16>,
    #[serde(default)]
    rows: Option<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControlMessage {
    Input { data: String },
    Resize { cols: u16, rows: u16 },
}

/// GET /ws/terminal/{name} - Attach a raw pty to the session.
pub async fn terminal_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
    Query(query): Query<TerminalQuery>,
) -> impl IntoResponse {
    match resolve_room(&state, &name).await {
        Ok((room, _channel)) => ws
            .on_upgrade(move |socket| {
                handle_terminal(
                    socket,
                    state,
                    room,
                    query.cols.unwrap_or(80),
                    query.rows.unwrap_or(24),
                )
            })
            .into_response(),
        Err(e) => e.into_response(),
    }
}

async fn handle_terminal(
    mut socket: WebSocket,
    state: Arc<AppState>,
    room: crate::registry::Room,
    cols: u16,
    rows: u16,
) {
    let handle = match state
        .mux
        .attach_pty(&room.id.host, &room.id.session_name(), cols, rows)
        .await
    {
        Ok(handle) => handle,
        Err(e) => {
            let _ = socket
                .send(Message::Text(format!("failed to attach terminal: {}", e)))
                .await;
            let _ = socket.close().await;
            return;
        }
    };
    let (input, mut output, killer) = handle.split();
    let write_budget = Duration::from_secs(state.config.timeouts.ws_write_secs);
    let read_deadline = Duration::from_secs(state.config.timeouts.ws_pong_secs);
    let shutdown = state.shutdown.child_token();

    let (mut sender, mut receiver) = socket.split();

    // pty -> browser, binary; 1001 close once the pty byte stream ends
    // (process exit or kill on shutdown).
    let writer = tokio::spawn(async move {
        while let Some(chunk) = output.recv().await {
            let delivered =
                tokio::time::timeout(write_budget, sender.send(Message::Binary(chunk))).await;
            if !matches!(delivered, Ok(Ok(()))) {
                return;
            }
        }
        let close = Message::Close(Some(CloseFrame {
            code: close_code::AWAY,
            reason: "going away".into(),
        }));
        let _ = tokio::time::timeout(write_budget, sender.send(close)).await;
    });

    // browser -> pty, raced against the read deadline and global shutdown.
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = tokio::time::timeout(read_deadline, receiver.next()) => match next {
                // Read deadline blown: the client stopped ponging.
                Err(_) => break,
                Ok(next) => next,
            },
        };
        match next {
            None => break,
            Some(Err(_)) => break,
            Some(Ok(message)) => match message {
                Message::Binary(data) => {
                    if input.send(PtyCommand::Input(data)).is_err() {
                        break;
                    }
                }
                Message::Text(text) => match serde_json::from_str::<ControlMessage>(&text) {
                    Ok(ControlMessage::Input { data }) => {
                        if input.send(PtyCommand::Input(data.into_bytes())).is_err() {
                            break;
                        }
                    }
                    Ok(ControlMessage::Resize { cols, rows }) => {
                        let _ = input.send(PtyCommand::Resize { cols, rows });
                    }
                    Err(_) => {}
                },
                Message::Close(_) => break,
                _ => {}
            },
        }
    }

    // Killing the pty ends the output stream; the writer then delivers the
    // 1001 close frame on its own.
    killer.kill();
    let _ = writer;
    tracing::debug!("terminal socket for '{}' closed", room.id);
}
