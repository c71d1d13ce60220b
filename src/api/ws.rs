//! Room and dashboard WebSockets.
//!
//! The room socket carries JSON in both directions: hub frames out,
//! `recording_started`/`recording_stopped` advisories in (these drive the
//! single-talker lock). The dashboard socket is outbound-only and mirrors
//! `session_activity` edges for every room.
//!
//! Write budget 10s per frame; read deadline 60s (any inbound traffic,
//! including pongs, resets it). A subscriber is removed from its room
//! synchronously when the socket closes.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path as AxumPath, State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};

use crate::hub::{ClientMessage, RoomChannel, ServerMessage};

use super::resolve_room;
use super::routes::AppState;

/// GET /ws/{name} - Per-room JSON socket.
pub async fn room_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> impl IntoResponse {
    match resolve_room(&state, &name).await {
        Ok((_room, channel)) => ws
            .on_upgrade(move |socket| handle_room(socket, state, channel))
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /ws/dashboard - Portal-wide activity socket.
pub async fn dashboard_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let channel = state.hub.dashboard();
    ws.on_upgrade(move |socket| handle_room(socket, state, channel))
}

async fn handle_room(mut socket: WebSocket, state: Arc<AppState>, channel: Arc<RoomChannel>) {
    let write_budget = Duration::from_secs(state.config.timeouts.ws_write_secs);
    let read_deadline = Duration::from_secs(state.config.timeouts.ws_pong_secs);

    // Late joiners get the current pending state up front.
    if let Some(question) = channel.current_question().await {
        let frame = ServerMessage::Question {
            header: question.header,
            question: question.question,
            options: question.options,
        };
        if send_json(&mut socket, &frame, write_budget).await.is_err() {
            return;
        }
    }
    if let Some(pending) = channel.current_permission().await {
        let frame = ServerMessage::PermissionRequest {
            tool: pending.tool,
            input: pending.input,
            message: pending.message,
        };
        if send_json(&mut socket, &frame, write_budget).await.is_err() {
            return;
        }
    }

    let (sub_id, mut frames) = channel.subscribe().await;
    let (mut sender, mut receiver) = socket.split();

    // Writer: hub frames -> socket, closing 1001 when the stream ends.
    let writer = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            let message = Message::Text(frame.as_ref().clone());
            match tokio::time::timeout(write_budget, sender.send(message)).await {
                Ok(Ok(())) => {}
                _ => return,
            }
        }
        let close = Message::Close(Some(CloseFrame {
            code: close_code::AWAY,
            reason: "going away".into(),
        }));
        let _ = tokio::time::timeout(write_budget, sender.send(close)).await;
    });

    loop {
        let next = tokio::time::timeout(read_deadline, receiver.next()).await;
        match next {
            // Read deadline blown: the client stopped ponging.
            Err(_) => break,
            Ok(None) => break,
            Ok(Some(Err(_))) => break,
            Ok(Some(Ok(message))) => match message {
                Message::Text(text) => {
                    if let Ok(msg) = serde_json::from_str::<ClientMessage>(&text) {
                        match msg {
                            ClientMessage::RecordingStarted => {
                                channel.try_lock(sub_id).await;
                            }
                            ClientMessage::RecordingStopped => {
                                channel.unlock(sub_id).await;
                            }
                        }
                    }
                }
                Message::Close(_) => break,
                // Pings are answered by the protocol layer; pongs reset the
                // deadline by arriving at all.
                _ => {}
            },
        }
    }

    // Synchronous removal; the writer drains and closes on its own once the
    // subscriber's sender is dropped.
    channel.unsubscribe(sub_id).await;
    let _ = writer;
}

async fn send_json(
    socket: &mut WebSocket,
    msg: &ServerMessage,
    budget: Duration,
) -> Result<(), ()> {
    let text = serde_json::to_string(msg).map_err(|_| ())?;
    match tokio::time::timeout(budget, socket.send(Message::Text(text))).await {
        Ok(Ok(())) => Ok(()),
        _ => Err(()),
    }
}
