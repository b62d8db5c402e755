//! WebSocket connection lifecycle: hello, read/write loops, command routing.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use webeval_browser::screencast::Frame;
use webeval_core::control::ControlOrigin;
use webeval_core::error::WebEvalError;
use webeval_core::events::Event;
use webeval_core::protocol::{CommandFrame, ErrorShape, PROTOCOL_VERSION, ServerFrame};

use crate::state::{ConnectionState, DashboardState};

/// Build the first frame a connection receives: the active session, its
/// current state and the backlog of visible events.
pub fn hello_frame(state: &DashboardState) -> ServerFrame {
    match state.sessions.active() {
        Some(session) => {
            let bus = session.events();
            let filter = state.event_filter();
            let events: Vec<Event> = bus.view(filter).iter().cloned().collect();
            ServerFrame::Hello {
                version: PROTOCOL_VERSION,
                session: Some(session.info()),
                state: Some(session.control().snapshot()),
                events,
                truncated: bus.truncated(),
            }
        }
        None => ServerFrame::Hello {
            version: PROTOCOL_VERSION,
            session: None,
            state: None,
            events: Vec::new(),
            truncated: 0,
        },
    }
}

/// Parse an inbound text message. On failure returns the ack to send back.
pub fn parse_command(text: &str) -> Result<CommandFrame, ServerFrame> {
    serde_json::from_str::<CommandFrame>(text).map_err(|e| {
        // Keep the request id when the frame was JSON but not a known command.
        let id = serde_json::from_str::<serde_json::Value>(text)
            .ok()
            .and_then(|v| v.get("id").and_then(|id| id.as_str()).map(String::from));
        ServerFrame::ack_err(
            id,
            ErrorShape {
                code: "parse_error".into(),
                message: format!("Invalid command: {e}"),
            },
        )
    })
}

/// Route a command through the active session's control state.
pub fn handle_command(state: &DashboardState, command: CommandFrame) -> ServerFrame {
    let Some(session) = state.sessions.active() else {
        return ServerFrame::ack_err(command.id, ErrorShape::from(&WebEvalError::NoSession));
    };
    match session
        .control()
        .request(command.command, ControlOrigin::Dashboard)
    {
        Ok(snapshot) => ServerFrame::ack_ok(command.id, snapshot),
        Err(e) => ServerFrame::ack_err(command.id, ErrorShape::from(&e)),
    }
}

fn frame_message(frame: &Frame) -> Option<String> {
    ServerFrame::Frame {
        frame_id: frame.frame_id,
        format: frame.format.as_str().to_string(),
        data: frame.data.clone(),
        timestamp: frame.timestamp,
    }
    .to_json()
    .ok()
}

/// Handle a new WebSocket connection.
pub async fn handle_ws_connection(state: Arc<DashboardState>, ws: WebSocket) {
    let conn_id = Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, "New dashboard connection");

    let (mut ws_tx, mut ws_rx) = ws.split();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<String>();

    // Queue hello before registering so it precedes every broadcast.
    {
        let mut connections = state.connections.write().await;
        match hello_frame(&state).to_json() {
            Ok(msg) => {
                let _ = event_tx.send(msg);
            }
            Err(e) => error!(conn_id = %conn_id, %e, "Failed to serialize hello"),
        }
        connections.insert(
            conn_id.clone(),
            ConnectionState {
                conn_id: conn_id.clone(),
                event_tx: event_tx.clone(),
            },
        );
    }

    // Writer: queued frames in order, plus only the newest screencast frame.
    let mut frames = state.subscribe_frames();
    frames.mark_changed();
    let writer_conn = conn_id.clone();
    let send_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                biased;
                queued = event_rx.recv() => match queued {
                    Some(msg) => msg,
                    None => break,
                },
                Ok(()) = frames.changed() => {
                    let frame = frames.borrow_and_update().clone();
                    match frame.as_deref().and_then(frame_message) {
                        Some(msg) => msg,
                        None => continue,
                    }
                }
            };
            if ws_tx.send(Message::Text(msg.into())).await.is_err() {
                debug!(conn_id = %writer_conn, "Client went away");
                break;
            }
        }
    });

    while let Some(msg_result) = ws_rx.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                let reply = match parse_command(text.as_str()) {
                    Ok(command) => {
                        debug!(conn_id = %conn_id, command = ?command.command, "Dashboard command");
                        handle_command(&state, command)
                    }
                    Err(reply) => {
                        warn!(conn_id = %conn_id, "Invalid frame received");
                        reply
                    }
                };
                if let Ok(msg) = reply.to_json() {
                    let _ = event_tx.send(msg);
                }
            }
            Ok(Message::Ping(_)) => {
                // Axum handles ping/pong automatically
            }
            Ok(Message::Close(_)) => {
                debug!(conn_id = %conn_id, "Client requested close");
                break;
            }
            Err(e) => {
                error!(conn_id = %conn_id, %e, "WebSocket error");
                break;
            }
            _ => {}
        }
    }

    send_task.abort();
    cleanup_connection(&state, &conn_id).await;
    info!(conn_id = %conn_id, "Dashboard connection closed");
}

async fn cleanup_connection(state: &Arc<DashboardState>, conn_id: &str) {
    let mut connections = state.connections.write().await;
    connections.remove(conn_id);
}
