//! Per-connection terminal loop over a WebSocket.
//!
//! Inbound frames are decoded and handed to the session. Command results
//! come back from the session worker on a channel and are written by a
//! separate task, so a slow command never stalls reading this socket.

use crate::protocol::{decode, with_prompt, ClientMessage, ServerMessage, GREETING, PROMPT};
use crate::session::{CommandReply, Session};
use crate::state::{AppState, Connection};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Replies buffered per connection before the worker waits on the writer.
const REPLY_BUFFER: usize = 16;

type WsSink = SplitSink<WebSocket, Message>;

pub async fn terminal_ws(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, state))
}

async fn send(sink: &mut WsSink, message: ServerMessage) -> Result<(), axum::Error> {
    sink.send(Message::Text(message.encode())).await
}

async fn handle_socket(socket: WebSocket, session_id: String, state: AppState) {
    let connection_id = Uuid::new_v4();
    state.connections.insert(
        connection_id,
        Connection {
            session_id: session_id.clone(),
            connected_at: Instant::now(),
        },
    );
    info!(session = %session_id, connection = %connection_id, "WebSocket connected");

    let (mut sink, stream) = socket.split();
    let attached = match state.registry.get_or_create(&session_id).await {
        Ok(session) => {
            if send(&mut sink, ServerMessage::Output(with_prompt(GREETING))).await.is_ok() {
                run_loop(&session, sink, stream).await;
            }
            true
        }
        Err(e) => {
            error!(session = %session_id, error = %e, "Failed to open session");
            let _ = send(&mut sink, ServerMessage::Error(format!("Error: {}", e))).await;
            let _ = sink.close().await;
            false
        }
    };

    state.connections.remove(&connection_id);
    if attached {
        state.registry.release(&session_id).await;
    }
    info!(session = %session_id, connection = %connection_id, "WebSocket disconnected");
}

fn reply_message(reply: CommandReply) -> ServerMessage {
    match reply {
        Ok(output) => ServerMessage::Output(with_prompt(&output)),
        Err(e) => ServerMessage::Error(format!("Error: {}\n{}", e, PROMPT)),
    }
}

async fn run_loop(session: &Arc<Session>, sink: WsSink, mut stream: SplitStream<WebSocket>) {
    let (reply_tx, mut reply_rx) = mpsc::channel::<CommandReply>(REPLY_BUFFER);
    let mut writer = tokio::spawn(async move {
        let mut sink = sink;
        while let Some(reply) = reply_rx.recv().await {
            if send(&mut sink, reply_message(reply)).await.is_err() {
                break;
            }
        }
    });

    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            // writer gone means the socket is unusable
            _ = &mut writer => break,
        };
        let Some(frame) = frame else {
            break;
        };

        match frame {
            Ok(Message::Text(text)) => match decode(&text) {
                Ok(ClientMessage::Command { data }) => {
                    info!(session = %session.id(), command = %data, "Executing command");
                    if let Err(e) = session.submit(data, reply_tx.clone()).await {
                        warn!(session = %session.id(), error = %e, "Command not accepted");
                        let _ = reply_tx.send(Err(e)).await;
                    }
                }
                Ok(ClientMessage::Resize { cols, rows }) => {
                    debug!(session = %session.id(), cols, rows, "Terminal resized");
                    session.resize(cols, rows).await;
                }
                Ok(ClientMessage::Unknown) => {
                    debug!(session = %session.id(), "Ignoring message of unknown type");
                }
                Err(e) => {
                    warn!(session = %session.id(), error = %e, "Malformed message, closing connection");
                    break;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(session = %session.id(), error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    writer.abort();
}
