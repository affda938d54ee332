//! Session event stream
//!
//! `GET /api/session/events` upgrades to a WebSocket that mirrors every
//! session event as one JSON text frame, preceded by a snapshot frame so
//! late joiners can render current state immediately. The stream is
//! read-mostly; the only client input honored is close.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast;

use crate::state::AppState;

/// WebSocket upgrade for the event stream.
pub async fn events_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| stream_events(socket, state))
}

async fn stream_events(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.manager.subscribe();

    let hello = serde_json::json!({
        "event": "snapshot",
        "state": state.manager.snapshot(),
    });
    if sender.send(Message::Text(hello.to_string())).await.is_err() {
        return;
    }
    tracing::debug!("Event stream subscriber connected");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let frame = match serde_json::to_string(&event) {
                        Ok(frame) => frame,
                        Err(error) => {
                            tracing::error!(%error, "Failed to serialize session event");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event stream subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            message = receiver.next() => match message {
                // Pings are answered by axum itself.
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }
    tracing::debug!("Event stream subscriber disconnected");
}
