//! Push-only WebSocket for change events.
//!
//! Every connection becomes one notifier subscriber. Events are sent as
//! JSON text frames `{"type": ..., "data": {...}}`; client frames other than
//! ping and close are ignored.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};

use crate::notify::ChangeNotifier;

use super::router::AppState;

/// WebSocket handler.
///
/// GET /ws
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let notifier = state.vault.notifier().clone();
    ws.on_upgrade(move |socket| handle_socket(socket, notifier))
}

/// Forward events to one connection until either side goes away.
async fn handle_socket(socket: WebSocket, notifier: ChangeNotifier) {
    let mut subscription = notifier.subscribe();
    let subscriber_id = subscription.id();
    tracing::debug!(subscriber_id, "WebSocket subscriber connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    loop {
        tokio::select! {
            event = subscription.recv() => {
                // None: dropped for being slow, or the hub shut down
                let Some(event) = event else {
                    tracing::debug!(subscriber_id, "Outbox closed");
                    break;
                };
                let json = match event.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!("Failed to serialize {} event: {}", event.event_type.as_str(), e);
                        continue;
                    }
                };
                if ws_sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }

            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::debug!(subscriber_id, "WebSocket closed by client");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_sender.send(Message::Pong(data)).await;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!("WebSocket error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    notifier.unsubscribe(subscriber_id);
    let _ = ws_sender.close().await;
    tracing::debug!(subscriber_id, "WebSocket subscriber disconnected");
}
