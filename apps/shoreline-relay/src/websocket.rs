use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use shoreline_proto::{ClientEnvelope, ServerEnvelope};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::relay::RelayState;

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(relay): State<RelayState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, relay, remote_addr))
}

/// Serves one signaling channel until the socket closes.
async fn handle_socket(socket: WebSocket, relay: RelayState, remote_addr: SocketAddr) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEnvelope>();
    let mut session = relay.connect(tx);
    let channel = session.id();

    // Writer task: everything routed to this channel goes out in order.
    let writer = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            match serde_json::to_string(&envelope) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(err) => warn!(channel = %channel, "failed to encode envelope: {err}"),
            }
        }
        let _ = sender.close().await;
        debug!(channel = %channel, "writer task ended");
    });

    debug!(channel = %channel, remote = %remote_addr, "websocket connected");

    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                error!(channel = %channel, "websocket error: {err}");
                break;
            }
        };

        let text = match frame {
            Message::Text(text) => text,
            // Some clients ship JSON in binary frames.
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    warn!(channel = %channel, "dropping non-UTF8 binary frame");
                    continue;
                }
            },
            Message::Close(_) => {
                debug!(channel = %channel, "received close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        match serde_json::from_str::<ClientEnvelope>(&text) {
            Ok(envelope) => relay.dispatch(&mut session, envelope).await,
            Err(err) => {
                warn!(channel = %channel, "dropping malformed envelope: {err}");
            }
        }
    }

    relay.disconnect(&session);
    // Dropping the session releases the last sender once the connection
    // table entry is gone, which ends the writer.
    drop(session);
    if let Err(err) = writer.await {
        warn!(channel = %channel, "writer task failed: {err}");
    }
    debug!(channel = %channel, remote = %remote_addr, "websocket disconnected");
}
