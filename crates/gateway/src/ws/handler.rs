//! WebSocket connection handling.
//!
//! Each accepted socket gets a connection record, a writer task draining
//! its outbound queue, and a read loop that dispatches one JSON-RPC
//! message per text or binary frame. Messages are processed concurrently;
//! clients correlate replies by JSON-RPC id.

use crate::auth::AuthLevel;
use crate::domain::error::rpc_codes;
use crate::service::GatewayState;
use crate::status::engine::Subscriber;
use crate::ws::rpc;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Extension, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};

/// `GET /websocket` upgrade handler. Admission already happened in the
/// auth layer; untrusted clients got here via a one-shot `?token=`.
pub async fn websocket_upgrade(
    State(state): State<Arc<GatewayState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(level): Extension<AuthLevel>,
    ws: WebSocketUpgrade,
) -> Response {
    let trusted = level == AuthLevel::Trusted;
    ws.on_upgrade(move |socket| handle_socket(state, socket, addr, trusted))
}

async fn handle_socket(
    state: Arc<GatewayState>,
    socket: WebSocket,
    addr: SocketAddr,
    trusted: bool,
) {
    let (conn_id, mut outbound) = state.websockets.add(addr, trusted);
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if sink.send(Message::Text(message)).await.is_err() {
                break;
            }
        }
    });

    while let Some(received) = stream.next().await {
        let message = match received {
            Ok(message) => message,
            Err(e) => {
                debug!(conn_id, error = %e, "websocket read error");
                break;
            }
        };
        let text = match message {
            Message::Text(text) => text,
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    state.websockets.send_to(
                        conn_id,
                        rpc::error_response(None, rpc_codes::PARSE_ERROR, "Parse error")
                            .to_string(),
                    );
                    continue;
                }
            },
            Message::Close(_) => break,
            // pings are answered by the protocol layer
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Some(response) = state.rpc.dispatch(&state, conn_id, &text).await {
                state.websockets.send_to(conn_id, response);
            }
        });
    }

    info!(
        conn_id,
        trusted = state.websockets.is_trusted(conn_id),
        "websocket disconnecting"
    );
    writer.abort();
    state.websockets.remove(conn_id);
    state.engine.unsubscribe_all(Subscriber::Ws(conn_id));
}
