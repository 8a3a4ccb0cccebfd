//! Event fan-out to WebSocket clients.
//!
//! Host-originated notifications are broadcast to every open WebSocket as
//! JSON-RPC notifications whose `params` is always a single-element array.
//! Delivery is best-effort: each connection has a bounded outbound queue,
//! and a connection that cannot keep up is closed instead of blocking the
//! rest.

use crate::host::mux;
use crate::service::GatewayState;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Identifier for one WebSocket connection
pub type ConnId = u64;

/// Outbound frames queued per connection before it is declared too slow
pub const OUTBOUND_QUEUE_SIZE: usize = 256;

struct ConnectionHandle {
    tx: mpsc::Sender<String>,
    remote: SocketAddr,
    trusted: bool,
}

/// Registry of open WebSocket connections.
#[derive(Default)]
pub struct WebsocketManager {
    connections: DashMap<ConnId, ConnectionHandle>,
    next_id: AtomicU64,
}

impl WebsocketManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection; the returned receiver feeds the socket's writer.
    pub fn add(&self, remote: SocketAddr, trusted: bool) -> (ConnId, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        self.connections
            .insert(id, ConnectionHandle { tx, remote, trusted });
        info!(conn_id = id, remote = %remote, trusted, "websocket added");
        (id, rx)
    }

    /// Drop a connection record. The writer task ends once the queue drains.
    pub fn remove(&self, id: ConnId) {
        if self.connections.remove(&id).is_some() {
            info!(conn_id = id, "websocket removed");
        }
    }

    /// Queue a frame for one connection. A full or closed queue drops the
    /// connection and returns false.
    pub fn send_to(&self, id: ConnId, message: String) -> bool {
        let Some(handle) = self.connections.get(&id) else {
            return false;
        };
        match handle.tx.try_send(message) {
            Ok(()) => true,
            Err(e) => {
                drop(handle);
                warn!(conn_id = id, error = %e, "websocket send failed, closing connection");
                self.connections.remove(&id);
                false
            }
        }
    }

    /// Queue a frame for every connection.
    pub fn broadcast(&self, message: &str) {
        let mut dead = Vec::new();
        for item in self.connections.iter() {
            if item.tx.try_send(message.to_string()).is_err() {
                dead.push(*item.key());
            }
        }
        for id in dead {
            warn!(conn_id = id, "websocket too slow, closing connection");
            self.connections.remove(&id);
        }
    }

    /// Broadcast a JSON-RPC notification.
    pub fn notify(&self, name: &str, data: Value) {
        if self.connections.is_empty() {
            return;
        }
        let message = notification(name, data).to_string();
        debug!(notification = name, "broadcasting");
        self.broadcast(&message);
    }

    /// Send a JSON-RPC notification to one connection.
    pub fn notify_to(&self, id: ConnId, name: &str, data: Value) -> bool {
        self.send_to(id, notification(name, data).to_string())
    }

    /// Remote address recorded at upgrade time.
    pub fn remote_addr(&self, id: ConnId) -> Option<SocketAddr> {
        self.connections.get(&id).map(|c| c.remote)
    }

    /// Whether the connection was admitted as trusted.
    pub fn is_trusted(&self, id: ConnId) -> bool {
        self.connections.get(&id).map(|c| c.trusted).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

/// JSON-RPC notification envelope. `params` is always one-element.
pub fn notification(name: &str, data: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": format!("notify_{name}"),
        "params": [data],
    })
}

/// Fetch the current file list from the host and broadcast the change.
/// A host failure degrades to an empty list rather than suppressing the
/// notification.
pub async fn broadcast_filelist_changed(state: &GatewayState, filename: String, action: &str) {
    let filelist = match mux::submit(state, "/printer/files", json!({})).await {
        Ok(list) => list,
        Err(e) => {
            debug!(error = %e, "file list refresh failed");
            json!([])
        }
    };
    state.websockets.notify(
        "filelist_changed",
        json!({
            "filename": filename,
            "action": action,
            "filelist": filelist,
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:12345".parse().unwrap()
    }

    #[test]
    fn test_notification_envelope() {
        let value = notification("gcode_response", json!("Hello"));
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["method"], "notify_gcode_response");
        assert_eq!(value["params"], json!(["Hello"]));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_connections() {
        let manager = WebsocketManager::new();
        let (_a, mut rx_a) = manager.add(addr(), true);
        let (_b, mut rx_b) = manager.add(addr(), false);

        manager.notify("klippy_state_changed", json!("ready"));

        let msg_a: Value = serde_json::from_str(&rx_a.recv().await.unwrap()).unwrap();
        let msg_b: Value = serde_json::from_str(&rx_b.recv().await.unwrap()).unwrap();
        assert_eq!(msg_a["method"], "notify_klippy_state_changed");
        assert_eq!(msg_b["params"], json!(["ready"]));
    }

    #[tokio::test]
    async fn test_slow_connection_is_dropped() {
        let manager = WebsocketManager::new();
        let (id, _rx) = manager.add(addr(), true);
        for _ in 0..=OUTBOUND_QUEUE_SIZE {
            manager.broadcast("x");
        }
        assert!(!manager.send_to(id, "y".to_string()));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let manager = WebsocketManager::new();
        let (id, _rx) = manager.add(addr(), true);
        manager.remove(id);
        manager.remove(id);
        assert!(manager.is_empty());
    }
}
