//! WebSocket surface: JSON-RPC 2.0 over `/websocket`.

pub mod handler;
pub mod rpc;

pub use rpc::JsonRpc;
