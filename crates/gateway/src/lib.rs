//! Moonraker gateway - HTTP/WebSocket front end for the Klippy host process.
//!
//! The gateway sits between web clients and the single-threaded printer host.
//! Clients speak HTTP and JSON-RPC 2.0 over WebSocket; the gateway speaks a
//! length-framed JSON protocol to the host over a Unix-domain socket.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         GATEWAY                              │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌────────────┐   ┌────────────┐                             │
//! │  │  HTTP/REST │   │ WebSocket  │       Port 7125             │
//! │  └─────┬──────┘   └─────┬──────┘                             │
//! │        │                │                                    │
//! │  ┌─────┴────────────────┴──────┐                             │
//! │  │     CORS → Auth Gate        │                             │
//! │  └──────────────┬──────────────┘                             │
//! │                 │                                            │
//! │  ┌──────────────┴──────────────┐    ┌────────────────────┐   │
//! │  │    Endpoint Invocation      │───▶│ Subscription Engine│   │
//! │  │  (registry lookup + mux)    │    │  (tiered polling)  │   │
//! │  └──────────────┬──────────────┘    └────────────────────┘   │
//! │                 │                                            │
//! │  ┌──────────────┴──────────────┐                             │
//! │  │   Pending Request Store     │                             │
//! │  └──────────────┬──────────────┘                             │
//! │                 │                                            │
//! │  ┌──────────────┴──────────────┐                             │
//! │  │        Host Link            │  /tmp/moonraker (UDS)       │
//! │  └─────────────────────────────┘                             │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Endpoints are not compiled in: the host registers them after it connects,
//! and HTTP routing resolves against that registry per request. Host-side
//! notifications (gcode responses, file list changes, status updates, state
//! transitions) fan out to every open WebSocket as JSON-RPC notifications.

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod auth;
pub mod domain;
pub mod events;
pub mod host;
pub mod http;
pub mod middleware;
pub mod router;
pub mod service;
pub mod status;
pub mod ws;

pub use domain::config::ServerConfig;
pub use domain::error::{ApiError, GatewayError};
pub use service::{GatewayState, MoonrakerServer, ServerArgs};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
