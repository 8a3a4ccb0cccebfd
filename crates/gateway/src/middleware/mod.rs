//! Request middleware: admission control and CORS.

pub mod auth;
pub mod cors;

pub use auth::AuthLayer;
pub use cors::cors_layer;
