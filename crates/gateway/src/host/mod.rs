//! Host-link session: framing, socket lifecycle, request multiplexing.

pub mod codec;
pub mod link;
pub mod mux;

pub use codec::FrameCodec;
pub use link::HostWriter;
