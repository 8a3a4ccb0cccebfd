//! Frame codec for the host socket.
//!
//! Each message is a compact UTF-8 JSON object terminated by a single
//! end-of-text byte (0x03). Malformed JSON is unrecoverable for the link:
//! the decoder surfaces an error and the caller tears the session down.

use bytes::{Buf, BufMut, BytesMut};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

/// Frame terminator byte (ASCII ETX)
pub const FRAME_TERMINATOR: u8 = 0x03;

/// Upper bound on a single frame; guards the read buffer against a peer
/// that never sends a terminator.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame exceeds {MAX_FRAME_LEN} bytes without terminator")]
    Oversized,
    #[error("malformed frame json: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// ETX-delimited JSON codec.
#[derive(Debug, Default)]
pub struct FrameCodec {
    _private: (),
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for FrameCodec {
    type Item = Value;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>, CodecError> {
        let Some(pos) = src.iter().position(|b| *b == FRAME_TERMINATOR) else {
            if src.len() > MAX_FRAME_LEN {
                return Err(CodecError::Oversized);
            }
            return Ok(None);
        };
        let frame = src.split_to(pos);
        src.advance(1);
        let value = serde_json::from_slice(&frame)?;
        Ok(Some(value))
    }
}

impl Encoder<Value> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Value, dst: &mut BytesMut) -> Result<(), CodecError> {
        let data = serde_json::to_vec(&item)?;
        dst.reserve(data.len() + 1);
        dst.extend_from_slice(&data);
        dst.put_u8(FRAME_TERMINATOR);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn buf(data: &[u8]) -> BytesMut {
        BytesMut::from(data)
    }

    #[test]
    fn test_roundtrip() {
        let mut codec = FrameCodec::new();
        let mut bytes = BytesMut::new();
        codec
            .encode(json!({"method": "set_klippy_ready"}), &mut bytes)
            .unwrap();
        assert_eq!(*bytes.last().unwrap(), FRAME_TERMINATOR);

        let decoded = codec.decode(&mut bytes).unwrap().unwrap();
        assert_eq!(decoded["method"], "set_klippy_ready");
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_partial_frame_waits_for_terminator() {
        let mut codec = FrameCodec::new();
        let mut bytes = buf(b"{\"method\":");
        assert!(codec.decode(&mut bytes).unwrap().is_none());

        bytes.extend_from_slice(b"\"x\"}\x03");
        let decoded = codec.decode(&mut bytes).unwrap().unwrap();
        assert_eq!(decoded["method"], "x");
    }

    #[test]
    fn test_multiple_frames_in_one_read() {
        let mut codec = FrameCodec::new();
        let mut bytes = buf(b"{\"a\":1}\x03{\"b\":2}\x03");
        assert_eq!(codec.decode(&mut bytes).unwrap().unwrap()["a"], 1);
        assert_eq!(codec.decode(&mut bytes).unwrap().unwrap()["b"], 2);
        assert!(codec.decode(&mut bytes).unwrap().is_none());
    }

    #[test]
    fn test_malformed_json_is_fatal() {
        let mut codec = FrameCodec::new();
        let mut bytes = buf(b"not json\x03");
        assert!(matches!(
            codec.decode(&mut bytes),
            Err(CodecError::Json(_))
        ));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = FrameCodec::new();
        let mut bytes = BytesMut::new();
        bytes.resize(MAX_FRAME_LEN + 1, b'a');
        assert!(matches!(
            codec.decode(&mut bytes),
            Err(CodecError::Oversized)
        ));
    }
}
