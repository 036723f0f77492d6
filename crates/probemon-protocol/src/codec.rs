//! Newline-delimited JSON framing.

use thiserror::Error;

use crate::message::Frame;

/// Maximum frame size (1 MB).
pub const MAX_FRAME_SIZE: usize = 1_048_576;

/// Errors produced while encoding or decoding frames.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Frame too large: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Encodes a frame as one line, including the trailing newline.
pub fn encode(frame: &Frame) -> Result<String, FrameError> {
    let mut line = serde_json::to_string(frame)?;
    if line.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            size: line.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    line.push('\n');
    Ok(line)
}

/// Decodes one line (trailing whitespace allowed).
pub fn decode(line: &str) -> Result<Frame, FrameError> {
    if line.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            size: line.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(serde_json::from_str(line.trim_end())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_encode_appends_newline() {
        let line = encode(&Frame::event("connection:ping", Value::Null)).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn test_decode_trailing_newline() {
        let frame = decode("{\"type\":\"event\",\"name\":\"x\",\"payload\":{\"a\":1}}\n").unwrap();
        assert_eq!(frame, Frame::event("x", json!({"a": 1})));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode("not json"), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn test_oversized_frame() {
        let big = "x".repeat(MAX_FRAME_SIZE + 1);
        assert!(matches!(decode(&big), Err(FrameError::TooLarge { .. })));
    }
}
