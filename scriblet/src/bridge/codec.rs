//! Line framing and the pure encode/decode surface.
//!
//! The worker speaks one UTF-8 JSON document per newline-terminated line.
//! [`LineCodec`] does the framing with an explicit buffer-and-scan loop
//! over any AsyncRead/AsyncWrite; [`encode_request`] and
//! [`decode_response_line`] are the no-I/O envelope functions layered on
//! the validators in [`super::protocol`].

use std::io;

use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{
    ProtocolError, RequestEnvelope, ResponseEnvelope, preview_line, validate_response,
};

/// Hard cap on a single unterminated line before the stream is refused.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Newline-delimited frame codec.
///
/// Buffers until a terminator is seen; a partial line is never yielded,
/// at EOF an unterminated tail is discarded. Frames are delivered in byte
/// order with `\r?\n` stripped.
#[derive(Debug)]
pub struct LineCodec {
    max_line_bytes: usize,
}

impl LineCodec {
    pub fn new() -> Self {
        Self {
            max_line_bytes: MAX_LINE_BYTES,
        }
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match src.iter().position(|&b| b == b'\n') {
            Some(idx) => {
                let mut frame = src.split_to(idx + 1);
                frame.truncate(idx);
                if frame.ends_with(b"\r") {
                    frame.truncate(frame.len() - 1);
                }
                Ok(Some(String::from_utf8_lossy(&frame).into_owned()))
            }
            None if src.len() > self.max_line_bytes => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "line exceeds {} bytes without a terminator",
                    self.max_line_bytes
                ),
            )),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if !src.is_empty() {
            // Unterminated tail: partial lines are never delivered.
            tracing::debug!(discarded = src.len(), "discarding unterminated tail at EOF");
            src.clear();
        }
        Ok(None)
    }
}

impl Encoder<String> for LineCodec {
    type Error = io::Error;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_str(&item, dst)
    }
}

impl Encoder<&str> for LineCodec {
    type Error = io::Error;

    fn encode(&mut self, item: &str, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_str(item, dst)
    }
}

fn encode_str(item: &str, dst: &mut BytesMut) -> Result<(), io::Error> {
    if item.contains('\n') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame contains an embedded newline",
        ));
    }
    dst.reserve(item.len() + 1);
    dst.put_slice(item.as_bytes());
    dst.put_u8(b'\n');
    Ok(())
}

/// Serialize a request to a single wire line, trailing newline included.
pub fn encode_request(req: &RequestEnvelope) -> Result<String, ProtocolError> {
    let mut line =
        serde_json::to_string(req).map_err(|source| ProtocolError::Encode { source })?;
    // Compact serialization escapes all control characters, so the frame
    // holds no newline until this one.
    line.push('\n');
    Ok(line)
}

/// Parse and validate one line as a response envelope.
///
/// Both parse and validation failures come back as [`ProtocolError`]s
/// naming the offending line. Empty input is invalid.
pub fn decode_response_line(line: &str) -> Result<ResponseEnvelope, ProtocolError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(ProtocolError::EmptyFrame);
    }
    let value: serde_json::Value =
        serde_json::from_str(trimmed).map_err(|source| ProtocolError::MalformedFrame {
            line: preview_line(line),
            source,
        })?;
    validate_response(&value).map_err(|source| ProtocolError::InvalidResponse {
        line: preview_line(line),
        source: Box::new(source),
    })
}
