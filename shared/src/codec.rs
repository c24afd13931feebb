//! Length-prefixed framing for session streams
//!
//! Every envelope travels as:
//! ```text
//! [ 4 bytes: length (u32, big-endian) ][ N bytes: protobuf Envelope ]
//! ```
//!
//! Transports only guarantee ordered bytes; the prefix restores message
//! boundaries on top of them.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;

use crate::Envelope;

/// Maximum frame body (10 MB)
pub const MAX_FRAME_SIZE: u32 = 10 * 1024 * 1024;

const PREFIX_LEN: usize = 4;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("Invalid frame length prefix: {0}")]
    InvalidLength(u32),

    #[error("Protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Protobuf encode error: {0}")]
    Encode(#[from] prost::EncodeError),
}

/// Encode an envelope into a single frame
pub fn encode(envelope: &Envelope) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::new();
    encode_into(envelope, &mut buf)?;
    Ok(buf.freeze())
}

/// Append one frame to `buf`
pub fn encode_into(envelope: &Envelope, buf: &mut BytesMut) -> Result<(), CodecError> {
    let body_len = envelope.encoded_len();
    if body_len > MAX_FRAME_SIZE as usize {
        return Err(CodecError::FrameTooLarge(body_len));
    }

    buf.reserve(PREFIX_LEN + body_len);
    buf.put_u32(body_len as u32);
    envelope.encode(buf)?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Waiting for the 4-byte prefix
    Prefix,
    /// Prefix consumed, waiting for this many body bytes
    Body(usize),
}

/// Incremental decoder fed with whatever the transport read
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    state: DecodeState,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            state: DecodeState::Prefix,
        }
    }

    /// Add raw bytes read from the transport
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Decode the next complete envelope, if one is buffered
    ///
    /// Call repeatedly until it returns `Ok(None)`. An error leaves the
    /// stream unrecoverable; the caller should drop the connection.
    pub fn decode_next(&mut self) -> Result<Option<Envelope>, CodecError> {
        if self.state == DecodeState::Prefix {
            if self.buffer.len() < PREFIX_LEN {
                return Ok(None);
            }
            let len = self.buffer.get_u32();
            if len > MAX_FRAME_SIZE {
                return Err(CodecError::InvalidLength(len));
            }
            self.state = DecodeState::Body(len as usize);
        }

        let DecodeState::Body(len) = self.state else {
            return Ok(None);
        };
        if self.buffer.len() < len {
            self.buffer.reserve(len - self.buffer.len());
            return Ok(None);
        }

        let body = self.buffer.split_to(len);
        self.state = DecodeState::Prefix;
        Ok(Some(Envelope::decode(body)?))
    }

    /// Bytes buffered but not yet decoded
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Payload, CONTROL_CHANNEL};

    fn handshake_frame() -> Bytes {
        encode(&Envelope::new(CONTROL_CHANNEL, Payload::handshake("drone-1"))).expect("encode")
    }

    #[test]
    fn test_prefix_matches_body_length() {
        let frame = handshake_frame();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        assert_eq!(len as usize, frame.len() - PREFIX_LEN);
    }

    #[test]
    fn test_frame_split_across_every_byte() {
        let frame = handshake_frame();
        let mut decoder = FrameDecoder::new();

        for byte in &frame[..frame.len() - 1] {
            decoder.extend(std::slice::from_ref(byte));
            assert!(decoder.decode_next().expect("decode").is_none());
        }
        decoder.extend(&frame[frame.len() - 1..]);

        let envelope = decoder.decode_next().expect("decode").expect("frame");
        assert_eq!(envelope.payload, Some(Payload::handshake("drone-1")));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_back_to_back_frames_keep_order() {
        let mut buf = BytesMut::new();
        encode_into(&Envelope::new(9, Payload::chunk(b"a".to_vec())), &mut buf).expect("encode");
        encode_into(&Envelope::new(9, Payload::chunk(b"b".to_vec())), &mut buf).expect("encode");
        encode_into(&Envelope::new(9, Payload::choke()), &mut buf).expect("encode");

        let mut decoder = FrameDecoder::new();
        decoder.extend(&buf);

        let mut payloads = Vec::new();
        while let Some(envelope) = decoder.decode_next().expect("decode") {
            payloads.push(envelope.payload.expect("payload"));
        }
        assert_eq!(
            payloads,
            vec![
                Payload::chunk(b"a".to_vec()),
                Payload::chunk(b"b".to_vec()),
                Payload::choke(),
            ]
        );
    }

    #[test]
    fn test_oversized_prefix_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&(MAX_FRAME_SIZE + 1).to_be_bytes());
        assert!(matches!(
            decoder.decode_next(),
            Err(CodecError::InvalidLength(_))
        ));
    }

    #[test]
    fn test_garbage_body_is_decode_error() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&3u32.to_be_bytes());
        decoder.extend(&[0xff, 0xff, 0xff]);
        assert!(matches!(decoder.decode_next(), Err(CodecError::Decode(_))));
    }
}
