//! Length-prefixed frame codec for the proxy socket.
//!
//! Header layout (big endian):
//!
//! ```text
//!  0      2      3         6            7        8            12
//!  | ver  | hlen | reserved | flags|type | opcode | payload len |
//! ```
//!
//! `hlen` counts 4-byte words. Bytes beyond the first twelve are skipped.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    Command, FLAG_IN_ERROR, Frame, FrameError, FrameHeader, FrameType, MAX_PAYLOAD_LENGTH,
    MIN_HEADER_LENGTH, Notification, Stream, VERSION,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec {
    max_payload: Option<usize>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            max_payload: Some(max_payload),
        }
    }

    fn max_payload(&self) -> usize {
        self.max_payload.unwrap_or(MAX_PAYLOAD_LENGTH)
    }
}

fn opcode_valid(frame_type: FrameType, opcode: u8) -> bool {
    match frame_type {
        FrameType::Command | FrameType::Response => Command::from_u8(opcode).is_some(),
        FrameType::Stream => Stream::from_u8(opcode).is_some(),
        FrameType::Notification => Notification::from_u8(opcode).is_some(),
    }
}

/// Parse the fixed part of a header. `buf` must hold at least
/// `MIN_HEADER_LENGTH` bytes.
fn parse_header(buf: &[u8]) -> Result<(FrameHeader, usize), FrameError> {
    let version = u16::from_be_bytes([buf[0], buf[1]]);
    if version == 0 || version > VERSION {
        return Err(FrameError::BadVersion(version));
    }

    let header_length = buf[2] as usize * 4;
    if header_length < MIN_HEADER_LENGTH {
        return Err(FrameError::BadHeaderLength(header_length));
    }

    let raw_type = buf[6] & 0x0f;
    let frame_type = FrameType::from_u8(raw_type).ok_or(FrameError::BadType(raw_type))?;
    let opcode = buf[7];
    if !opcode_valid(frame_type, opcode) {
        return Err(FrameError::BadOpcode { frame_type, opcode });
    }

    let payload_length = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;

    Ok((
        FrameHeader {
            version,
            header_length,
            frame_type,
            opcode,
            in_error: buf[6] & FLAG_IN_ERROR != 0,
        },
        payload_length,
    ))
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < MIN_HEADER_LENGTH {
            return Ok(None);
        }

        let (header, payload_length) = parse_header(&src[..MIN_HEADER_LENGTH])?;
        if payload_length > self.max_payload() {
            return Err(FrameError::PayloadTooLarge(payload_length));
        }

        let total = header.header_length + payload_length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(header.header_length);
        let payload = src.split_to(payload_length).to_vec();
        Ok(Some(Frame { header, payload }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::Truncated),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        if frame.payload.len() > self.max_payload() {
            return Err(FrameError::PayloadTooLarge(frame.payload.len()));
        }
        if !opcode_valid(frame.header.frame_type, frame.header.opcode) {
            return Err(FrameError::BadOpcode {
                frame_type: frame.header.frame_type,
                opcode: frame.header.opcode,
            });
        }

        let mut flags = frame.header.frame_type as u8;
        if frame.header.in_error {
            flags |= FLAG_IN_ERROR;
        }

        dst.reserve(MIN_HEADER_LENGTH + frame.payload.len());
        dst.put_u16(VERSION);
        dst.put_u8((MIN_HEADER_LENGTH / 4) as u8);
        dst.put_bytes(0, 3);
        dst.put_u8(flags);
        dst.put_u8(frame.header.opcode);
        dst.put_u32(frame.payload.len() as u32);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

/// Serialise a frame into a standalone buffer.
pub fn encode_frame(frame: Frame) -> Result<Vec<u8>, FrameError> {
    let mut buf = BytesMut::new();
    FrameCodec::new().encode(frame, &mut buf)?;
    Ok(buf.to_vec())
}
