//! Multiplexer frame codec.
//!
//! Wire layout (big endian): `stream_id:u32 | type:u8 | length:u32 | payload`.
//! Each sealed record carries exactly one frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::shadowlink::tunnel::error::TunnelError;

pub const HEADER_LEN: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Open = 0,
    Data = 1,
    Close = 2,
    Reset = 3,
    Ping = 4,
    Pong = 5,
    Padding = 6,
    WindowUpdate = 7,
}

impl TryFrom<u8> for FrameType {
    type Error = TunnelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => FrameType::Open,
            1 => FrameType::Data,
            2 => FrameType::Close,
            3 => FrameType::Reset,
            4 => FrameType::Ping,
            5 => FrameType::Pong,
            6 => FrameType::Padding,
            7 => FrameType::WindowUpdate,
            other => return Err(TunnelError::protocol(format!("unknown frame type {other}"))),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: u32,
    pub kind: FrameType,
    pub payload: Bytes,
}

impl Frame {
    fn new(stream_id: u32, kind: FrameType, payload: Bytes) -> Self {
        Self {
            stream_id,
            kind,
            payload,
        }
    }

    pub fn open(stream_id: u32) -> Self {
        Self::new(stream_id, FrameType::Open, Bytes::new())
    }

    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self::new(stream_id, FrameType::Data, payload)
    }

    pub fn close(stream_id: u32) -> Self {
        Self::new(stream_id, FrameType::Close, Bytes::new())
    }

    pub fn reset(stream_id: u32) -> Self {
        Self::new(stream_id, FrameType::Reset, Bytes::new())
    }

    pub fn ping(nonce: u64) -> Self {
        Self::new(0, FrameType::Ping, Bytes::copy_from_slice(&nonce.to_be_bytes()))
    }

    pub fn pong(nonce: u64) -> Self {
        Self::new(0, FrameType::Pong, Bytes::copy_from_slice(&nonce.to_be_bytes()))
    }

    pub fn padding(len: usize) -> Self {
        Self::new(0, FrameType::Padding, Bytes::from(vec![0u8; len]))
    }

    /// Advertise the cumulative number of bytes the peer may send on a stream.
    pub fn window_update(stream_id: u32, limit: u64) -> Self {
        Self::new(
            stream_id,
            FrameType::WindowUpdate,
            Bytes::copy_from_slice(&limit.to_be_bytes()),
        )
    }

    /// The u64 carried by ping, pong and window update frames.
    pub fn value_u64(&self) -> Option<u64> {
        let b: [u8; 8] = self.payload.as_ref().try_into().ok()?;
        Some(u64::from_be_bytes(b))
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u32(self.stream_id);
        dst.put_u8(self.kind as u8);
        dst.put_u32(self.payload.len() as u32);
        dst.put_slice(&self.payload);
    }

    /// Decode exactly one frame from a record body.
    pub fn decode(mut src: Bytes, max_payload: usize) -> Result<Frame, TunnelError> {
        if src.len() < HEADER_LEN {
            return Err(TunnelError::protocol("short frame header"));
        }
        let stream_id = src.get_u32();
        let kind = FrameType::try_from(src.get_u8())?;
        let len = src.get_u32() as usize;
        if len > max_payload {
            return Err(TunnelError::protocol(format!(
                "frame payload {len} exceeds limit {max_payload}"
            )));
        }
        if len != src.len() {
            return Err(TunnelError::protocol(format!(
                "frame length {len} does not match record body {}",
                src.len()
            )));
        }

        let frame = Frame::new(stream_id, kind, src);
        frame.validate()?;
        Ok(frame)
    }

    fn validate(&self) -> Result<(), TunnelError> {
        match self.kind {
            FrameType::Ping | FrameType::Pong => {
                if self.stream_id != 0 || self.payload.len() != 8 {
                    return Err(TunnelError::protocol("malformed ping/pong frame"));
                }
            }
            FrameType::Padding => {}
            FrameType::WindowUpdate => {
                if self.stream_id == 0 || self.payload.len() != 8 {
                    return Err(TunnelError::protocol("malformed window update"));
                }
            }
            FrameType::Open | FrameType::Close | FrameType::Reset => {
                if self.stream_id == 0 || !self.payload.is_empty() {
                    return Err(TunnelError::protocol(format!(
                        "malformed {:?} frame",
                        self.kind
                    )));
                }
            }
            FrameType::Data => {
                if self.stream_id == 0 {
                    return Err(TunnelError::protocol("data frame on stream 0"));
                }
            }
        }
        Ok(())
    }
}
