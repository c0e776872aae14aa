//! Wire frame format: `[type:u8][length:u32 big-endian][payload:length bytes]`

use crate::error::{GatewayError, Result};

/// Frame types for the framed link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// One JSON-encoded envelope
    Data = 0x01,
    Heartbeat = 0x03,
    /// Peer-reported failure, UTF-8 message payload
    Error = 0x04,
    /// Orderly end of the link
    Close = 0x05,
}

impl TryFrom<u8> for FrameType {
    type Error = GatewayError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Data),
            0x03 => Ok(Self::Heartbeat),
            0x04 => Ok(Self::Error),
            0x05 => Ok(Self::Close),
            _ => Err(GatewayError::Transport(format!(
                "Unknown frame type: 0x{:02x}",
                value
            ))),
        }
    }
}

/// Default payload cap: 16 MiB
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;
pub(crate) const HEADER_SIZE: usize = 5;

/// A framed message on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn data(payload: Vec<u8>) -> Self {
        Self {
            frame_type: FrameType::Data,
            payload,
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            frame_type: FrameType::Heartbeat,
            payload: Vec::new(),
        }
    }

    pub fn error(message: &str) -> Self {
        Self {
            frame_type: FrameType::Error,
            payload: message.as_bytes().to_vec(),
        }
    }

    pub fn close() -> Self {
        Self {
            frame_type: FrameType::Close,
            payload: Vec::new(),
        }
    }

    /// Encode for the wire, refusing payloads over `max_payload`
    pub fn encode(&self, max_payload: u32) -> Result<Vec<u8>> {
        let len = u32::try_from(self.payload.len())
            .ok()
            .filter(|len| *len <= max_payload)
            .ok_or_else(|| too_large(self.payload.len() as u64, max_payload))?;

        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.push(self.frame_type as u8);
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Decode one frame from the front of `buf`
    ///
    /// Returns the frame and the bytes consumed, or `None` if incomplete.
    pub fn decode(buf: &[u8], max_payload: u32) -> Result<Option<(Self, usize)>> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let frame_type = FrameType::try_from(buf[0])?;
        let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        if len > max_payload {
            return Err(too_large(len as u64, max_payload));
        }
        let total = HEADER_SIZE + len as usize;
        if buf.len() < total {
            return Ok(None);
        }
        Ok(Some((
            Self {
                frame_type,
                payload: buf[HEADER_SIZE..total].to_vec(),
            },
            total,
        )))
    }
}

fn too_large(len: u64, max: u32) -> GatewayError {
    GatewayError::Transport(format!("Payload too large: {} bytes (max {})", len, max))
}
