//! Boundary to the visual-code encoder.
//!
//! Rendering images is outside this crate; the orchestrator only needs the
//! encoder to accept the packet string and to say when it does not fit in a
//! single frame, so the caller can switch to chunking.

use crate::error::EncodeError;
use crate::models::ProofPacket;
use serde::Serialize;

/// Encoder for one frame of a visual code.
pub trait PacketEncoder: Send + Sync {
    /// Largest payload in bytes that fits in a single frame.
    fn capacity(&self) -> usize;

    /// Encode `payload` into a single frame.
    fn encode(&self, payload: &str) -> Result<Vec<u8>, EncodeError>;
}

/// Frame encoder that carries the UTF-8 bytes of the payload unchanged.
#[derive(Debug, Clone)]
pub struct Utf8FrameEncoder {
    max_data_size: usize,
}

impl Utf8FrameEncoder {
    pub fn new(max_data_size: usize) -> Self {
        Self { max_data_size }
    }

    /// Inverse of [`PacketEncoder::encode`].
    pub fn decode(frame: &[u8]) -> Result<String, std::string::FromUtf8Error> {
        String::from_utf8(frame.to_vec())
    }
}

impl Default for Utf8FrameEncoder {
    fn default() -> Self {
        Self::new(2000)
    }
}

impl PacketEncoder for Utf8FrameEncoder {
    fn capacity(&self) -> usize {
        self.max_data_size
    }

    fn encode(&self, payload: &str) -> Result<Vec<u8>, EncodeError> {
        if payload.len() > self.max_data_size {
            return Err(EncodeError::CapacityExceeded {
                size: payload.len(),
                capacity: self.max_data_size,
            });
        }
        Ok(payload.as_bytes().to_vec())
    }
}

/// A packet as handed to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EncodedPacket {
    /// Compact JSON form of the packet.
    pub json: String,
    /// Single-frame encoding, or `None` when the packet needs chunking.
    #[serde(skip)]
    pub frame: Option<Vec<u8>>,
}

impl EncodedPacket {
    pub fn needs_chunking(&self) -> bool {
        self.frame.is_none()
    }
}

/// Serialize `packet` and try to fit it in one frame.
pub fn encode_packet(
    packet: &ProofPacket,
    encoder: &dyn PacketEncoder,
) -> Result<EncodedPacket, serde_json::Error> {
    let json = packet.to_json()?;
    let frame = match encoder.encode(&json) {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::debug!("Packet {} needs chunking: {}", packet.sequence_number, e);
            None
        }
    };
    Ok(EncodedPacket { json, frame })
}
