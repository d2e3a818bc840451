//! Framing: 1 byte protocol version + bincode frame, one frame per radio packet.

use bincode::Options;

use crate::protocol::{Frame, Message, Payload, PROTOCOL_VERSION};
use crate::registry::{PayloadRegistry, RegistryError};

const VERSION_SIZE: usize = 1;
/// Largest packet the radio carries (ESP-NOW payload limit).
pub const MAX_FRAME_LEN: usize = 250;

fn codec() -> impl Options {
    // varint integers, trailing bytes rejected
    bincode::DefaultOptions::new().with_limit((MAX_FRAME_LEN - VERSION_SIZE) as u64)
}

/// Encode a frame into one radio packet.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, EncodeError> {
    let len = codec()
        .serialized_size(frame)
        .map_err(|_| EncodeError::TooLarge)? as usize;
    let mut out = Vec::with_capacity(VERSION_SIZE + len);
    out.push(PROTOCOL_VERSION);
    codec()
        .serialize_into(&mut out, frame)
        .map_err(EncodeError::Encode)?;
    Ok(out)
}

/// Error encoding a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame larger than {MAX_FRAME_LEN} bytes")]
    TooLarge,
}

/// Decode one radio packet. Application payloads must be of a kind known to `registry`.
/// Never panics on arbitrary input.
pub fn decode_frame(bytes: &[u8], registry: &PayloadRegistry) -> Result<Frame, DecodeError> {
    let (&version, body) = bytes.split_first().ok_or(DecodeError::Empty)?;
    if version != PROTOCOL_VERSION {
        return Err(DecodeError::Version(version));
    }
    if bytes.len() > MAX_FRAME_LEN {
        return Err(DecodeError::TooLarge(bytes.len()));
    }
    let frame: Frame = codec().deserialize(body).map_err(DecodeError::Decode)?;
    if let Message::Application {
        payload: Payload::App(app),
        ..
    } = &frame.message
    {
        registry.check(app)?;
    }
    Ok(frame)
}

/// Error decoding a packet (empty, foreign version, too large, bincode failure, unknown payload).
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("empty packet")]
    Empty,
    #[error("unsupported protocol version {0}")]
    Version(u8),
    #[error("packet of {0} bytes exceeds frame limit")]
    TooLarge(usize),
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
    #[error(transparent)]
    Payload(#[from] RegistryError),
}
