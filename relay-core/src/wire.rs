//! Supervisor framing: length-prefix (4 bytes LE) + bincode payload.

use crate::protocol::SupervisorMessage;

pub const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Encode a message into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame(msg: &SupervisorMessage) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(msg).map_err(FrameEncodeError::Encode)?;
    let len = payload.len() as u32;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Why a message could not be framed.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the message and the
/// number of bytes consumed; `NeedMore` means the caller should read more.
pub fn decode_frame(bytes: &[u8]) -> Result<(SupervisorMessage, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let msg = bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len])
        .map_err(FrameDecodeError::Decode)?;
    Ok((msg, LEN_SIZE + len))
}

/// Why the front of a buffer is not (yet) a whole frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}
