//! Channel payload codec: JSON control messages on the text side, id-prefixed chunks on the binary side.
//!
//! Chunk layout: 16-byte transfer id, 8-byte big-endian offset, then payload bytes.
//! The header lets the receiver demultiplex interleaved transfers exactly.

use crate::protocol::{ControlMessage, TransferId};

/// Bytes of header in front of every chunk payload.
pub const CHUNK_HEADER_LEN: usize = 16 + 8;

/// Longest file name accepted in an offer or metadata message.
pub const MAX_FILE_NAME_LEN: usize = 1024;

/// Longest display name accepted in a peer-identity message.
pub const MAX_DISPLAY_NAME_LEN: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("control message of {len} bytes exceeds limit {max}")]
    TooLarge { len: usize, max: usize },
    #[error("malformed control message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid control message: {0}")]
    Invalid(&'static str),
    #[error("chunk of {0} bytes is shorter than its header")]
    ShortChunk(usize),
}

/// Serialize a control message for the text side of the channel.
pub fn encode_control(msg: &ControlMessage) -> Result<String, CodecError> {
    Ok(serde_json::to_string(msg)?)
}

/// Parse a control message received from the peer. The peer is untrusted: length,
/// shape and field contents are all checked; unknown `type` tags are errors.
pub fn decode_control(text: &str, max_len: usize) -> Result<ControlMessage, CodecError> {
    if text.len() > max_len {
        return Err(CodecError::TooLarge {
            len: text.len(),
            max: max_len,
        });
    }
    let msg: ControlMessage = serde_json::from_str(text)?;
    validate(&msg)?;
    Ok(msg)
}

fn validate(msg: &ControlMessage) -> Result<(), CodecError> {
    match msg {
        ControlMessage::PeerIdentity { name } => {
            if name.len() > MAX_DISPLAY_NAME_LEN {
                return Err(CodecError::Invalid("display name too long"));
            }
        }
        ControlMessage::FileOffer { file_name, .. }
        | ControlMessage::FileMetadata { file_name, .. } => {
            if file_name.is_empty() {
                return Err(CodecError::Invalid("empty file name"));
            }
            if file_name.len() > MAX_FILE_NAME_LEN {
                return Err(CodecError::Invalid("file name too long"));
            }
        }
        _ => {}
    }
    Ok(())
}

/// A decoded chunk message borrowing its payload from the received buffer.
#[derive(Debug, PartialEq, Eq)]
pub struct ChunkFrame<'a> {
    pub transfer_id: TransferId,
    pub offset: u64,
    pub payload: &'a [u8],
}

/// Build one binary chunk message.
pub fn encode_chunk(transfer_id: TransferId, offset: u64, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(CHUNK_HEADER_LEN + payload.len());
    out.extend_from_slice(transfer_id.as_bytes());
    out.extend_from_slice(&offset.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Split a binary message into header fields and payload.
pub fn decode_chunk(bytes: &[u8]) -> Result<ChunkFrame<'_>, CodecError> {
    if bytes.len() < CHUNK_HEADER_LEN {
        return Err(CodecError::ShortChunk(bytes.len()));
    }
    let mut id = [0u8; 16];
    id.copy_from_slice(&bytes[..16]);
    let mut offset = [0u8; 8];
    offset.copy_from_slice(&bytes[16..CHUNK_HEADER_LEN]);
    Ok(ChunkFrame {
        transfer_id: TransferId::from_bytes(id),
        offset: u64::from_be_bytes(offset),
        payload: &bytes[CHUNK_HEADER_LEN..],
    })
}
