//! Chunk manager: split a file into fixed-size chunks, buffer received chunks, reassemble.

/// Default chunk size in bytes. Fits comfortably under data-channel message limits.
pub const DEFAULT_CHUNK_SIZE: u64 = 16 * 1024; // 16 KiB

/// Byte range [start, end) of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkId {
    pub start: u64,
    pub end: u64,
}

impl ChunkId {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }
}

/// Chunk starting at `offset`, or `None` once `offset` reaches `total_len`.
/// `chunk_size` must be non-zero; callers take it from `Config::effective_chunk_size`.
pub fn chunk_at(offset: u64, total_len: u64, chunk_size: u64) -> Option<ChunkId> {
    debug_assert!(chunk_size > 0, "chunk size must be non-zero");
    if offset >= total_len {
        return None;
    }
    Some(ChunkId {
        start: offset,
        end: offset.saturating_add(chunk_size).min(total_len),
    })
}

/// Why a received chunk was refused by the buffer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkRejection {
    #[error("chunk at offset {got} but {expected} bytes received so far")]
    OutOfOrder { expected: u64, got: u64 },
    #[error("chunk of {len} bytes would overflow {expected} (have {received})")]
    Overflow { received: u64, len: u64, expected: u64 },
}

/// Receive buffer for one transfer. Chunks are appended in arrival order into one growing
/// buffer whose length never exceeds the expected length.
#[derive(Debug)]
pub struct ReceiveBuffer {
    expected_len: u64,
    data: Vec<u8>,
}

impl ReceiveBuffer {
    pub fn new(expected_len: u64) -> Self {
        Self {
            expected_len,
            data: Vec::new(),
        }
    }

    /// Append the chunk that starts at `offset`. Returns total bytes received.
    pub fn append(&mut self, offset: u64, payload: &[u8]) -> Result<u64, ChunkRejection> {
        let received = self.received();
        if offset != received {
            return Err(ChunkRejection::OutOfOrder {
                expected: received,
                got: offset,
            });
        }
        let len = payload.len() as u64;
        if received.saturating_add(len) > self.expected_len {
            return Err(ChunkRejection::Overflow {
                received,
                len,
                expected: self.expected_len,
            });
        }
        self.data.extend_from_slice(payload);
        Ok(self.received())
    }

    pub fn received(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn expected_len(&self) -> u64 {
        self.expected_len
    }

    pub fn is_complete(&self) -> bool {
        self.received() == self.expected_len
    }

    /// The received bytes in arrival order. Consumes the buffer without copying.
    pub fn reassemble(self) -> Vec<u8> {
        self.data
    }
}
