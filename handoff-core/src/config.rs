//! Session tuning knobs.

use std::time::Duration;

use crate::chunk::DEFAULT_CHUNK_SIZE;

/// Default cap on an offered file size (4 GiB). Larger offers are rejected automatically.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Default send-buffer high watermark. Chunk emission pauses above this.
pub const DEFAULT_SEND_BUFFER_HIGH_WATERMARK: usize = 1024 * 1024;

/// Default lifetime of an offer nobody answered.
pub const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(300);

/// How long a completed outgoing transfer stays visible before retirement.
pub const DEFAULT_COMPLETED_GRACE: Duration = Duration::from_secs(1);

/// Longest control message accepted from the peer.
pub const DEFAULT_MAX_CONTROL_MESSAGE_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Maximum payload bytes per chunk message.
    pub chunk_size: u64,
    /// Largest `fileSize` an incoming offer may carry.
    pub max_file_size: u64,
    /// Bytes the channel may hold unflushed before `pump` stops emitting chunks.
    pub send_buffer_high_watermark: usize,
    /// Expiry for unanswered offers and accepted-but-never-started transfers. `None` disables.
    pub pending_timeout: Option<Duration>,
    pub completed_grace: Duration,
    pub max_control_message_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            send_buffer_high_watermark: DEFAULT_SEND_BUFFER_HIGH_WATERMARK,
            pending_timeout: Some(DEFAULT_PENDING_TIMEOUT),
            completed_grace: DEFAULT_COMPLETED_GRACE,
            max_control_message_len: DEFAULT_MAX_CONTROL_MESSAGE_LEN,
        }
    }
}

impl Config {
    /// Chunk size actually used: zero falls back to the default.
    pub fn effective_chunk_size(&self) -> u64 {
        if self.chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            self.chunk_size
        }
    }
}
