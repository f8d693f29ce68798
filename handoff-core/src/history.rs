//! Transfer history: an append-only log the session writes finished transfers to.
//! Storage is the host's business; the core only appends.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::protocol::Direction;

/// Entries kept by `MemoryHistory`.
pub const MAX_HISTORY_ITEMS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    pub file_name: String,
    pub file_size: u64,
    #[serde(rename = "type")]
    pub direction: Direction,
    pub peer_name: String,
    pub status: RecordStatus,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl TransferRecord {
    pub fn now(
        file_name: impl Into<String>,
        file_size: u64,
        direction: Direction,
        peer_name: impl Into<String>,
        status: RecordStatus,
    ) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            file_name: file_name.into(),
            file_size,
            direction,
            peer_name: peer_name.into(),
            status,
            timestamp,
        }
    }
}

/// Sink for finished transfers.
pub trait HistoryLog: Send {
    fn append(&mut self, record: TransferRecord);

    /// Newest first.
    fn records(&self) -> Vec<TransferRecord>;
}

/// Bounded in-memory history, newest first.
#[derive(Debug)]
pub struct MemoryHistory {
    records: VecDeque<TransferRecord>,
    capacity: usize,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::with_capacity(MAX_HISTORY_ITEMS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for MemoryHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryLog for MemoryHistory {
    fn append(&mut self, record: TransferRecord) {
        if self.capacity == 0 {
            return;
        }
        self.records.push_front(record);
        self.records.truncate(self.capacity);
    }

    fn records(&self) -> Vec<TransferRecord> {
        self.records.iter().cloned().collect()
    }
}
