//! Read-only snapshot of a session for the UI/CLI layer.

use serde::Serialize;

use crate::protocol::TransferId;

/// Connection lifecycle of a peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Connecting,
    Connected,
    Closed,
}

/// An offer waiting for the local user to accept or reject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequest {
    pub id: TransferId,
    pub file_name: String,
    pub file_size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub id: TransferId,
    pub file_name: String,
    /// Whole percent, 0..=100.
    pub progress: u8,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    /// Bytes per second.
    pub speed: f64,
    pub state: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedFile {
    pub id: TransferId,
    pub file_name: String,
    pub file_size: u64,
}

/// Everything the UI shows about one session. `revision` grows on every state change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub revision: u64,
    pub status: SessionStatus,
    pub local_name: String,
    pub peer_name: Option<String>,
    pub pending_requests: Vec<PendingRequest>,
    pub outgoing: Vec<TransferProgress>,
    pub incoming: Vec<TransferProgress>,
    pub completed: Vec<CompletedFile>,
}

/// `round(done / total * 100)`; an empty file counts as done.
pub fn progress_percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = (done as f64 / total as f64 * 100.0).round();
    pct.clamp(0.0, 100.0) as u8
}
