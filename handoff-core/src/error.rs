//! Transfer-level error taxonomy.

use crate::protocol::TransferId;

/// Errors surfaced by local operations and carried by failure events.
/// None of these tear down a session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("not connected to a peer")]
    NotConnected,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("transfer {0} already exists")]
    DuplicateTransfer(TransferId),
    #[error("unknown transfer {0}")]
    UnknownTransfer(TransferId),
    #[error("file size {size} exceeds maximum {max}")]
    SizeExceeded { size: u64, max: u64 },
    #[error("transfer truncated: received {received} of {expected} bytes")]
    TruncatedTransfer { received: u64, expected: u64 },
    #[error("transport closed")]
    TransportClosed,
    #[error("transfer {id} is {state}")]
    InvalidState { id: TransferId, state: &'static str },
    #[error("transfer cancelled")]
    Cancelled,
    #[error("transfer timed out")]
    TimedOut,
    #[error("reading file source failed: {0}")]
    SourceRead(String),
}

impl TransferError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        TransferError::Protocol(msg.into())
    }
}
