//! Outgoing transfer state machine: offer, wait for accept, stream chunks, complete.

use std::io::{ErrorKind, Read};
use std::time::Instant;

use tracing::{debug, trace};

use crate::chunk;
use crate::codec;
use crate::error::TransferError;
use crate::protocol::{ControlMessage, FileDescriptor, TransferId};

/// Byte source for an outgoing file. Read strictly front to back.
pub type FileSource = Box<dyn Read + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutgoingState {
    Offered,
    /// Peer accepted; metadata sent, no chunk emitted yet.
    Accepted,
    Sending,
    Completed,
    Rejected,
    Cancelled,
    Aborted,
}

impl OutgoingState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OutgoingState::Completed
                | OutgoingState::Rejected
                | OutgoingState::Cancelled
                | OutgoingState::Aborted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OutgoingState::Offered => "offered",
            OutgoingState::Accepted => "accepted",
            OutgoingState::Sending => "sending",
            OutgoingState::Completed => "completed",
            OutgoingState::Rejected => "rejected",
            OutgoingState::Cancelled => "cancelled",
            OutgoingState::Aborted => "aborted",
        }
    }
}

/// What the sender produced on one step.
#[derive(Debug)]
pub enum SenderStep {
    /// Encoded binary chunk message.
    Chunk(Vec<u8>),
    /// All bytes sent; the `file-complete` message to emit.
    Complete(ControlMessage),
}

/// One outgoing file. Owns its source; `bytes_sent` only grows, up to the descriptor size.
pub struct OutgoingTransfer {
    id: TransferId,
    descriptor: FileDescriptor,
    source: FileSource,
    chunk_size: u64,
    bytes_sent: u64,
    state: OutgoingState,
    offered_at: Instant,
    started_at: Option<Instant>,
    completed_at: Option<Instant>,
    speed: f64,
}

impl OutgoingTransfer {
    /// `chunk_size` must be non-zero.
    pub fn new(
        id: TransferId,
        descriptor: FileDescriptor,
        source: FileSource,
        chunk_size: u64,
        now: Instant,
    ) -> Self {
        Self {
            id,
            descriptor,
            source,
            chunk_size,
            bytes_sent: 0,
            state: OutgoingState::Offered,
            offered_at: now,
            started_at: None,
            completed_at: None,
            speed: 0.0,
        }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn descriptor(&self) -> &FileDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> OutgoingState {
        self.state
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Bytes per second since the first chunk.
    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn offered_at(&self) -> Instant {
        self.offered_at
    }

    pub fn completed_at(&self) -> Option<Instant> {
        self.completed_at
    }

    /// Accepted or mid-stream: `next_step` has something to produce.
    pub fn has_pending_output(&self) -> bool {
        matches!(self.state, OutgoingState::Accepted | OutgoingState::Sending)
    }

    pub fn offer_message(&self) -> ControlMessage {
        ControlMessage::FileOffer {
            id: self.id,
            file_name: self.descriptor.name.clone(),
            file_size: self.descriptor.size,
        }
    }

    /// Peer accepted. Returns the `file-metadata` message that must precede the first chunk.
    pub fn on_accept(&mut self) -> Result<ControlMessage, TransferError> {
        self.expect_state(OutgoingState::Offered)?;
        self.state = OutgoingState::Accepted;
        Ok(ControlMessage::FileMetadata {
            id: self.id,
            file_name: self.descriptor.name.clone(),
            file_size: self.descriptor.size,
        })
    }

    pub fn on_reject(&mut self) -> Result<(), TransferError> {
        self.expect_state(OutgoingState::Offered)?;
        self.state = OutgoingState::Rejected;
        Ok(())
    }

    /// Stop the transfer. Every non-terminal state is known to the peer (the offer went out first).
    pub fn cancel(&mut self) -> Result<(), TransferError> {
        if self.state.is_terminal() {
            return Err(self.invalid_state());
        }
        debug!(transfer_id = %self.id, sent = self.bytes_sent, "outgoing transfer cancelled");
        self.state = OutgoingState::Cancelled;
        Ok(())
    }

    /// Transport went away or the source failed.
    pub fn abort(&mut self) {
        if !self.state.is_terminal() {
            self.state = OutgoingState::Aborted;
        }
    }

    /// Produce the next chunk, or the completion message once every byte is out.
    /// Returns `None` when the transfer is not streaming.
    pub fn next_step(&mut self, now: Instant) -> Result<Option<SenderStep>, TransferError> {
        match self.state {
            OutgoingState::Accepted => {
                self.state = OutgoingState::Sending;
                self.started_at = Some(now);
            }
            OutgoingState::Sending => {}
            _ => return Ok(None),
        }

        let Some(next) = chunk::chunk_at(self.bytes_sent, self.descriptor.size, self.chunk_size)
        else {
            self.state = OutgoingState::Completed;
            self.completed_at = Some(now);
            return Ok(Some(SenderStep::Complete(ControlMessage::FileComplete {
                id: self.id,
            })));
        };

        let mut payload = vec![0u8; next.len() as usize];
        if let Err(e) = self.fill(&mut payload) {
            self.abort();
            return Err(e);
        }
        let frame = codec::encode_chunk(self.id, next.start, &payload);
        self.bytes_sent = next.end;
        if let Some(started) = self.started_at {
            let elapsed = now.saturating_duration_since(started).as_secs_f64();
            self.speed = if elapsed > 0.0 {
                self.bytes_sent as f64 / elapsed
            } else {
                0.0
            };
        }
        trace!(transfer_id = %self.id, offset = next.start, len = payload.len(), "chunk");
        Ok(Some(SenderStep::Chunk(frame)))
    }

    fn fill(&mut self, buf: &mut [u8]) -> Result<(), TransferError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.source.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(TransferError::SourceRead(format!(
                        "source ended after {} of {} bytes",
                        self.bytes_sent + filled as u64,
                        self.descriptor.size
                    )))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(TransferError::SourceRead(e.to_string())),
            }
        }
        Ok(())
    }

    fn expect_state(&self, expected: OutgoingState) -> Result<(), TransferError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(self.invalid_state())
        }
    }

    fn invalid_state(&self) -> TransferError {
        TransferError::InvalidState {
            id: self.id,
            state: self.state.as_str(),
        }
    }
}
