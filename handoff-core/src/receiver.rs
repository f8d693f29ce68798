//! Incoming transfer state machine: offer awaiting a local decision, buffering, reassembly.

use std::time::Instant;

use tracing::{debug, trace};

use crate::chunk::ReceiveBuffer;
use crate::error::TransferError;
use crate::protocol::{ControlMessage, FileDescriptor, TransferId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingState {
    /// Offer received; waiting for the local user.
    Requested,
    Accepted,
    Receiving,
    Completed,
    Rejected,
    Aborted,
}

impl IncomingState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            IncomingState::Completed | IncomingState::Rejected | IncomingState::Aborted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IncomingState::Requested => "requested",
            IncomingState::Accepted => "accepted",
            IncomingState::Receiving => "receiving",
            IncomingState::Completed => "completed",
            IncomingState::Rejected => "rejected",
            IncomingState::Aborted => "aborted",
        }
    }
}

/// One incoming file. The buffer exists only while `Receiving` and is consumed on completion.
#[derive(Debug)]
pub struct IncomingTransfer {
    id: TransferId,
    descriptor: FileDescriptor,
    buffer: Option<ReceiveBuffer>,
    state: IncomingState,
    requested_at: Instant,
    accepted_at: Option<Instant>,
    started_at: Option<Instant>,
    speed: f64,
}

impl IncomingTransfer {
    pub fn new(id: TransferId, descriptor: FileDescriptor, now: Instant) -> Self {
        Self {
            id,
            descriptor,
            buffer: None,
            state: IncomingState::Requested,
            requested_at: now,
            accepted_at: None,
            started_at: None,
            speed: 0.0,
        }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn descriptor(&self) -> &FileDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> IncomingState {
        self.state
    }

    pub fn bytes_received(&self) -> u64 {
        self.buffer.as_ref().map_or(0, ReceiveBuffer::received)
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn requested_at(&self) -> Instant {
        self.requested_at
    }

    pub fn accepted_at(&self) -> Option<Instant> {
        self.accepted_at
    }

    /// Local user accepted. Returns the `file-accept` to send.
    pub fn accept(&mut self, now: Instant) -> Result<ControlMessage, TransferError> {
        self.expect_state(IncomingState::Requested)?;
        self.state = IncomingState::Accepted;
        self.accepted_at = Some(now);
        Ok(ControlMessage::FileAccept { id: self.id })
    }

    /// Local user declined. Returns the `file-reject` to send.
    pub fn reject(&mut self) -> Result<ControlMessage, TransferError> {
        self.expect_state(IncomingState::Requested)?;
        self.state = IncomingState::Rejected;
        Ok(ControlMessage::FileReject { id: self.id })
    }

    /// Sender is about to stream: allocate the buffer.
    pub fn on_metadata(
        &mut self,
        descriptor: &FileDescriptor,
        now: Instant,
    ) -> Result<(), TransferError> {
        self.expect_state(IncomingState::Accepted)?;
        if descriptor.size != self.descriptor.size {
            return Err(TransferError::protocol(format!(
                "metadata size {} differs from offered size {}",
                descriptor.size, self.descriptor.size
            )));
        }
        if descriptor.name != self.descriptor.name {
            debug!(transfer_id = %self.id, name = %descriptor.name, "metadata renamed file");
            self.descriptor.name = descriptor.name.clone();
        }
        self.buffer = Some(ReceiveBuffer::new(self.descriptor.size));
        self.state = IncomingState::Receiving;
        self.started_at = Some(now);
        Ok(())
    }

    /// Append a chunk. Returns total bytes received.
    pub fn on_chunk(
        &mut self,
        offset: u64,
        payload: &[u8],
        now: Instant,
    ) -> Result<u64, TransferError> {
        let state = self.state;
        let buffer = match (&mut self.buffer, state) {
            (Some(buffer), IncomingState::Receiving) => buffer,
            _ => {
                return Err(TransferError::protocol(format!(
                    "chunk for transfer in state {}",
                    state.as_str()
                )))
            }
        };
        let received = buffer
            .append(offset, payload)
            .map_err(|e| TransferError::protocol(e.to_string()))?;
        if let Some(started) = self.started_at {
            let elapsed = now.saturating_duration_since(started).as_secs_f64();
            if elapsed > 0.0 {
                self.speed = received as f64 / elapsed;
            }
        }
        trace!(transfer_id = %self.id, offset, received, "chunk buffered");
        Ok(received)
    }

    /// Sender finished. Returns the reassembled file, exactly once; a short buffer is a truncation.
    pub fn on_complete(&mut self) -> Result<Vec<u8>, TransferError> {
        self.expect_state(IncomingState::Receiving)?;
        let Some(buffer) = self.buffer.take() else {
            self.state = IncomingState::Aborted;
            return Err(TransferError::protocol("receive buffer missing"));
        };
        if !buffer.is_complete() {
            self.state = IncomingState::Aborted;
            return Err(TransferError::TruncatedTransfer {
                received: buffer.received(),
                expected: buffer.expected_len(),
            });
        }
        self.state = IncomingState::Completed;
        Ok(buffer.reassemble())
    }

    /// Drop buffered bytes and stop accepting chunks.
    pub fn abort(&mut self) {
        self.buffer = None;
        if !self.state.is_terminal() {
            self.state = IncomingState::Aborted;
        }
    }

    fn expect_state(&self, expected: IncomingState) -> Result<(), TransferError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(TransferError::InvalidState {
                id: self.id,
                state: self.state.as_str(),
            })
        }
    }
}
