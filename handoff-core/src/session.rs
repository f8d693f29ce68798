//! Host-driven peer session: one per established channel.
//!
//! The host passes channel events, user commands and clock ticks in; the session
//! returns `Action`s for the host to perform. All state mutation happens through
//! `&mut self`, so a host that drives the session from one task (or behind one
//! mutex) gets single-writer discipline for free.
//!
//! The channel MUST deliver messages in the order they were sent and without loss
//! while it is open. Chunks carry their transfer id and offset, so an adapter that
//! breaks this is detected (the affected transfer aborts) but not repaired.

use std::time::Instant;

use tracing::{debug, info, warn};

use crate::codec;
use crate::config::Config;
use crate::error::TransferError;
use crate::history::{HistoryLog, MemoryHistory, RecordStatus, TransferRecord};
use crate::protocol::{ControlMessage, Direction, FileDescriptor, TransferId};
use crate::receiver::{IncomingState, IncomingTransfer};
use crate::registry::{TransferEntry, TransferRegistry};
use crate::scheduler::SendScheduler;
use crate::sender::{FileSource, OutgoingState, OutgoingTransfer, SenderStep};
use crate::view::{
    progress_percent, CompletedFile, PendingRequest, SessionSnapshot, SessionStatus,
    TransferProgress,
};

/// Remote peer as announced by its first `peer-identity` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub display_name: String,
}

/// Something the host must do on the session's behalf.
#[derive(Debug)]
pub enum Action {
    /// Send on the text side of the channel.
    SendText(String),
    /// Send on the binary side of the channel.
    SendBinary(Vec<u8>),
    /// A transfer finished; hand the bytes to the output sink. Emitted once per transfer.
    DeliverFile {
        id: TransferId,
        descriptor: FileDescriptor,
        bytes: Vec<u8>,
    },
    Event(TransferEvent),
}

/// User-visible notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    PeerIdentified {
        name: String,
    },
    /// Remote offered a file; it is now a pending request.
    OfferReceived {
        id: TransferId,
        descriptor: FileDescriptor,
    },
    /// Remote accepted our offer; chunks flow on the next `pump`.
    OfferAccepted {
        id: TransferId,
        descriptor: FileDescriptor,
    },
    OfferRejected {
        id: TransferId,
        descriptor: FileDescriptor,
    },
    Completed {
        id: TransferId,
        descriptor: FileDescriptor,
        direction: Direction,
    },
    Failed {
        id: TransferId,
        descriptor: FileDescriptor,
        direction: Direction,
        error: TransferError,
    },
    Disconnected,
}

/// Orchestrates transfers over one channel. Owns the registry; tears everything down on close.
pub struct PeerSession {
    config: Config,
    local_name: String,
    status: SessionStatus,
    peer: Option<PeerIdentity>,
    registry: TransferRegistry,
    scheduler: SendScheduler,
    completed: Vec<CompletedFile>,
    history: Box<dyn HistoryLog>,
    revision: u64,
}

impl PeerSession {
    pub fn new(local_name: impl Into<String>, config: Config) -> Self {
        Self::with_history(local_name, config, Box::new(MemoryHistory::new()))
    }

    pub fn with_history(
        local_name: impl Into<String>,
        config: Config,
        history: Box<dyn HistoryLog>,
    ) -> Self {
        Self {
            config,
            local_name: local_name.into(),
            status: SessionStatus::Idle,
            peer: None,
            registry: TransferRegistry::new(),
            scheduler: SendScheduler::new(),
            completed: Vec::new(),
            history,
            revision: 0,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    pub fn peer(&self) -> Option<&PeerIdentity> {
        self.peer.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &TransferRegistry {
        &self.registry
    }

    pub fn history(&self) -> &dyn HistoryLog {
        self.history.as_ref()
    }

    /// Bumped on every state change; hosts push a new snapshot when it moves.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Host started establishing the channel.
    pub fn connect(&mut self) -> Result<(), TransferError> {
        match self.status {
            SessionStatus::Idle => {
                self.status = SessionStatus::Connecting;
                self.touch();
                Ok(())
            }
            SessionStatus::Connecting | SessionStatus::Connected => Ok(()),
            SessionStatus::Closed => Err(TransferError::TransportClosed),
        }
    }

    /// Channel is open: announce ourselves.
    pub fn on_channel_open(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        match self.status {
            SessionStatus::Idle | SessionStatus::Connecting => {}
            SessionStatus::Connected => return actions,
            SessionStatus::Closed => {
                debug!("open event on closed session ignored");
                return actions;
            }
        }
        self.status = SessionStatus::Connected;
        info!(local_name = %self.local_name, "channel open");
        self.push_control(
            &mut actions,
            &ControlMessage::PeerIdentity {
                name: self.local_name.clone(),
            },
        );
        self.touch();
        actions
    }

    /// Channel closed or errored. Safe to call repeatedly.
    pub fn on_channel_closed(&mut self) -> Vec<Action> {
        self.teardown("channel closed")
    }

    /// Local disconnect. The host closes the channel itself. Safe to call repeatedly.
    pub fn disconnect(&mut self) -> Vec<Action> {
        self.teardown("local disconnect")
    }

    /// Offer a file to the peer. Returns immediately; chunks flow after the peer accepts.
    pub fn offer(
        &mut self,
        descriptor: FileDescriptor,
        source: FileSource,
    ) -> Result<(TransferId, Vec<Action>), TransferError> {
        self.ensure_connected()?;
        let id = TransferId::new();
        let transfer = OutgoingTransfer::new(
            id,
            descriptor,
            source,
            self.config.effective_chunk_size(),
            Instant::now(),
        );
        let msg = transfer.offer_message();
        info!(
            transfer_id = %id,
            file_name = %transfer.descriptor().name,
            size = transfer.descriptor().size,
            "offering file"
        );
        self.registry.insert_outgoing(transfer)?;
        let mut actions = Vec::new();
        self.push_control(&mut actions, &msg);
        self.touch();
        Ok((id, actions))
    }

    /// Accept a pending incoming offer.
    pub fn accept(&mut self, id: TransferId) -> Result<Vec<Action>, TransferError> {
        self.ensure_connected()?;
        let t = self
            .registry
            .incoming_mut(&id)
            .ok_or(TransferError::UnknownTransfer(id))?;
        let msg = t.accept(Instant::now())?;
        info!(transfer_id = %id, file_name = %t.descriptor().name, "accepted incoming file");
        let mut actions = Vec::new();
        self.push_control(&mut actions, &msg);
        self.touch();
        Ok(actions)
    }

    /// Reject a pending incoming offer.
    pub fn reject(&mut self, id: TransferId) -> Result<Vec<Action>, TransferError> {
        self.ensure_connected()?;
        let t = self
            .registry
            .incoming_mut(&id)
            .ok_or(TransferError::UnknownTransfer(id))?;
        let msg = t.reject()?;
        info!(transfer_id = %id, file_name = %t.descriptor().name, "rejected incoming file");
        self.registry.retire(&id);
        let mut actions = Vec::new();
        self.push_control(&mut actions, &msg);
        self.touch();
        Ok(actions)
    }

    /// Cancel any live transfer. The peer is told with `file-cancel`
    /// (or `file-reject` for an offer still awaiting our decision).
    pub fn cancel(&mut self, id: TransferId) -> Result<Vec<Action>, TransferError> {
        self.ensure_connected()?;
        let mut actions = Vec::new();
        match self.registry.get(&id).map(TransferEntry::direction) {
            None => return Err(TransferError::UnknownTransfer(id)),
            Some(Direction::Sent) => {
                let t = self
                    .registry
                    .outgoing_mut(&id)
                    .ok_or(TransferError::UnknownTransfer(id))?;
                t.cancel()?;
                let descriptor = t.descriptor().clone();
                self.registry.retire(&id);
                self.push_control(&mut actions, &ControlMessage::FileCancel { id });
                self.record_failure(
                    &mut actions,
                    id,
                    descriptor,
                    Direction::Sent,
                    TransferError::Cancelled,
                );
            }
            Some(Direction::Received) => {
                let t = self
                    .registry
                    .incoming_mut(&id)
                    .ok_or(TransferError::UnknownTransfer(id))?;
                match t.state() {
                    IncomingState::Requested => return self.reject(id),
                    IncomingState::Accepted | IncomingState::Receiving => {}
                    state => {
                        return Err(TransferError::InvalidState {
                            id,
                            state: state.as_str(),
                        })
                    }
                }
                self.abort_incoming(&mut actions, id, TransferError::Cancelled, true);
            }
        }
        self.touch();
        Ok(actions)
    }

    /// Emit chunks while the channel's unflushed bytes stay under the high watermark.
    /// `buffered_amount` is what the adapter currently holds. Call after every event
    /// and whenever the adapter signals its buffer drained; stops (without error)
    /// when the budget is spent, and an empty buffer always takes at least one chunk.
    pub fn pump(&mut self, buffered_amount: usize) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.status != SessionStatus::Connected {
            return actions;
        }
        let high = self.config.send_buffer_high_watermark;
        let mut queued = buffered_amount;
        let now = Instant::now();
        loop {
            if queued > 0 && queued >= high {
                debug!(queued, high, "send buffer full; pausing");
                break;
            }
            let ready = self.registry.ready_to_send();
            let Some(id) = self.scheduler.next(&ready) else {
                break;
            };
            let Some(t) = self.registry.outgoing_mut(&id) else {
                break;
            };
            match t.next_step(now) {
                Ok(Some(SenderStep::Chunk(frame))) => {
                    queued = queued.saturating_add(frame.len());
                    actions.push(Action::SendBinary(frame));
                }
                Ok(Some(SenderStep::Complete(msg))) => {
                    let descriptor = t.descriptor().clone();
                    info!(transfer_id = %id, size = descriptor.size, "file sent");
                    self.push_control(&mut actions, &msg);
                    self.record_completion(&mut actions, id, descriptor, Direction::Sent);
                }
                Ok(None) => break,
                Err(e) => {
                    let descriptor = t.descriptor().clone();
                    self.registry.retire(&id);
                    self.push_control(&mut actions, &ControlMessage::FileCancel { id });
                    self.record_failure(&mut actions, id, descriptor, Direction::Sent, e);
                }
            }
        }
        if !actions.is_empty() {
            self.touch();
        }
        actions
    }

    /// Control message from the peer. Malformed input is logged and dropped.
    pub fn on_text_message(&mut self, text: &str) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.status != SessionStatus::Connected {
            debug!("control message on inactive session dropped");
            return actions;
        }
        let msg = match codec::decode_control(text, self.config.max_control_message_len) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "discarding control message");
                return actions;
            }
        };
        debug!(kind = msg.kind(), transfer_id = ?msg.transfer_id(), "control message");
        let now = Instant::now();
        match msg {
            ControlMessage::PeerIdentity { name } => self.on_peer_identity(&mut actions, name),
            ControlMessage::FileOffer {
                id,
                file_name,
                file_size,
            } => self.on_offer(
                &mut actions,
                id,
                FileDescriptor::new(file_name, file_size),
                now,
            ),
            ControlMessage::FileAccept { id } => self.on_accept(&mut actions, id),
            ControlMessage::FileReject { id } => self.on_reject(&mut actions, id),
            ControlMessage::FileMetadata {
                id,
                file_name,
                file_size,
            } => self.on_metadata(
                &mut actions,
                id,
                FileDescriptor::new(file_name, file_size),
                now,
            ),
            ControlMessage::FileComplete { id } => self.on_complete(&mut actions, id),
            ControlMessage::FileCancel { id } => self.on_remote_cancel(&mut actions, id),
        }
        self.touch();
        actions
    }

    /// Chunk from the peer, demultiplexed by the id in its header.
    pub fn on_binary_message(&mut self, bytes: &[u8]) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.status != SessionStatus::Connected {
            debug!("chunk on inactive session dropped");
            return actions;
        }
        let frame = match codec::decode_chunk(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "discarding binary message");
                return actions;
            }
        };
        let id = frame.transfer_id;
        let Some(t) = self.registry.incoming_mut(&id) else {
            debug!(transfer_id = %id, "chunk for unknown or retired transfer dropped");
            return actions;
        };
        match t.on_chunk(frame.offset, frame.payload, Instant::now()) {
            Ok(_) => {}
            Err(e) => self.abort_incoming(&mut actions, id, e, true),
        }
        self.touch();
        actions
    }

    /// Periodic housekeeping: retire completed sends after the grace period, expire stale offers.
    pub fn tick(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.status != SessionStatus::Connected {
            return actions;
        }
        let grace = self.config.completed_grace;
        let timeout = self.config.pending_timeout;
        let expired = |since: Instant| {
            timeout.is_some_and(|limit| now.saturating_duration_since(since) >= limit)
        };

        let mut finished = Vec::new();
        let mut stale_outgoing = Vec::new();
        let mut stale_incoming = Vec::new();
        for entry in self.registry.iter() {
            match entry {
                TransferEntry::Outgoing(t) => {
                    if let Some(done) = t.completed_at() {
                        if now.saturating_duration_since(done) >= grace {
                            finished.push(t.id());
                        }
                    } else if t.state() == OutgoingState::Offered && expired(t.offered_at()) {
                        stale_outgoing.push(t.id());
                    }
                }
                TransferEntry::Incoming(t) => {
                    let since = match t.state() {
                        IncomingState::Requested => Some(t.requested_at()),
                        IncomingState::Accepted => t.accepted_at(),
                        _ => None,
                    };
                    if since.is_some_and(expired) {
                        stale_incoming.push((t.id(), t.state()));
                    }
                }
            }
        }

        for id in finished {
            debug!(transfer_id = %id, "retiring completed transfer");
            self.registry.retire(&id);
            self.touch();
        }
        for id in stale_outgoing {
            let Some(t) = self.registry.outgoing_mut(&id) else {
                continue;
            };
            if t.cancel().is_err() {
                continue;
            }
            let descriptor = t.descriptor().clone();
            info!(transfer_id = %id, "offer expired unanswered");
            self.registry.retire(&id);
            self.push_control(&mut actions, &ControlMessage::FileCancel { id });
            self.record_failure(
                &mut actions,
                id,
                descriptor,
                Direction::Sent,
                TransferError::TimedOut,
            );
        }
        for (id, state) in stale_incoming {
            info!(transfer_id = %id, state = state.as_str(), "incoming transfer expired");
            if state == IncomingState::Requested {
                let Some(t) = self.registry.incoming_mut(&id) else {
                    continue;
                };
                let Ok(msg) = t.reject() else {
                    continue;
                };
                let descriptor = t.descriptor().clone();
                self.registry.retire(&id);
                self.push_control(&mut actions, &msg);
                self.record_failure(
                    &mut actions,
                    id,
                    descriptor,
                    Direction::Received,
                    TransferError::TimedOut,
                );
            } else {
                self.abort_incoming(&mut actions, id, TransferError::TimedOut, true);
            }
        }
        actions
    }

    /// Read-only view for the UI layer.
    pub fn snapshot(&self) -> SessionSnapshot {
        let mut pending_requests = Vec::new();
        let mut outgoing = Vec::new();
        let mut incoming = Vec::new();
        for entry in self.registry.iter() {
            match entry {
                TransferEntry::Outgoing(t) => {
                    let d = t.descriptor();
                    outgoing.push(TransferProgress {
                        id: t.id(),
                        file_name: d.name.clone(),
                        progress: progress_percent(t.bytes_sent(), d.size),
                        bytes_transferred: t.bytes_sent(),
                        total_bytes: d.size,
                        speed: t.speed(),
                        state: t.state().as_str(),
                    });
                }
                TransferEntry::Incoming(t) => {
                    let d = t.descriptor();
                    match t.state() {
                        IncomingState::Requested => pending_requests.push(PendingRequest {
                            id: t.id(),
                            file_name: d.name.clone(),
                            file_size: d.size,
                        }),
                        IncomingState::Accepted | IncomingState::Receiving => {
                            incoming.push(TransferProgress {
                                id: t.id(),
                                file_name: d.name.clone(),
                                progress: progress_percent(t.bytes_received(), d.size),
                                bytes_transferred: t.bytes_received(),
                                total_bytes: d.size,
                                speed: t.speed(),
                                state: t.state().as_str(),
                            })
                        }
                        _ => {}
                    }
                }
            }
        }
        SessionSnapshot {
            revision: self.revision,
            status: self.status,
            local_name: self.local_name.clone(),
            peer_name: self.peer.as_ref().map(|p| p.display_name.clone()),
            pending_requests,
            outgoing,
            incoming,
            completed: self.completed.clone(),
        }
    }

    fn on_peer_identity(&mut self, actions: &mut Vec<Action>, name: String) {
        if let Some(peer) = &self.peer {
            debug!(current = %peer.display_name, ignored = %name, "peer identity already set");
            return;
        }
        info!(peer = %name, "peer identified");
        self.peer = Some(PeerIdentity {
            display_name: name.clone(),
        });
        actions.push(Action::Event(TransferEvent::PeerIdentified { name }));
    }

    fn on_offer(
        &mut self,
        actions: &mut Vec<Action>,
        id: TransferId,
        descriptor: FileDescriptor,
        now: Instant,
    ) {
        if self.registry.contains(&id) {
            warn!(transfer_id = %id, error = %TransferError::DuplicateTransfer(id), "ignoring offer");
            return;
        }
        if descriptor.size > self.config.max_file_size {
            let error = TransferError::SizeExceeded {
                size: descriptor.size,
                max: self.config.max_file_size,
            };
            warn!(transfer_id = %id, error = %error, "rejecting offer automatically");
            self.push_control(actions, &ControlMessage::FileReject { id });
            self.record_failure(actions, id, descriptor, Direction::Received, error);
            return;
        }
        info!(transfer_id = %id, file_name = %descriptor.name, size = descriptor.size, "incoming offer");
        let transfer = IncomingTransfer::new(id, descriptor.clone(), now);
        if let Err(e) = self.registry.insert_incoming(transfer) {
            warn!(transfer_id = %id, error = %e, "ignoring offer");
            return;
        }
        actions.push(Action::Event(TransferEvent::OfferReceived { id, descriptor }));
    }

    fn on_accept(&mut self, actions: &mut Vec<Action>, id: TransferId) {
        let Some(t) = self.registry.outgoing_mut(&id) else {
            warn!(transfer_id = %id, error = %TransferError::UnknownTransfer(id), "ignoring accept");
            return;
        };
        match t.on_accept() {
            Ok(metadata) => {
                let descriptor = t.descriptor().clone();
                info!(transfer_id = %id, "offer accepted");
                self.push_control(actions, &metadata);
                actions.push(Action::Event(TransferEvent::OfferAccepted { id, descriptor }));
            }
            Err(e) => debug!(transfer_id = %id, error = %e, "late or duplicate accept ignored"),
        }
    }

    fn on_reject(&mut self, actions: &mut Vec<Action>, id: TransferId) {
        let Some(t) = self.registry.outgoing_mut(&id) else {
            warn!(transfer_id = %id, error = %TransferError::UnknownTransfer(id), "ignoring reject");
            return;
        };
        match t.on_reject() {
            Ok(()) => {
                let descriptor = t.descriptor().clone();
                info!(transfer_id = %id, "offer rejected");
                self.registry.retire(&id);
                actions.push(Action::Event(TransferEvent::OfferRejected { id, descriptor }));
            }
            Err(e) => warn!(transfer_id = %id, error = %e, "reject after accept ignored"),
        }
    }

    fn on_metadata(
        &mut self,
        actions: &mut Vec<Action>,
        id: TransferId,
        descriptor: FileDescriptor,
        now: Instant,
    ) {
        let Some(t) = self.registry.incoming_mut(&id) else {
            warn!(transfer_id = %id, error = %TransferError::UnknownTransfer(id), "ignoring metadata");
            return;
        };
        match t.on_metadata(&descriptor, now) {
            Ok(()) => debug!(transfer_id = %id, size = descriptor.size, "receive buffer allocated"),
            Err(e) => self.abort_incoming(actions, id, e, true),
        }
    }

    fn on_complete(&mut self, actions: &mut Vec<Action>, id: TransferId) {
        let Some(t) = self.registry.incoming_mut(&id) else {
            warn!(transfer_id = %id, error = %TransferError::UnknownTransfer(id), "ignoring completion");
            return;
        };
        match t.on_complete() {
            Ok(bytes) => {
                let descriptor = t.descriptor().clone();
                info!(transfer_id = %id, size = descriptor.size, "file received");
                self.registry.retire(&id);
                self.completed.push(CompletedFile {
                    id,
                    file_name: descriptor.name.clone(),
                    file_size: descriptor.size,
                });
                actions.push(Action::DeliverFile {
                    id,
                    descriptor: descriptor.clone(),
                    bytes,
                });
                self.record_completion(actions, id, descriptor, Direction::Received);
            }
            Err(e) => {
                let notify = !matches!(e, TransferError::TruncatedTransfer { .. });
                self.abort_incoming(actions, id, e, notify);
            }
        }
    }

    fn on_remote_cancel(&mut self, actions: &mut Vec<Action>, id: TransferId) {
        match self.registry.get(&id).map(TransferEntry::direction) {
            None => debug!(transfer_id = %id, "cancel for unknown transfer ignored"),
            Some(Direction::Sent) => {
                let Some(t) = self.registry.outgoing_mut(&id) else {
                    return;
                };
                if let Err(e) = t.cancel() {
                    debug!(transfer_id = %id, error = %e, "cancel after completion ignored");
                    return;
                }
                let descriptor = t.descriptor().clone();
                info!(transfer_id = %id, "peer cancelled transfer");
                self.registry.retire(&id);
                self.record_failure(
                    actions,
                    id,
                    descriptor,
                    Direction::Sent,
                    TransferError::Cancelled,
                );
            }
            Some(Direction::Received) => {
                info!(transfer_id = %id, "peer cancelled transfer");
                self.abort_incoming(actions, id, TransferError::Cancelled, false);
            }
        }
    }

    /// Abort an incoming transfer, release its buffer and retire it.
    /// With `notify_peer`, the sender is told to stop streaming.
    fn abort_incoming(
        &mut self,
        actions: &mut Vec<Action>,
        id: TransferId,
        error: TransferError,
        notify_peer: bool,
    ) {
        let Some(t) = self.registry.incoming_mut(&id) else {
            return;
        };
        t.abort();
        let descriptor = t.descriptor().clone();
        self.registry.retire(&id);
        if notify_peer {
            self.push_control(actions, &ControlMessage::FileCancel { id });
        }
        self.record_failure(actions, id, descriptor, Direction::Received, error);
    }

    fn teardown(&mut self, reason: &str) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.status == SessionStatus::Closed {
            return actions;
        }
        info!(reason, live = self.registry.len(), "closing session");
        self.status = SessionStatus::Closed;
        for entry in self.registry.clear() {
            let (id, descriptor) = match &entry {
                TransferEntry::Outgoing(t) => (t.id(), t.descriptor().clone()),
                TransferEntry::Incoming(t) => (t.id(), t.descriptor().clone()),
            };
            self.record_failure(
                &mut actions,
                id,
                descriptor,
                entry.direction(),
                TransferError::TransportClosed,
            );
        }
        self.peer = None;
        self.scheduler.reset();
        self.completed.clear();
        actions.push(Action::Event(TransferEvent::Disconnected));
        self.touch();
        actions
    }

    fn record_completion(
        &mut self,
        actions: &mut Vec<Action>,
        id: TransferId,
        descriptor: FileDescriptor,
        direction: Direction,
    ) {
        self.history.append(TransferRecord::now(
            descriptor.name.clone(),
            descriptor.size,
            direction,
            self.peer_label(),
            RecordStatus::Completed,
        ));
        actions.push(Action::Event(TransferEvent::Completed {
            id,
            descriptor,
            direction,
        }));
    }

    fn record_failure(
        &mut self,
        actions: &mut Vec<Action>,
        id: TransferId,
        descriptor: FileDescriptor,
        direction: Direction,
        error: TransferError,
    ) {
        warn!(transfer_id = %id, file_name = %descriptor.name, error = %error, "transfer failed");
        self.history.append(TransferRecord::now(
            descriptor.name.clone(),
            descriptor.size,
            direction,
            self.peer_label(),
            RecordStatus::Failed,
        ));
        actions.push(Action::Event(TransferEvent::Failed {
            id,
            descriptor,
            direction,
            error,
        }));
    }

    fn peer_label(&self) -> String {
        self.peer
            .as_ref()
            .map(|p| p.display_name.clone())
            .unwrap_or_else(|| "Unknown".to_string())
    }

    fn push_control(&self, actions: &mut Vec<Action>, msg: &ControlMessage) {
        match codec::encode_control(msg) {
            Ok(text) => actions.push(Action::SendText(text)),
            Err(e) => warn!(kind = msg.kind(), error = %e, "failed to encode control message"),
        }
    }

    fn ensure_connected(&self) -> Result<(), TransferError> {
        if self.status == SessionStatus::Connected {
            Ok(())
        } else {
            Err(TransferError::NotConnected)
        }
    }

    fn touch(&mut self) {
        self.revision = self.revision.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::time::Duration;

    use super::*;
    use crate::codec::{encode_chunk, CHUNK_HEADER_LEN};

    fn connected(name: &str) -> PeerSession {
        let mut s = PeerSession::new(name, Config::default());
        s.connect().unwrap();
        s.on_channel_open();
        s
    }

    fn control(actions: &[Action]) -> Vec<ControlMessage> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::SendText(t) => Some(codec::decode_control(t, usize::MAX).unwrap()),
                _ => None,
            })
            .collect()
    }

    fn events(actions: &[Action]) -> Vec<TransferEvent> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Event(e) => Some(e.clone()),
                _ => None,
            })
            .collect()
    }

    fn text(msg: &ControlMessage) -> String {
        codec::encode_control(msg).unwrap()
    }

    fn offer_from_peer(s: &mut PeerSession, size: u64) -> TransferId {
        let id = TransferId::new();
        s.on_text_message(&text(&ControlMessage::FileOffer {
            id,
            file_name: "in.bin".into(),
            file_size: size,
        }));
        id
    }

    fn receiving(s: &mut PeerSession, size: u64) -> TransferId {
        let id = offer_from_peer(s, size);
        s.accept(id).unwrap();
        s.on_text_message(&text(&ControlMessage::FileMetadata {
            id,
            file_name: "in.bin".into(),
            file_size: size,
        }));
        id
    }

    #[test]
    fn open_announces_identity() {
        let mut s = PeerSession::new("laptop", Config::default());
        s.connect().unwrap();
        assert_eq!(s.status(), SessionStatus::Connecting);
        let actions = s.on_channel_open();
        assert_eq!(
            control(&actions),
            vec![ControlMessage::PeerIdentity {
                name: "laptop".into()
            }]
        );
        assert_eq!(s.status(), SessionStatus::Connected);
    }

    #[test]
    fn operations_require_connection() {
        let mut s = PeerSession::new("a", Config::default());
        let err = s
            .offer(FileDescriptor::new("x", 1), Box::new(Cursor::new(vec![0])))
            .unwrap_err();
        assert_eq!(err, TransferError::NotConnected);
        assert!(matches!(
            s.accept(TransferId::new()),
            Err(TransferError::NotConnected)
        ));
        assert!(s.registry().is_empty());
    }

    #[test]
    fn first_peer_identity_wins() {
        let mut s = connected("a");
        let actions = s.on_text_message(&text(&ControlMessage::PeerIdentity { name: "b".into() }));
        assert_eq!(
            events(&actions),
            vec![TransferEvent::PeerIdentified { name: "b".into() }]
        );
        assert!(s
            .on_text_message(&text(&ControlMessage::PeerIdentity { name: "c".into() }))
            .is_empty());
        assert_eq!(s.peer().unwrap().display_name, "b");
    }

    #[test]
    fn malformed_control_is_dropped() {
        let mut s = connected("a");
        let before = s.revision();
        assert!(s.on_text_message("{not json").is_empty());
        assert!(s.on_text_message(r#"{"type":"file-accept","id":"nope"}"#).is_empty());
        assert!(s.on_binary_message(&[1, 2, 3]).is_empty());
        assert_eq!(s.revision(), before);
    }

    #[test]
    fn oversized_offer_is_rejected_without_pending_request() {
        let mut s = PeerSession::new(
            "a",
            Config {
                max_file_size: 10,
                ..Config::default()
            },
        );
        s.on_channel_open();
        let id = TransferId::new();
        let actions = s.on_text_message(&text(&ControlMessage::FileOffer {
            id,
            file_name: "big".into(),
            file_size: 11,
        }));
        assert_eq!(control(&actions), vec![ControlMessage::FileReject { id }]);
        assert!(matches!(
            events(&actions)[..],
            [TransferEvent::Failed {
                error: TransferError::SizeExceeded { size: 11, max: 10 },
                ..
            }]
        ));
        assert!(s.snapshot().pending_requests.is_empty());
    }

    #[test]
    fn duplicate_offer_ignored() {
        let mut s = connected("a");
        let id = offer_from_peer(&mut s, 5);
        let again = s.on_text_message(&text(&ControlMessage::FileOffer {
            id,
            file_name: "other".into(),
            file_size: 9,
        }));
        assert!(again.is_empty());
        assert_eq!(s.registry().incoming(&id).unwrap().descriptor().size, 5);
    }

    #[test]
    fn reject_retires_and_notifies() {
        let mut s = connected("a");
        let id = offer_from_peer(&mut s, 5);
        assert_eq!(s.snapshot().pending_requests.len(), 1);
        let actions = s.reject(id).unwrap();
        assert_eq!(control(&actions), vec![ControlMessage::FileReject { id }]);
        assert!(s.registry().is_empty());
        assert!(matches!(s.reject(id), Err(TransferError::UnknownTransfer(_))));
    }

    #[test]
    fn receive_delivers_exact_bytes() {
        let mut s = connected("a");
        let id = receiving(&mut s, 6);
        s.on_binary_message(&encode_chunk(id, 0, b"abc"));
        s.on_binary_message(&encode_chunk(id, 3, b"def"));
        let actions = s.on_text_message(&text(&ControlMessage::FileComplete { id }));
        let delivered: Vec<&[u8]> = actions
            .iter()
            .filter_map(|a| match a {
                Action::DeliverFile { bytes, .. } => Some(bytes.as_slice()),
                _ => None,
            })
            .collect();
        assert_eq!(delivered, vec![b"abcdef".as_slice()]);
        assert!(s.registry().is_empty());
        assert_eq!(s.snapshot().completed.len(), 1);
        assert_eq!(s.history().records()[0].status, RecordStatus::Completed);
    }

    #[test]
    fn truncated_transfer_fails_without_delivery() {
        let mut s = connected("a");
        let id = receiving(&mut s, 10);
        s.on_binary_message(&encode_chunk(id, 0, b"abc"));
        let actions = s.on_text_message(&text(&ControlMessage::FileComplete { id }));
        assert!(!actions.iter().any(|a| matches!(a, Action::DeliverFile { .. })));
        assert!(matches!(
            events(&actions)[..],
            [TransferEvent::Failed {
                error: TransferError::TruncatedTransfer {
                    received: 3,
                    expected: 10
                },
                ..
            }]
        ));
        assert!(s.registry().is_empty());
    }

    #[test]
    fn out_of_order_chunk_aborts_and_cancels() {
        let mut s = connected("a");
        let id = receiving(&mut s, 6);
        let actions = s.on_binary_message(&encode_chunk(id, 3, b"def"));
        assert_eq!(control(&actions), vec![ControlMessage::FileCancel { id }]);
        assert!(s.registry().is_empty());
        // Later chunks for the retired id are dropped.
        assert!(s.on_binary_message(&encode_chunk(id, 0, b"abc")).is_empty());
    }

    #[test]
    fn chunk_for_unknown_transfer_dropped() {
        let mut s = connected("a");
        assert!(s
            .on_binary_message(&encode_chunk(TransferId::new(), 0, b"x"))
            .is_empty());
    }

    #[test]
    fn send_flow_and_backpressure() {
        let mut s = PeerSession::new(
            "a",
            Config {
                chunk_size: 4,
                send_buffer_high_watermark: 8,
                ..Config::default()
            },
        );
        s.on_channel_open();
        let (id, actions) = s
            .offer(
                FileDescriptor::new("f", 10),
                Box::new(Cursor::new(b"0123456789".to_vec())),
            )
            .unwrap();
        assert!(matches!(
            control(&actions)[..],
            [ControlMessage::FileOffer { file_size: 10, .. }]
        ));
        assert!(s.pump(0).is_empty());

        let actions = s.on_text_message(&text(&ControlMessage::FileAccept { id }));
        assert!(matches!(
            control(&actions)[..],
            [ControlMessage::FileMetadata { .. }]
        ));

        // Buffer already above the watermark: nothing goes out.
        assert!(s.pump(8).is_empty());
        // One chunk (4 + 24 header bytes) exceeds the watermark, so one per pump.
        let first = s.pump(0);
        assert_eq!(first.len(), 1);
        assert!(matches!(&first[0], Action::SendBinary(b) if b.len() == CHUNK_HEADER_LEN + 4));
        assert_eq!(s.pump(0).len(), 1);
        assert_eq!(s.pump(0).len(), 1);
        let last = s.pump(0);
        assert_eq!(control(&last), vec![ControlMessage::FileComplete { id }]);
        assert_eq!(
            s.registry().outgoing(&id).unwrap().state(),
            OutgoingState::Completed
        );
        assert!(s.pump(0).is_empty());
    }

    #[test]
    fn late_accept_after_reject_is_ignored() {
        let mut s = connected("a");
        let (id, _) = s
            .offer(FileDescriptor::new("f", 3), Box::new(Cursor::new(vec![1, 2, 3])))
            .unwrap();
        let actions = s.on_text_message(&text(&ControlMessage::FileReject { id }));
        assert!(matches!(
            events(&actions)[..],
            [TransferEvent::OfferRejected { .. }]
        ));
        assert!(s
            .on_text_message(&text(&ControlMessage::FileAccept { id }))
            .is_empty());
        assert!(s.pump(0).is_empty());
    }

    #[test]
    fn local_cancel_of_outgoing() {
        let mut s = connected("a");
        let (id, _) = s
            .offer(FileDescriptor::new("f", 3), Box::new(Cursor::new(vec![1, 2, 3])))
            .unwrap();
        let actions = s.cancel(id).unwrap();
        assert_eq!(control(&actions), vec![ControlMessage::FileCancel { id }]);
        assert!(s.registry().is_empty());
        assert!(matches!(s.cancel(id), Err(TransferError::UnknownTransfer(_))));
    }

    #[test]
    fn remote_cancel_stops_receive() {
        let mut s = connected("a");
        let id = receiving(&mut s, 6);
        s.on_binary_message(&encode_chunk(id, 0, b"abc"));
        let actions = s.on_text_message(&text(&ControlMessage::FileCancel { id }));
        assert!(control(&actions).is_empty());
        assert!(matches!(
            events(&actions)[..],
            [TransferEvent::Failed {
                error: TransferError::Cancelled,
                ..
            }]
        ));
        assert!(s.registry().is_empty());
    }

    #[test]
    fn source_failure_aborts_and_cancels() {
        let mut s = connected("a");
        // Source shorter than the advertised size.
        let (id, _) = s
            .offer(FileDescriptor::new("f", 10), Box::new(Cursor::new(vec![1, 2])))
            .unwrap();
        s.on_text_message(&text(&ControlMessage::FileAccept { id }));
        let actions = s.pump(0);
        assert_eq!(control(&actions), vec![ControlMessage::FileCancel { id }]);
        assert!(matches!(
            events(&actions)[..],
            [TransferEvent::Failed {
                error: TransferError::SourceRead(_),
                ..
            }]
        ));
    }

    #[test]
    fn tick_expires_stale_offers() {
        let mut s = PeerSession::new(
            "a",
            Config {
                pending_timeout: Some(Duration::from_secs(5)),
                ..Config::default()
            },
        );
        s.on_channel_open();
        let incoming = offer_from_peer(&mut s, 3);
        let (outgoing, _) = s
            .offer(FileDescriptor::new("f", 3), Box::new(Cursor::new(vec![1, 2, 3])))
            .unwrap();

        assert!(s.tick(Instant::now()).is_empty());
        let actions = s.tick(Instant::now() + Duration::from_secs(6));
        let sent = control(&actions);
        assert!(sent.contains(&ControlMessage::FileReject { id: incoming }));
        assert!(sent.contains(&ControlMessage::FileCancel { id: outgoing }));
        assert!(events(&actions).iter().all(|e| matches!(
            e,
            TransferEvent::Failed {
                error: TransferError::TimedOut,
                ..
            }
        )));
        assert!(s.registry().is_empty());
    }

    #[test]
    fn tick_retires_completed_after_grace() {
        let mut s = connected("a");
        let (id, _) = s
            .offer(FileDescriptor::new("f", 1), Box::new(Cursor::new(vec![7])))
            .unwrap();
        s.on_text_message(&text(&ControlMessage::FileAccept { id }));
        s.pump(0);
        assert_eq!(s.snapshot().outgoing.len(), 1);
        assert_eq!(s.snapshot().outgoing[0].progress, 100);
        s.tick(Instant::now() + s.config().completed_grace + Duration::from_millis(1));
        assert!(s.registry().is_empty());
    }

    #[test]
    fn teardown_fails_live_transfers_once() {
        let mut s = connected("a");
        s.on_text_message(&text(&ControlMessage::PeerIdentity { name: "b".into() }));
        let incoming = receiving(&mut s, 6);
        s.offer(FileDescriptor::new("f", 3), Box::new(Cursor::new(vec![1, 2, 3])))
            .unwrap();

        let actions = s.on_channel_closed();
        let evs = events(&actions);
        assert_eq!(evs.len(), 3);
        assert!(evs[..2].iter().all(|e| matches!(
            e,
            TransferEvent::Failed {
                error: TransferError::TransportClosed,
                ..
            }
        )));
        assert_eq!(evs[2], TransferEvent::Disconnected);
        assert!(s.registry().is_empty());
        assert!(s.peer().is_none());
        assert_eq!(s.status(), SessionStatus::Closed);
        assert_eq!(s.history().records()[0].peer_name, "b");

        assert!(s.on_channel_closed().is_empty());
        assert!(s.disconnect().is_empty());
        assert!(s
            .on_binary_message(&encode_chunk(incoming, 0, b"abc"))
            .is_empty());
        assert_eq!(s.connect(), Err(TransferError::TransportClosed));
    }

    #[test]
    fn chunk_moves_revision_and_incoming_progress() {
        let mut s = connected("b");
        let id = receiving(&mut s, 8);
        let before = s.revision();
        assert_eq!(s.snapshot().incoming[0].bytes_transferred, 0);

        assert!(s.on_binary_message(&encode_chunk(id, 0, b"abcd")).is_empty());
        assert!(s.revision() > before);
        let snapshot = s.snapshot();
        let p = &snapshot.incoming[0];
        assert_eq!(p.id, id);
        assert_eq!(p.bytes_transferred, 4);
        assert_eq!(p.total_bytes, 8);
        assert_eq!(p.progress, 50);
        assert_eq!(p.state, "receiving");
    }

    #[test]
    fn revision_moves_on_change() {
        let mut s = connected("a");
        let r0 = s.snapshot().revision;
        offer_from_peer(&mut s, 1);
        assert!(s.snapshot().revision > r0);
    }
}
