//! Transfer registry: the single owner of every live transfer in a session, keyed by id.

use std::collections::HashMap;

use tracing::debug;

use crate::error::TransferError;
use crate::protocol::{Direction, TransferId};
use crate::receiver::IncomingTransfer;
use crate::sender::OutgoingTransfer;

/// A registry slot: one id maps to exactly one role.
pub enum TransferEntry {
    Outgoing(OutgoingTransfer),
    Incoming(IncomingTransfer),
}

impl TransferEntry {
    pub fn id(&self) -> TransferId {
        match self {
            TransferEntry::Outgoing(t) => t.id(),
            TransferEntry::Incoming(t) => t.id(),
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            TransferEntry::Outgoing(_) => Direction::Sent,
            TransferEntry::Incoming(_) => Direction::Received,
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            TransferEntry::Outgoing(t) => t.state().is_terminal(),
            TransferEntry::Incoming(t) => t.state().is_terminal(),
        }
    }

    fn abort(&mut self) {
        match self {
            TransferEntry::Outgoing(t) => t.abort(),
            TransferEntry::Incoming(t) => t.abort(),
        }
    }
}

/// At most one entry per id. Iteration follows insertion order so snapshots and
/// the send scheduler are deterministic.
#[derive(Default)]
pub struct TransferRegistry {
    entries: HashMap<TransferId, TransferEntry>,
    order: Vec<TransferId>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_outgoing(&mut self, transfer: OutgoingTransfer) -> Result<(), TransferError> {
        self.insert(TransferEntry::Outgoing(transfer))
    }

    pub fn insert_incoming(&mut self, transfer: IncomingTransfer) -> Result<(), TransferError> {
        self.insert(TransferEntry::Incoming(transfer))
    }

    fn insert(&mut self, entry: TransferEntry) -> Result<(), TransferError> {
        let id = entry.id();
        if self.entries.contains_key(&id) {
            return Err(TransferError::DuplicateTransfer(id));
        }
        self.entries.insert(id, entry);
        self.order.push(id);
        Ok(())
    }

    pub fn contains(&self, id: &TransferId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &TransferId) -> Option<&TransferEntry> {
        self.entries.get(id)
    }

    pub fn outgoing(&self, id: &TransferId) -> Option<&OutgoingTransfer> {
        match self.entries.get(id) {
            Some(TransferEntry::Outgoing(t)) => Some(t),
            _ => None,
        }
    }

    pub fn outgoing_mut(&mut self, id: &TransferId) -> Option<&mut OutgoingTransfer> {
        match self.entries.get_mut(id) {
            Some(TransferEntry::Outgoing(t)) => Some(t),
            _ => None,
        }
    }

    pub fn incoming(&self, id: &TransferId) -> Option<&IncomingTransfer> {
        match self.entries.get(id) {
            Some(TransferEntry::Incoming(t)) => Some(t),
            _ => None,
        }
    }

    pub fn incoming_mut(&mut self, id: &TransferId) -> Option<&mut IncomingTransfer> {
        match self.entries.get_mut(id) {
            Some(TransferEntry::Incoming(t)) => Some(t),
            _ => None,
        }
    }

    /// Remove an entry that reached a terminal state. Live entries stay put.
    pub fn retire(&mut self, id: &TransferId) -> Option<TransferEntry> {
        match self.entries.get(id) {
            Some(entry) if entry.is_terminal() => {}
            Some(_) => {
                debug!(transfer_id = %id, "refusing to retire live transfer");
                return None;
            }
            None => return None,
        }
        self.order.retain(|o| o != id);
        self.entries.remove(id)
    }

    /// Drop every entry. Returns the ones that were still live, aborted, in insertion order.
    pub fn clear(&mut self) -> Vec<TransferEntry> {
        let mut out = Vec::with_capacity(self.order.len());
        for id in self.order.drain(..) {
            if let Some(mut entry) = self.entries.remove(&id) {
                if !entry.is_terminal() {
                    entry.abort();
                    out.push(entry);
                }
            }
        }
        self.entries.clear();
        out
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &TransferEntry> {
        self.order.iter().filter_map(|id| self.entries.get(id))
    }

    /// Outgoing transfers with chunks or a completion still to emit, in insertion order.
    pub fn ready_to_send(&self) -> Vec<TransferId> {
        self.iter()
            .filter_map(|e| match e {
                TransferEntry::Outgoing(t) if t.has_pending_output() => Some(t.id()),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
