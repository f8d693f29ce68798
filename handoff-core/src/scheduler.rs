//! Send scheduler: pick which ready outgoing transfer emits the next chunk.
//! Round-robin over the ready set, so concurrent transfers progress independently.

use crate::protocol::TransferId;

#[derive(Debug, Default)]
pub struct SendScheduler {
    last: Option<TransferId>,
}

impl SendScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next transfer after the one served last, wrapping around. `ready` must be in a stable order.
    /// If the last-served transfer left the ready set, starts from the front.
    pub fn next(&mut self, ready: &[TransferId]) -> Option<TransferId> {
        if ready.is_empty() {
            return None;
        }
        let idx = self
            .last
            .and_then(|last| ready.iter().position(|id| *id == last))
            .map(|i| (i + 1) % ready.len())
            .unwrap_or(0);
        let id = ready[idx];
        self.last = Some(id);
        Some(id)
    }

    /// Forget the cursor (after teardown).
    pub fn reset(&mut self) {
        self.last = None;
    }
}
