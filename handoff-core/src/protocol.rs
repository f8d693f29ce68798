//! Handoff wire protocol: transfer identifiers, file descriptors and control messages.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current protocol version. Stream transports exchange it before the first frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// Opaque transfer identifier, generated by the sender. Never reused within a session.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(Uuid);

impl TransferId {
    /// Fresh random id.
    pub fn new() -> Self {
        TransferId(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        TransferId(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for TransferId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(TransferId)
    }
}

/// Name and size of a file, fixed before the first chunk is sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub name: String,
    pub size: u64,
}

impl FileDescriptor {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }
}

/// Which side of a transfer this peer is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sent,
    Received,
}

/// Control messages carried on the text side of the channel as JSON.
/// Binary messages carry chunk payloads only (see `codec`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// Sent once by both sides right after the channel opens.
    PeerIdentity { name: String },
    /// Sender -> receiver: starts a transfer.
    #[serde(rename_all = "camelCase")]
    FileOffer {
        id: TransferId,
        file_name: String,
        file_size: u64,
    },
    /// Receiver -> sender: authorizes chunk streaming.
    FileAccept { id: TransferId },
    /// Receiver -> sender: declines before any bytes are sent.
    FileReject { id: TransferId },
    /// Sender -> receiver: immediately precedes the first chunk and allocates the receive buffer.
    #[serde(rename_all = "camelCase")]
    FileMetadata {
        id: TransferId,
        file_name: String,
        file_size: u64,
    },
    /// Sender -> receiver: end of the chunk stream.
    FileComplete { id: TransferId },
    /// Either side: the transfer was abandoned after the remote learned about it.
    FileCancel { id: TransferId },
}

impl ControlMessage {
    /// Transfer the message refers to, if any.
    pub fn transfer_id(&self) -> Option<TransferId> {
        match self {
            ControlMessage::PeerIdentity { .. } => None,
            ControlMessage::FileOffer { id, .. }
            | ControlMessage::FileAccept { id }
            | ControlMessage::FileReject { id }
            | ControlMessage::FileMetadata { id, .. }
            | ControlMessage::FileComplete { id }
            | ControlMessage::FileCancel { id } => Some(*id),
        }
    }

    /// Wire tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::PeerIdentity { .. } => "peer-identity",
            ControlMessage::FileOffer { .. } => "file-offer",
            ControlMessage::FileAccept { .. } => "file-accept",
            ControlMessage::FileReject { .. } => "file-reject",
            ControlMessage::FileMetadata { .. } => "file-metadata",
            ControlMessage::FileComplete { .. } => "file-complete",
            ControlMessage::FileCancel { .. } => "file-cancel",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_id_display_parses_back() {
        let id = TransferId::new();
        let parsed: TransferId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn transfer_ids_are_unique() {
        assert_ne!(TransferId::new(), TransferId::new());
    }

    #[test]
    fn offer_uses_wire_field_names() {
        let id = TransferId::new();
        let msg = ControlMessage::FileOffer {
            id,
            file_name: "a.txt".into(),
            file_size: 12,
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "file-offer");
        assert_eq!(v["id"], id.to_string());
        assert_eq!(v["fileName"], "a.txt");
        assert_eq!(v["fileSize"], 12);
    }

    #[test]
    fn peer_identity_tag() {
        let v = serde_json::to_value(ControlMessage::PeerIdentity {
            name: "laptop".into(),
        })
        .unwrap();
        assert_eq!(v["type"], "peer-identity");
        assert_eq!(v["name"], "laptop");
    }

    #[test]
    fn transfer_id_accessor() {
        let id = TransferId::new();
        assert_eq!(ControlMessage::FileComplete { id }.transfer_id(), Some(id));
        assert_eq!(
            ControlMessage::PeerIdentity { name: "x".into() }.transfer_id(),
            None
        );
    }
}
