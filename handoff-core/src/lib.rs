//! Handoff: direct peer-to-peer file transfer over a message channel.
//! Host-driven: no I/O; host passes channel events and commands in and performs the returned actions.
//!
//! The channel carries two kinds of message: UTF-8 text (JSON control messages) and
//! binary (file chunks with a 24-byte id/offset header). It must deliver both in send
//! order and without loss while open; the core detects violations per transfer but
//! does not retransmit.

pub mod chunk;
pub mod codec;
pub mod config;
pub mod error;
pub mod history;
pub mod protocol;
pub mod receiver;
pub mod registry;
pub mod scheduler;
pub mod sender;
pub mod session;
pub mod view;
pub mod wire;

pub use config::Config;
pub use error::TransferError;
pub use history::{HistoryLog, MemoryHistory, RecordStatus, TransferRecord};
pub use protocol::{ControlMessage, Direction, FileDescriptor, TransferId, PROTOCOL_VERSION};
pub use sender::FileSource;
pub use session::{Action, PeerIdentity, PeerSession, TransferEvent};
pub use view::{SessionSnapshot, SessionStatus};
pub use wire::{decode_frame, encode_frame, ChannelMessage, FrameDecodeError, FrameEncodeError};
