//! share-core: session and transfer coordination for ephemeral peer-to-peer
//! file sharing.
//!
//! This crate provides:
//! - Rosters for local discovery and code-addressed groups
//! - The group lifecycle (join window, open-share, disband, host departure)
//! - The relay-side `Hub` that turns protocol messages into deliveries
//! - The wire protocol between peers and the relay
//! - Chunked file transfer with path selection, flow control and progress

pub mod chat;
pub mod clock;
pub mod group;
pub mod hub;
pub mod peer_id;
pub mod protocol;
pub mod roster;
pub mod signal;
pub mod transfer;

pub use chat::{ChatError, ChatRelay};
pub use clock::{Clock, ManualClock, SystemClock};
pub use group::{GroupCode, GroupError, GroupManager, GroupPhase, JoinWindowScheduler, ScheduledTask};
pub use hub::Hub;
pub use peer_id::{PeerId, PeerIdError};
pub use protocol::{ChunkFrame, ClientMessage, ProtocolError, ServerMessage};
pub use roster::{RosterEntry, RosterSnapshot, RosterStore, Scope};
pub use signal::{Delivery, Outgoing, Receipt, SignalSwitch};
pub use transfer::{
    EventBus, FileId, FileMeta, PathKind, PeerChannel, TransferConfig, TransferCoordinator,
    TransferError, TransferEvent, TransferFrame, TransferReceiver,
};
