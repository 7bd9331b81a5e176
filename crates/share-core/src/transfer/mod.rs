//! Chunked file transfer between peers.
//!
//! A transfer is `meta -> chunk* -> complete` over one [`PeerChannel`], either
//! a direct peer link or the relay. The sender side lives in [`sender`], the
//! receiver side in [`receiver`], and received bytes land in a [`FileSink`].
//!
//! Chunks always carry their `fileId` and a sequence number so the receiver
//! can route and order them regardless of path.

pub mod channel;
pub mod events;
pub mod rate;
pub mod receiver;
pub mod sender;
pub mod sink;

pub use channel::{PeerChannel, TransferFrame};
pub use events::{Direction, EventBus, Subscription, TransferEvent};
pub use rate::RateMeter;
pub use receiver::{ReceivedFile, TransferReceiver};
pub use sender::{FanOut, OutgoingFile, Route, TransferCoordinator};
pub use sink::{DirectorySink, DirectorySinkFactory, FileSink, MemorySink, MemorySinkFactory, SinkFactory};

use crate::protocol::ProtocolError;
use crate::PeerId;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::time::Duration;
use thiserror::Error;

/// Abort reason sent when the channel closes mid-transfer.
pub const REASON_CHANNEL_CLOSED: &str = "channelClosed";

/// Abort reason when the received byte count disagrees with the declared size.
pub const REASON_SIZE_MISMATCH: &str = "sizeMismatch";

/// Identifier of one logical file from one sender.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for FileId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FileId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for FileId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Announcement that opens a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub file_id: FileId,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    /// Upper bound on the payload of each chunk
    pub chunk_bytes: u32,
}

/// Which carrier a channel uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PathKind {
    /// Peer-to-peer link negotiated out of band
    Direct,
    /// Chunks forwarded by the relay server
    Relay,
}

/// Chunk size and backpressure thresholds for one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathTuning {
    pub chunk_bytes: usize,
    /// Stop handing chunks to the channel above this many buffered bytes
    pub high_watermark: usize,
    /// Resume once the channel drains to this many buffered bytes
    pub low_watermark: usize,
}

/// Transfer tuning.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub direct: PathTuning,
    pub relay: PathTuning,
    /// Pause between relay chunks; zero disables it
    pub relay_chunk_delay: Duration,
    /// How often throughput is sampled
    pub rate_interval: Duration,
    /// Out-of-order chunks a receiver holds before giving up
    pub reorder_window: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            direct: PathTuning {
                chunk_bytes: 512 * 1024,
                high_watermark: 16 * 1024 * 1024,
                low_watermark: 4 * 1024 * 1024,
            },
            relay: PathTuning {
                chunk_bytes: 64 * 1024,
                high_watermark: 1024 * 1024,
                low_watermark: 256 * 1024,
            },
            relay_chunk_delay: Duration::ZERO,
            rate_interval: Duration::from_secs(1),
            reorder_window: 64,
        }
    }
}

impl TransferConfig {
    pub fn tuning(&self, path: PathKind) -> PathTuning {
        match path {
            PathKind::Direct => self.direct,
            PathKind::Relay => self.relay,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("No open channel to peer {0}")]
    ChannelNotReady(PeerId),
    #[error("Channel closed")]
    ChannelClosed,
    #[error("Timed out waiting for the channel")]
    Timeout,
    #[error("Rejected: {0}")]
    Rejected(String),
    #[error("Size mismatch: declared {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("Too many out-of-order chunks (limit {0})")]
    ReorderOverflow(usize),
    #[error("Failed to read source: {0}")]
    Source(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl TransferError {
    /// Short machine-readable reason carried in abort frames and events.
    pub fn reason(&self) -> String {
        match self {
            TransferError::ChannelNotReady(_) => "channelNotReady".into(),
            TransferError::ChannelClosed => REASON_CHANNEL_CLOSED.into(),
            TransferError::Timeout => "timeout".into(),
            TransferError::Rejected(_) => "rejected".into(),
            TransferError::SizeMismatch { .. } => REASON_SIZE_MISMATCH.into(),
            TransferError::ReorderOverflow(_) => "reorderOverflow".into(),
            TransferError::Source(_) => "sourceError".into(),
            TransferError::Io(_) => "ioError".into(),
            TransferError::Protocol(_) => "protocolError".into(),
        }
    }
}

/// Whole-number percentage of `done` over `total`. An empty file is 100%.
pub(crate) fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) as u128 * 100) / total as u128) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 0), 100);
        assert_eq!(percent(0, 2500), 0);
        assert_eq!(percent(1000, 2500), 40);
        assert_eq!(percent(2500, 2500), 100);
        assert_eq!(percent(u64::MAX, u64::MAX), 100);
    }

    #[test]
    fn test_relay_chunks_smaller_than_direct() {
        let config = TransferConfig::default();
        assert!(config.tuning(PathKind::Direct).chunk_bytes >= 8 * config.tuning(PathKind::Relay).chunk_bytes);
        for path in [PathKind::Direct, PathKind::Relay] {
            let t = config.tuning(path);
            assert!(t.low_watermark < t.high_watermark);
        }
    }

    #[test]
    fn test_generated_file_ids_differ() {
        assert_ne!(FileId::generate(), FileId::generate());
    }
}
