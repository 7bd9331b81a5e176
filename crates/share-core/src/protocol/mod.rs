//! Wire protocol between peers and the relay.
//!
//! - JSON control messages in both directions (see [`messages`])
//! - Tagged bincode frames for file chunks (see [`chunk`])
//! - First-byte frame detection (see [`encoding`])

pub mod chunk;
pub mod encoding;
pub mod messages;

pub use chunk::ChunkFrame;
pub use encoding::{detect_frame_kind, FrameKind, CHUNK_FRAME_TAG};
pub use messages::{
    ClientMessage, ErrorBody, ErrorCode, ReplyPayload, ReplyResult, RequestId, ServerMessage,
    SignalKind,
};

use thiserror::Error;

/// Frames larger than this are dropped unread.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to encode frame: {0}")]
    Encode(String),
    #[error("Failed to decode frame: {0}")]
    Decode(String),
}
