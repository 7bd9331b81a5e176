//! The peer channel capability a transfer runs over.

use super::{FileId, FileMeta, PathKind, TransferError};
use crate::protocol::encoding::{detect_frame_kind, FrameKind, CHUNK_FRAME_TAG};
use crate::protocol::ProtocolError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One unit of a transfer as it travels over a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum TransferFrame {
    Meta(FileMeta),
    Chunk {
        file_id: FileId,
        seq: u32,
        data: Vec<u8>,
    },
    Complete {
        file_id: FileId,
    },
    Abort {
        file_id: FileId,
        reason: String,
    },
}

impl TransferFrame {
    pub fn file_id(&self) -> &FileId {
        match self {
            TransferFrame::Meta(meta) => &meta.file_id,
            TransferFrame::Chunk { file_id, .. }
            | TransferFrame::Complete { file_id }
            | TransferFrame::Abort { file_id, .. } => file_id,
        }
    }

    /// Encode for a message-oriented byte channel (a direct peer link).
    ///
    /// Control frames are JSON; chunks are the tag byte followed by
    /// `bincode((fileId, seq, data))`.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            TransferFrame::Chunk { file_id, seq, data } => {
                let body = bincode::serialize(&(file_id, seq, data))
                    .map_err(|e| ProtocolError::Encode(e.to_string()))?;
                let mut frame = Vec::with_capacity(1 + body.len());
                frame.push(CHUNK_FRAME_TAG);
                frame.extend_from_slice(&body);
                Ok(frame)
            }
            _ => Ok(serde_json::to_vec(self)?),
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        match detect_frame_kind(data) {
            FrameKind::Json => Ok(serde_json::from_slice(data)?),
            FrameKind::Chunk => {
                let (file_id, seq, data): (FileId, u32, Vec<u8>) = bincode::deserialize(&data[1..])
                    .map_err(|e| ProtocolError::Decode(e.to_string()))?;
                Ok(TransferFrame::Chunk { file_id, seq, data })
            }
            FrameKind::Empty => Err(ProtocolError::Decode("empty frame".into())),
            FrameKind::Unknown => Err(ProtocolError::Decode("unknown frame kind".into())),
        }
    }
}

/// An ordered, reliable, message-oriented channel to one peer.
///
/// `buffered_amount` is the number of bytes handed to the channel but not yet
/// sent (or, for the relay, not yet acknowledged).
#[async_trait]
pub trait PeerChannel: Send + Sync {
    fn path(&self) -> PathKind;

    fn is_open(&self) -> bool;

    fn buffered_amount(&self) -> usize;

    /// Suspend until `buffered_amount() <= threshold`.
    ///
    /// Fails with [`TransferError::ChannelClosed`] if the channel closes first.
    async fn wait_buffered_at_most(&self, threshold: usize) -> Result<(), TransferError>;

    async fn send(&self, frame: TransferFrame) -> Result<(), TransferError>;
}
