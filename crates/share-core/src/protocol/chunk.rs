//! Binary chunk frames.
//!
//! Wire format: `[CHUNK_FRAME_TAG] ++ bincode(ChunkFrame)`.
//!
//! On upload `peer` names the target; the relay rewrites it to the sender
//! before forwarding, so on delivery it names where the bytes came from.

use super::encoding::CHUNK_FRAME_TAG;
use super::{ProtocolError, RequestId};
use crate::transfer::FileId;
use crate::PeerId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFrame {
    /// Target on upload, sender on delivery
    pub peer: PeerId,
    pub file_id: FileId,
    /// Position of this chunk within the file, starting at 0
    pub seq: u32,
    /// Set when the sender wants a relay acknowledgement
    pub request_id: Option<RequestId>,
    pub data: Vec<u8>,
}

impl ChunkFrame {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let body = bincode::serialize(self).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        let mut frame = Vec::with_capacity(1 + body.len());
        frame.push(CHUNK_FRAME_TAG);
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        match data.split_first() {
            Some((&CHUNK_FRAME_TAG, body)) => {
                bincode::deserialize(body).map_err(|e| ProtocolError::Decode(e.to_string()))
            }
            _ => Err(ProtocolError::Decode("missing chunk frame tag".into())),
        }
    }
}
