//! JSON control messages exchanged between peers and the relay.
//!
//! Every message is an object tagged by `"type"` with camelCase fields:
//! `{"type":"joinGroup","requestId":3,"displayName":"Bob","code":"481516"}`.
//! Requests that carry a `requestId` get exactly one `reply` with the same id.

use super::ProtocolError;
use crate::group::{GroupCode, GroupError};
use crate::roster::{RosterEntry, Scope};
use crate::transfer::{FileId, FileMeta};
use crate::PeerId;
use serde::{Deserialize, Serialize};

/// Correlates a request with its reply. Chosen by the client, unique per
/// connection.
pub type RequestId = u64;

/// Kind of connection-negotiation message. The payload itself is opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

/// Messages a peer sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    EnterLocal {
        display_name: String,
    },
    LeaveLocal,
    CreateGroup {
        request_id: RequestId,
        display_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        join_window_minutes: Option<u64>,
    },
    JoinGroup {
        request_id: RequestId,
        display_name: String,
        code: GroupCode,
    },
    LeaveGroup {
        code: GroupCode,
    },
    SetOpenShare {
        code: GroupCode,
        value: bool,
    },
    DisbandGroup {
        code: GroupCode,
    },
    Signal {
        to: PeerId,
        kind: SignalKind,
        payload: serde_json::Value,
    },
    Chat {
        scope: Scope,
        display_name: String,
        text: String,
    },
    TransferMeta {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
        target_id: PeerId,
        /// Group the transfer happens in, for share-permission checks
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<GroupCode>,
        file_id: FileId,
        name: String,
        size: u64,
        mime_type: String,
        chunk_bytes: u32,
    },
    TransferComplete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
        target_id: PeerId,
        file_id: FileId,
    },
    TransferAbort {
        target_id: PeerId,
        file_id: FileId,
        reason: String,
    },
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(data)?)
    }

    /// The request id, if this message expects a reply.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            ClientMessage::CreateGroup { request_id, .. }
            | ClientMessage::JoinGroup { request_id, .. } => Some(*request_id),
            ClientMessage::TransferMeta { request_id, .. }
            | ClientMessage::TransferComplete { request_id, .. } => *request_id,
            _ => None,
        }
    }

    /// Short name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::EnterLocal { .. } => "enterLocal",
            ClientMessage::LeaveLocal => "leaveLocal",
            ClientMessage::CreateGroup { .. } => "createGroup",
            ClientMessage::JoinGroup { .. } => "joinGroup",
            ClientMessage::LeaveGroup { .. } => "leaveGroup",
            ClientMessage::SetOpenShare { .. } => "setOpenShare",
            ClientMessage::DisbandGroup { .. } => "disbandGroup",
            ClientMessage::Signal { .. } => "signal",
            ClientMessage::Chat { .. } => "chat",
            ClientMessage::TransferMeta { .. } => "transferMeta",
            ClientMessage::TransferComplete { .. } => "transferComplete",
            ClientMessage::TransferAbort { .. } => "transferAbort",
        }
    }
}

/// Messages the relay sends to a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// First message on every connection: the identity the relay assigned
    Welcome {
        peer_id: PeerId,
    },
    Reply {
        request_id: RequestId,
        result: ReplyResult,
    },
    /// Full member list of a scope; replaces any earlier list
    Roster {
        scope: Scope,
        entries: Vec<RosterEntry>,
    },
    OpenShareChanged {
        code: GroupCode,
        value: bool,
    },
    JoinClosed {
        code: GroupCode,
    },
    GroupDisbanded {
        code: GroupCode,
        reason: String,
    },
    SignalReceived {
        from: PeerId,
        kind: SignalKind,
        payload: serde_json::Value,
    },
    ChatReceived {
        scope: Scope,
        peer_id: PeerId,
        display_name: String,
        text: String,
        timestamp: u64,
    },
    TransferMeta {
        from: PeerId,
        file_id: FileId,
        name: String,
        size: u64,
        mime_type: String,
        chunk_bytes: u32,
    },
    TransferComplete {
        from: PeerId,
        file_id: FileId,
    },
    TransferAborted {
        from: PeerId,
        file_id: FileId,
        reason: String,
    },
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn ok(request_id: RequestId, payload: ReplyPayload) -> Self {
        ServerMessage::Reply {
            request_id,
            result: ReplyResult::Ok(payload),
        }
    }

    pub fn error(request_id: RequestId, body: ErrorBody) -> Self {
        ServerMessage::Reply {
            request_id,
            result: ReplyResult::Error(body),
        }
    }

    pub fn transfer_meta(from: PeerId, meta: FileMeta) -> Self {
        ServerMessage::TransferMeta {
            from,
            file_id: meta.file_id,
            name: meta.name,
            size: meta.size,
            mime_type: meta.mime_type,
            chunk_bytes: meta.chunk_bytes,
        }
    }
}

/// Outcome of a request: `{"ok":{...}}` or `{"error":{...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReplyResult {
    Ok(ReplyPayload),
    Error(ErrorBody),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ReplyPayload {
    GroupCreated {
        code: GroupCode,
        host_id: PeerId,
        open_share: bool,
    },
    GroupJoined {
        code: GroupCode,
        host_id: PeerId,
        open_share: bool,
    },
    /// Relay accepted a transfer request for forwarding
    Accepted,
}

/// Machine-readable failure reason, distinct per cause so clients can tell
/// "group doesn't exist" from "too late to join".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCode {
    GroupNotFound,
    JoinWindowClosed,
    CreateFailed,
    NotMember,
    SharingRestricted,
    InvalidRequest,
    /// The relay is not tracking this transfer (never announced, or cancelled)
    TransferClosed,
    /// The recipient's queue on the relay is full
    RelayBusy,
    /// The recipient went away before the item was written
    PeerUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<&GroupError> for ErrorBody {
    fn from(err: &GroupError) -> Self {
        let code = match err {
            GroupError::GroupNotFound(_) => ErrorCode::GroupNotFound,
            GroupError::JoinWindowClosed(_) => ErrorCode::JoinWindowClosed,
            GroupError::CreateFailed => ErrorCode::CreateFailed,
            GroupError::NotMember { .. } => ErrorCode::NotMember,
            // Never surfaced on the wire; mapped for completeness
            GroupError::NotHost(_) => ErrorCode::InvalidRequest,
        };
        ErrorBody::new(code, err.to_string())
    }
}
