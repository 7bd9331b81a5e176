//! Scope-wide text chat.

use crate::protocol::ServerMessage;
use crate::roster::Scope;
use crate::signal::Delivery;
use crate::PeerId;
use thiserror::Error;

/// Longest accepted message, in characters.
pub const DEFAULT_MAX_CHAT_LEN: usize = 4000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("Empty chat message")]
    Empty,
    #[error("Chat message too long ({len} > {max} characters)")]
    TooLong { len: usize, max: usize },
    #[error("Peer {peer} is not in scope {scope}")]
    NotInScope { scope: Scope, peer: PeerId },
}

#[derive(Debug, Clone)]
pub struct ChatRelay {
    max_len: usize,
}

impl Default for ChatRelay {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CHAT_LEN)
    }
}

impl ChatRelay {
    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }

    /// Build the broadcast of one message to every member of `scope`,
    /// sender included. `members` is the scope's current member list.
    pub fn compose(
        &self,
        scope: Scope,
        from: PeerId,
        display_name: String,
        text: String,
        members: Vec<PeerId>,
        timestamp: u64,
    ) -> Result<Delivery, ChatError> {
        if !members.contains(&from) {
            return Err(ChatError::NotInScope { scope, peer: from });
        }
        if text.trim().is_empty() {
            return Err(ChatError::Empty);
        }
        let len = text.chars().count();
        if len > self.max_len {
            return Err(ChatError::TooLong {
                len,
                max: self.max_len,
            });
        }

        Ok(Delivery::message(
            members,
            ServerMessage::ChatReceived {
                scope,
                peer_id: from,
                display_name,
                text,
                timestamp,
            },
        ))
    }
}
