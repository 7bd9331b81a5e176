//! Store-and-forward by peer identity.
//!
//! The switch knows who is connected and turns "send X to peer Y" into a
//! [`Delivery`], or nothing when Y is gone. Senders are never told about
//! dropped messages.

use crate::protocol::{ChunkFrame, RequestId, ServerMessage, SignalKind};
use crate::PeerId;
use std::collections::HashSet;
use tracing::debug;

/// Something to put on a peer's socket.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Message(ServerMessage),
    Chunk(ChunkFrame),
}

/// One outgoing item and the peers it goes to.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub to: Vec<PeerId>,
    pub message: Outgoing,
    /// Reply owed once the item has been written to the recipient
    pub receipt: Option<Receipt>,
}

/// An acknowledgement held back until a forwarded item leaves the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    pub to: PeerId,
    pub request_id: RequestId,
}

impl Delivery {
    pub fn message(to: Vec<PeerId>, message: ServerMessage) -> Self {
        Self {
            to,
            message: Outgoing::Message(message),
            receipt: None,
        }
    }

    /// Ask for `request_id` to be answered to `to` after the write.
    pub fn with_receipt(mut self, to: PeerId, request_id: RequestId) -> Self {
        self.receipt = Some(Receipt { to, request_id });
        self
    }

    pub fn one(to: PeerId, message: ServerMessage) -> Self {
        Self::message(vec![to], message)
    }
}

#[derive(Debug, Default)]
pub struct SignalSwitch {
    connected: HashSet<PeerId>,
}

impl SignalSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the peer was already connected.
    pub fn connect(&mut self, peer: PeerId) -> bool {
        self.connected.insert(peer)
    }

    /// Returns false if the peer was not connected.
    pub fn disconnect(&mut self, peer: &PeerId) -> bool {
        self.connected.remove(peer)
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.connected.contains(peer)
    }

    pub fn len(&self) -> usize {
        self.connected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connected.is_empty()
    }

    /// Forward a negotiation message. The payload is passed through untouched.
    pub fn relay(
        &self,
        from: PeerId,
        to: PeerId,
        kind: SignalKind,
        payload: serde_json::Value,
    ) -> Option<Delivery> {
        self.forward(
            to,
            Outgoing::Message(ServerMessage::SignalReceived {
                from,
                kind,
                payload,
            }),
        )
    }

    /// Address `message` to `to` if it is connected.
    pub fn forward(&self, to: PeerId, message: Outgoing) -> Option<Delivery> {
        if !self.is_connected(&to) {
            debug!("Dropping message for offline peer {}", to.short());
            return None;
        }
        Some(Delivery {
            to: vec![to],
            message,
            receipt: None,
        })
    }
}
