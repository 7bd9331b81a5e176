//! Transfer progress events and the bus that carries them.
//!
//! Subscribers get every event for every transfer on both sides; filter on
//! `direction` and `file_id` as needed.

use super::{FileId, PathKind};
use crate::PeerId;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    Send,
    Receive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum TransferEvent {
    Started {
        direction: Direction,
        peer: PeerId,
        file_id: FileId,
        name: String,
        size: u64,
        /// Known on the sending side only
        path: Option<PathKind>,
    },
    /// Emitted after each chunk is handed to the channel (send) or appended
    /// to the sink (receive).
    Progress {
        direction: Direction,
        peer: PeerId,
        file_id: FileId,
        bytes: u64,
        total: u64,
        percent: u8,
    },
    /// Best-effort throughput sample.
    Rate {
        direction: Direction,
        peer: PeerId,
        file_id: FileId,
        bytes_per_sec: u64,
    },
    Completed {
        direction: Direction,
        peer: PeerId,
        file_id: FileId,
        bytes: u64,
    },
    Aborted {
        direction: Direction,
        peer: PeerId,
        file_id: FileId,
        reason: String,
    },
}

impl TransferEvent {
    pub fn file_id(&self) -> &FileId {
        match self {
            TransferEvent::Started { file_id, .. }
            | TransferEvent::Progress { file_id, .. }
            | TransferEvent::Rate { file_id, .. }
            | TransferEvent::Completed { file_id, .. }
            | TransferEvent::Aborted { file_id, .. } => file_id,
        }
    }
}

/// Subscription handle that unsubscribes automatically when dropped.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(TransferEvent) + Send + Sync>;

/// Publishes transfer events to subscribers. Wrap in `Arc` to subscribe.
#[derive(Default)]
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(TransferEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run while emit holds the read lock
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    pub fn emit(&self, event: TransferEvent) {
        let callbacks: Vec<Callback> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}
