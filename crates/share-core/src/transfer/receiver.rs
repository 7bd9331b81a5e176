//! Receiving side of a transfer.
//!
//! Sessions are keyed by `(sender, fileId)`, so any number of files from any
//! number of senders can be in flight at once. Chunks are applied strictly in
//! sequence order; early chunks wait in a bounded reorder buffer.

use super::channel::TransferFrame;
use super::events::{Direction, EventBus, TransferEvent};
use super::rate::RateMeter;
use super::sink::{FileSink, SinkFactory};
use super::{percent, FileId, FileMeta, TransferConfig, TransferError, REASON_CHANNEL_CLOSED};
use crate::clock::Clock;
use crate::PeerId;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A fully received file.
#[derive(Debug)]
pub struct ReceivedFile<O> {
    pub from: PeerId,
    pub meta: FileMeta,
    pub output: O,
}

struct Session<S> {
    meta: FileMeta,
    sink: S,
    received: u64,
    next_seq: u32,
    pending: BTreeMap<u32, Vec<u8>>,
    rate: RateMeter,
}

type SessionKey = (PeerId, FileId);

pub struct TransferReceiver<F: SinkFactory> {
    factory: F,
    sessions: HashMap<SessionKey, Session<F::Sink>>,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    config: TransferConfig,
}

impl<F: SinkFactory> TransferReceiver<F> {
    pub fn new(factory: F, config: TransferConfig, events: Arc<EventBus>, clock: Arc<dyn Clock>) -> Self {
        Self {
            factory,
            sessions: HashMap::new(),
            events,
            clock,
            config,
        }
    }

    /// Number of transfers in flight.
    pub fn active(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_receiving(&self, from: &PeerId, file_id: &FileId) -> bool {
        self.sessions.contains_key(&(*from, file_id.clone()))
    }

    /// Feed one frame from `from`. Returns the file once it is complete.
    pub async fn on_frame(
        &mut self,
        from: PeerId,
        frame: TransferFrame,
    ) -> Option<ReceivedFile<<F::Sink as FileSink>::Output>> {
        match frame {
            TransferFrame::Meta(meta) => {
                self.on_meta(from, meta).await;
                None
            }
            TransferFrame::Chunk { file_id, seq, data } => {
                self.on_chunk(from, file_id, seq, data).await;
                None
            }
            TransferFrame::Complete { file_id } => self.on_complete(from, file_id).await,
            TransferFrame::Abort { file_id, reason } => {
                self.on_abort(from, file_id, &reason).await;
                None
            }
        }
    }

    pub async fn on_meta(&mut self, from: PeerId, meta: FileMeta) {
        let key = (from, meta.file_id.clone());
        if self.sessions.contains_key(&key) {
            warn!("Duplicate announcement of {} from {}, ignoring", meta.file_id, from.short());
            return;
        }

        let started = TransferEvent::Started {
            direction: Direction::Receive,
            peer: from,
            file_id: meta.file_id.clone(),
            name: meta.name.clone(),
            size: meta.size,
            path: None,
        };

        match self.factory.create(from, &meta).await {
            Ok(sink) => {
                info!(
                    "Receiving {} ({} bytes) from {}",
                    meta.name,
                    meta.size,
                    from.short()
                );
                self.events.emit(started);
                let session = Session {
                    meta,
                    sink,
                    received: 0,
                    next_seq: 0,
                    pending: BTreeMap::new(),
                    rate: RateMeter::new(self.config.rate_interval, self.clock.now_ms()),
                };
                self.sessions.insert(key, session);
            }
            Err(e) => {
                warn!("Cannot accept {} from {}: {}", meta.file_id, from.short(), e);
                self.events.emit(started);
                self.emit_aborted(from, meta.file_id, e.reason());
            }
        }
    }

    pub async fn on_chunk(&mut self, from: PeerId, file_id: FileId, seq: u32, data: Vec<u8>) {
        let key = (from, file_id);
        let Some(session) = self.sessions.get_mut(&key) else {
            debug!("Chunk {} for unknown transfer {} from {}", seq, key.1, from.short());
            return;
        };

        if seq < session.next_seq {
            debug!("Duplicate chunk {} of {}", seq, key.1);
            return;
        }

        if seq > session.next_seq {
            if session.pending.len() >= self.config.reorder_window {
                let err = TransferError::ReorderOverflow(self.config.reorder_window);
                self.abort(&key, err.reason()).await;
            } else {
                session.pending.insert(seq, data);
            }
            return;
        }

        let mut next = Some(data);
        while let Some(data) = next {
            let now = self.clock.now_ms();
            if let Err(e) = session.apply(from, &data, &self.events, now).await {
                warn!("Transfer {} from {} failed: {}", key.1, from.short(), e);
                self.abort(&key, e.reason()).await;
                return;
            }
            let seq = session.next_seq;
            next = session.pending.remove(&seq);
        }
    }

    /// Finalize a transfer. The received byte count must equal the declared
    /// size at this moment.
    pub async fn on_complete(
        &mut self,
        from: PeerId,
        file_id: FileId,
    ) -> Option<ReceivedFile<<F::Sink as FileSink>::Output>> {
        let key = (from, file_id);
        let Some(session) = self.sessions.remove(&key) else {
            debug!("Completion for unknown transfer {} from {}", key.1, from.short());
            return None;
        };
        let (from, file_id) = key;

        if session.received != session.meta.size || !session.pending.is_empty() {
            let err = TransferError::SizeMismatch {
                expected: session.meta.size,
                actual: session.received,
            };
            warn!("Transfer {} from {} incomplete: {}", file_id, from.short(), err);
            session.sink.discard().await;
            self.emit_aborted(from, file_id, err.reason());
            return None;
        }

        let received = session.received;
        match session.sink.finish().await {
            Ok(output) => {
                info!("Received {} from {}", session.meta.name, from.short());
                self.events.emit(TransferEvent::Completed {
                    direction: Direction::Receive,
                    peer: from,
                    file_id,
                    bytes: received,
                });
                Some(ReceivedFile {
                    from,
                    meta: session.meta,
                    output,
                })
            }
            Err(e) => {
                warn!("Failed to finalize {} from {}: {}", file_id, from.short(), e);
                self.emit_aborted(from, file_id, e.reason());
                None
            }
        }
    }

    /// The sender gave up on a transfer.
    pub async fn on_abort(&mut self, from: PeerId, file_id: FileId, reason: &str) {
        self.abort(&(from, file_id), reason.to_string()).await;
    }

    /// The channel to `from` closed: every transfer from it is abandoned.
    /// Returns how many transfers were aborted.
    pub async fn on_channel_closed(&mut self, from: PeerId) -> usize {
        let keys: Vec<SessionKey> = self
            .sessions
            .keys()
            .filter(|(peer, _)| *peer == from)
            .cloned()
            .collect();
        for key in &keys {
            self.abort(key, REASON_CHANNEL_CLOSED.to_string()).await;
        }
        keys.len()
    }

    /// The connection carrying every transfer went away.
    pub async fn on_all_closed(&mut self) -> usize {
        let keys: Vec<SessionKey> = self.sessions.keys().cloned().collect();
        for key in &keys {
            self.abort(key, REASON_CHANNEL_CLOSED.to_string()).await;
        }
        keys.len()
    }

    async fn abort(&mut self, key: &SessionKey, reason: String) {
        let Some(session) = self.sessions.remove(key) else {
            return;
        };
        debug!("Discarding {} from {}: {}", key.1, key.0.short(), reason);
        session.sink.discard().await;
        self.emit_aborted(key.0, key.1.clone(), reason);
    }

    fn emit_aborted(&self, peer: PeerId, file_id: FileId, reason: String) {
        self.events.emit(TransferEvent::Aborted {
            direction: Direction::Receive,
            peer,
            file_id,
            reason,
        });
    }
}

impl<S: FileSink> Session<S> {
    /// Append the chunk at `next_seq`.
    async fn apply(
        &mut self,
        from: PeerId,
        data: &[u8],
        events: &EventBus,
        now_ms: u64,
    ) -> Result<(), TransferError> {
        let total = self.received + data.len() as u64;
        if total > self.meta.size {
            return Err(TransferError::SizeMismatch {
                expected: self.meta.size,
                actual: total,
            });
        }

        self.sink.write(data).await?;
        self.received = total;
        self.next_seq += 1;

        events.emit(TransferEvent::Progress {
            direction: Direction::Receive,
            peer: from,
            file_id: self.meta.file_id.clone(),
            bytes: self.received,
            total: self.meta.size,
            percent: percent(self.received, self.meta.size),
        });
        if let Some(bytes_per_sec) = self.rate.record(data.len() as u64, now_ms) {
            events.emit(TransferEvent::Rate {
                direction: Direction::Receive,
                peer: from,
                file_id: self.meta.file_id.clone(),
                bytes_per_sec,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::transfer::events::tests::record;
    use crate::transfer::sender::tests::FakeChannel;
    use crate::transfer::sender::{OutgoingFile, Route, TransferCoordinator};
    use crate::transfer::sink::{DirectorySinkFactory, MemorySinkFactory};
    use crate::transfer::{PathKind, PathTuning};
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn sender() -> PeerId {
        PeerId::from(0xa11ce)
    }

    fn receiver() -> (TransferReceiver<MemorySinkFactory>, Arc<EventBus>) {
        let events = Arc::new(EventBus::new());
        let receiver = TransferReceiver::new(
            MemorySinkFactory,
            TransferConfig::default(),
            Arc::clone(&events),
            Arc::new(ManualClock::new(0)),
        );
        (receiver, events)
    }

    fn meta(id: &str, size: u64) -> FileMeta {
        FileMeta {
            file_id: FileId::from(id),
            name: format!("{}.bin", id),
            size,
            mime_type: "application/octet-stream".into(),
            chunk_bytes: 1000,
        }
    }

    fn chunk(id: &str, seq: u32, data: &[u8]) -> TransferFrame {
        TransferFrame::Chunk {
            file_id: FileId::from(id),
            seq,
            data: data.to_vec(),
        }
    }

    fn complete(id: &str) -> TransferFrame {
        TransferFrame::Complete {
            file_id: FileId::from(id),
        }
    }

    fn aborted_count(seen: &Mutex<Vec<TransferEvent>>) -> usize {
        seen.lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, TransferEvent::Aborted { .. }))
            .count()
    }

    #[tokio::test]
    async fn test_assembles_three_chunks() {
        let (mut receiver, events) = receiver();
        let (_sub, seen) = record(&events);
        let data: Vec<u8> = (0..2500u32).map(|i| (i % 256) as u8).collect();

        receiver.on_frame(sender(), TransferFrame::Meta(meta("f", 2500))).await;
        receiver.on_frame(sender(), chunk("f", 0, &data[..1000])).await;
        receiver.on_frame(sender(), chunk("f", 1, &data[1000..2000])).await;
        receiver.on_frame(sender(), chunk("f", 2, &data[2000..])).await;
        let file = receiver.on_frame(sender(), complete("f")).await.unwrap();

        assert_eq!(file.output.len(), 2500);
        assert_eq!(file.output, data);
        assert_eq!(file.from, sender());
        assert_eq!(receiver.active(), 0);

        let seen = seen.lock().unwrap();
        let progress: Vec<u64> = seen
            .iter()
            .filter_map(|e| match e {
                TransferEvent::Progress { bytes, .. } => Some(*bytes),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![1000, 2000, 2500]);
    }

    #[tokio::test]
    async fn test_out_of_order_chunks_are_reordered() {
        let (mut receiver, _events) = receiver();
        receiver.on_meta(sender(), meta("f", 9)).await;
        receiver.on_chunk(sender(), FileId::from("f"), 2, b"ghi".to_vec()).await;
        receiver.on_chunk(sender(), FileId::from("f"), 0, b"abc".to_vec()).await;
        receiver.on_chunk(sender(), FileId::from("f"), 1, b"def".to_vec()).await;
        // Replayed chunk is ignored
        receiver.on_chunk(sender(), FileId::from("f"), 1, b"def".to_vec()).await;

        let file = receiver.on_complete(sender(), FileId::from("f")).await.unwrap();
        assert_eq!(file.output, b"abcdefghi");
    }

    #[tokio::test]
    async fn test_interleaved_files_from_same_sender() {
        let (mut receiver, _events) = receiver();
        receiver.on_meta(sender(), meta("a", 4)).await;
        receiver.on_meta(sender(), meta("b", 4)).await;
        receiver.on_frame(sender(), chunk("a", 0, b"aa")).await;
        receiver.on_frame(sender(), chunk("b", 0, b"bb")).await;
        receiver.on_frame(sender(), chunk("b", 1, b"BB")).await;
        receiver.on_frame(sender(), chunk("a", 1, b"AA")).await;

        let a = receiver.on_complete(sender(), FileId::from("a")).await.unwrap();
        let b = receiver.on_complete(sender(), FileId::from("b")).await.unwrap();
        assert_eq!(a.output, b"aaAA");
        assert_eq!(b.output, b"bbBB");
    }

    #[tokio::test]
    async fn test_channel_close_discards_and_aborts_once() {
        let (mut receiver, events) = receiver();
        let (_sub, seen) = record(&events);

        receiver.on_meta(sender(), meta("f", 2500)).await;
        receiver.on_chunk(sender(), FileId::from("f"), 0, vec![0; 1000]).await;

        assert_eq!(receiver.on_channel_closed(sender()).await, 1);
        assert_eq!(receiver.on_channel_closed(sender()).await, 0);
        receiver.on_abort(sender(), FileId::from("f"), "late").await;

        assert_eq!(aborted_count(&seen), 1);
        assert!(!receiver.is_receiving(&sender(), &FileId::from("f")));
        // Late frames for the discarded transfer go nowhere
        receiver.on_chunk(sender(), FileId::from("f"), 1, vec![0; 1000]).await;
        assert!(receiver.on_complete(sender(), FileId::from("f")).await.is_none());
        assert_eq!(aborted_count(&seen), 1);
    }

    #[tokio::test]
    async fn test_all_closed_discards_every_sender() {
        let (mut receiver, events) = receiver();
        let (_sub, seen) = record(&events);
        let other = PeerId::from(0xb0b);

        receiver.on_meta(sender(), meta("a", 2500)).await;
        receiver.on_meta(other, meta("b", 2500)).await;
        receiver.on_chunk(other, FileId::from("b"), 0, vec![0; 1000]).await;

        assert_eq!(receiver.on_all_closed().await, 2);
        assert_eq!(receiver.active(), 0);
        assert_eq!(aborted_count(&seen), 2);
        assert!(seen.lock().unwrap().iter().all(|e| match e {
            TransferEvent::Aborted { reason, .. } => reason == REASON_CHANNEL_CLOSED,
            _ => true,
        }));
        assert_eq!(receiver.on_all_closed().await, 0);
    }

    #[tokio::test]
    async fn test_complete_with_missing_bytes_aborts() {
        let (mut receiver, events) = receiver();
        let (_sub, seen) = record(&events);

        receiver.on_meta(sender(), meta("f", 2500)).await;
        receiver.on_chunk(sender(), FileId::from("f"), 0, vec![0; 1000]).await;
        assert!(receiver.on_complete(sender(), FileId::from("f")).await.is_none());

        let seen = seen.lock().unwrap();
        assert!(matches!(
            seen.last(),
            Some(TransferEvent::Aborted { reason, .. }) if reason == "sizeMismatch"
        ));
    }

    #[tokio::test]
    async fn test_oversize_aborts_immediately() {
        let (mut receiver, events) = receiver();
        let (_sub, seen) = record(&events);

        receiver.on_meta(sender(), meta("f", 4)).await;
        receiver.on_chunk(sender(), FileId::from("f"), 0, b"hello".to_vec()).await;

        assert_eq!(receiver.active(), 0);
        assert_eq!(aborted_count(&seen), 1);
    }

    #[tokio::test]
    async fn test_reorder_overflow_aborts() {
        let events = Arc::new(EventBus::new());
        let (_sub, seen) = record(&events);
        let mut config = TransferConfig::default();
        config.reorder_window = 2;
        let mut receiver = TransferReceiver::new(
            MemorySinkFactory,
            config,
            Arc::clone(&events),
            Arc::new(ManualClock::new(0)),
        );

        receiver.on_meta(sender(), meta("f", 100)).await;
        for seq in 1..=3 {
            receiver.on_chunk(sender(), FileId::from("f"), seq, vec![0; 10]).await;
        }
        assert_eq!(receiver.active(), 0);
        assert_eq!(aborted_count(&seen), 1);
    }

    #[tokio::test]
    async fn test_sender_abort_removes_part_file() {
        let tmp = TempDir::new().unwrap();
        let events = Arc::new(EventBus::new());
        let mut receiver = TransferReceiver::new(
            DirectorySinkFactory::new(tmp.path()),
            TransferConfig::default(),
            events,
            Arc::new(ManualClock::new(0)),
        );

        receiver.on_meta(sender(), meta("f", 10)).await;
        receiver.on_chunk(sender(), FileId::from("f"), 0, vec![1; 5]).await;
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 1);

        receiver.on_abort(sender(), FileId::from("f"), "cancelled").await;
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_sender_to_receiver_through_channel() {
        let events = Arc::new(EventBus::new());
        let clock = Arc::new(ManualClock::new(0));
        let mut config = TransferConfig::default();
        config.direct = PathTuning {
            chunk_bytes: 1000,
            high_watermark: 10_000,
            low_watermark: 1000,
        };
        let coordinator =
            TransferCoordinator::new(config.clone(), Arc::clone(&events), clock.clone());
        let mut receiver =
            TransferReceiver::new(MemorySinkFactory, config, Arc::clone(&events), clock);

        let channel = FakeChannel::new(PathKind::Direct);
        let route = Route {
            target: PeerId::from(2),
            direct: Some(channel.clone()),
            relay: None,
        };
        let data: Vec<u8> = (0..2500u32).map(|i| (i * 7 % 256) as u8).collect();
        let file = OutgoingFile {
            name: "photo.jpg".into(),
            size: 2500,
            mime_type: "image/jpeg".into(),
        };
        coordinator.send_file(&route, file, data.as_slice()).await.unwrap();

        let frames = channel.frames.lock().unwrap().clone();
        let mut received = None;
        for frame in frames {
            // Through the wire encoding a direct link would use
            let frame = TransferFrame::from_bytes(&frame.to_bytes().unwrap()).unwrap();
            if let Some(file) = receiver.on_frame(PeerId::from(1), frame).await {
                received = Some(file);
            }
        }

        let received = received.unwrap();
        assert_eq!(received.meta.name, "photo.jpg");
        assert_eq!(received.output, data);
    }
}
