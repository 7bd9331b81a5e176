//! Individual peer connection management.
//!
//! Each connection splits its WebSocket into a read task, which decodes
//! frames into [`ConnectionEvent`]s, and a write task fed by a queue so a
//! slow peer never stalls the relay loop. Control messages always queue.
//! Relayed chunks count against a byte limit, and their sender is only
//! acknowledged once the chunk has actually been written.

use anyhow::{anyhow, Result};
use futures::{SinkExt, StreamExt};
use share_core::protocol::{
    detect_frame_kind, ErrorBody, ErrorCode, FrameKind, ReplyPayload, RequestId, MAX_FRAME_SIZE,
};
use share_core::{ChunkFrame, ClientMessage, Outgoing, PeerId, ServerMessage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    tungstenite::{Error as WsError, Message},
    WebSocketStream,
};
use tracing::{debug, error, warn};

/// Event emitted by a connection's read task.
#[derive(Debug)]
pub enum ConnectionEvent {
    Message { peer: PeerId, message: ClientMessage },
    Chunk { peer: PeerId, frame: ChunkFrame },
    Closed { peer: PeerId },
}

/// Encode an outgoing item as a WebSocket frame: JSON as text, chunks as
/// binary.
pub fn encode(outgoing: &Outgoing) -> Result<Message> {
    match outgoing {
        Outgoing::Message(message) => Ok(Message::Text(message.to_json()?.into())),
        Outgoing::Chunk(frame) => Ok(Message::Binary(frame.to_bytes()?.into())),
    }
}

/// Bytes of relayed chunks sitting in one connection's write queue.
#[derive(Debug, Clone)]
pub struct QueueGauge {
    bytes: Arc<AtomicUsize>,
    limit: usize,
}

impl QueueGauge {
    pub fn new(limit: usize) -> Self {
        Self {
            bytes: Arc::new(AtomicUsize::new(0)),
            limit,
        }
    }

    /// Claim room for `len` bytes. An empty queue always takes one chunk,
    /// however large.
    pub fn try_reserve(&self, len: usize) -> bool {
        self.bytes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current == 0 || current.saturating_add(len) <= self.limit).then_some(current + len)
            })
            .is_ok()
    }

    pub fn release(&self, len: usize) {
        self.bytes.fetch_sub(len, Ordering::SeqCst);
    }

    pub fn queued(&self) -> usize {
        self.bytes.load(Ordering::SeqCst)
    }
}

/// Acknowledgement owed to a chunk's sender.
#[derive(Debug)]
pub struct PendingAck {
    outbox: mpsc::WeakUnboundedSender<Queued>,
    request_id: RequestId,
}

impl PendingAck {
    pub fn accept(self) {
        let reply = ServerMessage::ok(self.request_id, ReplyPayload::Accepted);
        self.settle(reply);
    }

    pub fn refuse(self, code: ErrorCode, message: &str) {
        let reply = ServerMessage::error(self.request_id, ErrorBody::new(code, message));
        self.settle(reply);
    }

    fn settle(self, reply: ServerMessage) {
        // The sender may have gone away in the meantime
        let Some(outbox) = self.outbox.upgrade() else {
            return;
        };
        match encode(&Outgoing::Message(reply)) {
            Ok(message) => {
                let _ = outbox.send(Queued::plain(message));
            }
            Err(e) => error!("Failed to encode chunk acknowledgement: {}", e),
        }
    }
}

/// One frame in a connection's write queue.
#[derive(Debug)]
pub struct Queued {
    message: Message,
    chunk_bytes: usize,
    receipt: Option<PendingAck>,
}

impl Queued {
    fn plain(message: Message) -> Self {
        Self {
            message,
            chunk_bytes: 0,
            receipt: None,
        }
    }
}

/// A single WebSocket connection to a peer.
pub struct PeerConnection {
    pub peer_id: PeerId,
    outbox: mpsc::UnboundedSender<Queued>,
    gauge: QueueGauge,
    read_task: Option<JoinHandle<()>>,
    write_task: Option<JoinHandle<()>>,
}

impl PeerConnection {
    /// Wrap an upgraded stream. Spawns the read and write tasks. At most
    /// `queue_limit` bytes of relayed chunks wait for this peer at once.
    pub fn new(
        peer_id: PeerId,
        ws_stream: WebSocketStream<TcpStream>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
        queue_limit: usize,
    ) -> Self {
        let (write, read) = ws_stream.split();
        let (outbox, outbox_rx) = mpsc::unbounded_channel::<Queued>();
        let gauge = QueueGauge::new(queue_limit);

        let read_task = tokio::spawn(Self::read_loop(peer_id, read, event_tx));
        let write_task = tokio::spawn(Self::write_loop(peer_id, write, outbox_rx, gauge.clone()));

        Self {
            peer_id,
            outbox,
            gauge,
            read_task: Some(read_task),
            write_task: Some(write_task),
        }
    }

    async fn write_loop(
        peer_id: PeerId,
        mut write: futures::stream::SplitSink<WebSocketStream<TcpStream>, Message>,
        mut outbox_rx: mpsc::UnboundedReceiver<Queued>,
        gauge: QueueGauge,
    ) {
        while let Some(queued) = outbox_rx.recv().await {
            let Queued {
                message,
                chunk_bytes,
                receipt,
            } = queued;
            let closing = matches!(message, Message::Close(_));
            let result = write.send(message).await;
            gauge.release(chunk_bytes);

            if let Err(e) = result {
                debug!("Write to {} failed: {}", peer_id.short(), e);
                if let Some(receipt) = receipt {
                    receipt.refuse(ErrorCode::PeerUnavailable, "Recipient disconnected");
                }
                break;
            }
            if let Some(receipt) = receipt {
                receipt.accept();
            }
            if closing {
                break;
            }
        }

        // Whatever is still queued will never be written
        outbox_rx.close();
        while let Ok(queued) = outbox_rx.try_recv() {
            gauge.release(queued.chunk_bytes);
            if let Some(receipt) = queued.receipt {
                receipt.refuse(ErrorCode::PeerUnavailable, "Recipient disconnected");
            }
        }
    }

    async fn read_loop(
        peer_id: PeerId,
        mut read: futures::stream::SplitStream<WebSocketStream<TcpStream>>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    let data = match msg {
                        Message::Binary(data) => data.to_vec(),
                        Message::Text(text) => text.as_bytes().to_vec(),
                        Message::Ping(_) | Message::Pong(_) => continue,
                        Message::Close(_) => {
                            debug!("Received close frame from {}", peer_id.short());
                            break;
                        }
                        Message::Frame(_) => continue,
                    };

                    if data.len() > MAX_FRAME_SIZE {
                        warn!(
                            "Frame from {} exceeds max size ({} > {}), dropping",
                            peer_id.short(),
                            data.len(),
                            MAX_FRAME_SIZE
                        );
                        continue;
                    }

                    if let Some(event) = Self::decode(peer_id, &data) {
                        let _ = event_tx.send(event);
                    }
                }
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Connection {} closed", peer_id.short());
                        }
                        _ => {
                            error!("WebSocket error on {}: {}", peer_id.short(), e);
                        }
                    }
                    break;
                }
                None => {
                    debug!("Connection {} stream ended", peer_id.short());
                    break;
                }
            }
        }

        let _ = event_tx.send(ConnectionEvent::Closed { peer: peer_id });
    }

    fn decode(peer: PeerId, data: &[u8]) -> Option<ConnectionEvent> {
        match detect_frame_kind(data) {
            FrameKind::Json => match ClientMessage::from_json(data) {
                Ok(message) => Some(ConnectionEvent::Message { peer, message }),
                Err(e) => {
                    warn!("Bad message from {}: {}", peer.short(), e);
                    None
                }
            },
            FrameKind::Chunk => match ChunkFrame::from_bytes(data) {
                Ok(frame) => Some(ConnectionEvent::Chunk { peer, frame }),
                Err(e) => {
                    warn!("Bad chunk from {}: {}", peer.short(), e);
                    None
                }
            },
            FrameKind::Empty => None,
            FrameKind::Unknown => {
                warn!(
                    "Unknown frame from {} ({} bytes), dropping",
                    peer.short(),
                    data.len()
                );
                None
            }
        }
    }

    /// Queue a frame. Fails only once the write task has gone away.
    pub fn send(&self, message: Message) -> Result<()> {
        self.outbox
            .send(Queued::plain(message))
            .map_err(|_| anyhow!("Connection to {} is closed", self.peer_id.short()))
    }

    /// Queue a relayed chunk if this peer's queue has room. `receipt` is
    /// settled either way: accepted once written, refused with `relayBusy`
    /// when the queue is full or `peerUnavailable` when the peer is gone.
    pub fn send_chunk(&self, message: Message, receipt: Option<PendingAck>) -> Result<()> {
        let len = message.len();
        if !self.gauge.try_reserve(len) {
            if let Some(receipt) = receipt {
                receipt.refuse(ErrorCode::RelayBusy, "Recipient is not keeping up");
            }
            return Err(anyhow!(
                "Queue for {} is full ({} bytes waiting), dropping chunk",
                self.peer_id.short(),
                self.gauge.queued()
            ));
        }

        let queued = Queued {
            message,
            chunk_bytes: len,
            receipt,
        };
        if let Err(mpsc::error::SendError(queued)) = self.outbox.send(queued) {
            self.gauge.release(len);
            if let Some(receipt) = queued.receipt {
                receipt.refuse(ErrorCode::PeerUnavailable, "Recipient disconnected");
            }
            return Err(anyhow!("Connection to {} is closed", self.peer_id.short()));
        }
        Ok(())
    }

    /// A handle for acknowledging request `request_id` to this peer later.
    pub fn pending_ack(&self, request_id: RequestId) -> PendingAck {
        PendingAck {
            outbox: self.outbox.downgrade(),
            request_id,
        }
    }

    /// Close the connection gracefully.
    pub fn close(&mut self) {
        let _ = self.outbox.send(Queued::plain(Message::Close(None)));
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
        // The write task ends by itself once the queue drains and closes
        self.write_task.take();
    }
}
