//! Peer-side client for the relay.
//!
//! Wraps one WebSocket connection: requests that expect a reply get a
//! correlation id, a oneshot and a timeout; everything else the relay sends
//! arrives as a [`ClientEvent`]. [`RelayChannel`] adapts the connection into a
//! [`PeerChannel`] so the transfer coordinator can use the relay as its
//! fallback path.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use share_core::group::GroupCode;
use share_core::protocol::{
    ErrorBody, ProtocolError, ReplyPayload, ReplyResult, RequestId, SignalKind,
};
use share_core::roster::Scope;
use share_core::transfer::{
    FileMeta, FileSink, PathKind, PeerChannel, ReceivedFile, SinkFactory, TransferError, TransferFrame,
    TransferReceiver,
};
use share_core::{ChunkFrame, ClientMessage, PeerId, ServerMessage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

/// How long a request waits for its reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Expected a welcome message, got: {0}")]
    Handshake(String),
    #[error("Connection closed")]
    Closed,
    #[error("Timed out waiting for reply")]
    Timeout,
    #[error("Request rejected: {}", .0.message)]
    Rejected(ErrorBody),
    #[error("Unexpected reply: {0:?}")]
    UnexpectedReply(ReplyPayload),
}

/// Something the relay pushed to us.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Message(ServerMessage),
    Chunk(ChunkFrame),
    /// The connection ended; no further events follow
    Closed,
}

impl ClientEvent {
    /// The transfer frame this event carries, with the peer it came from.
    pub fn into_transfer(self) -> Option<(PeerId, TransferFrame)> {
        match self {
            ClientEvent::Message(ServerMessage::TransferMeta {
                from,
                file_id,
                name,
                size,
                mime_type,
                chunk_bytes,
            }) => Some((
                from,
                TransferFrame::Meta(FileMeta {
                    file_id,
                    name,
                    size,
                    mime_type,
                    chunk_bytes,
                }),
            )),
            ClientEvent::Message(ServerMessage::TransferComplete { from, file_id }) => {
                Some((from, TransferFrame::Complete { file_id }))
            }
            ClientEvent::Message(ServerMessage::TransferAborted {
                from,
                file_id,
                reason,
            }) => Some((from, TransferFrame::Abort { file_id, reason })),
            ClientEvent::Chunk(frame) => Some((
                frame.peer,
                TransferFrame::Chunk {
                    file_id: frame.file_id,
                    seq: frame.seq,
                    data: frame.data,
                },
            )),
            _ => None,
        }
    }

    /// Feed this event to `receiver`. A closed connection abandons every
    /// transfer still in flight, since they all arrived over it.
    pub async fn apply_to<F: SinkFactory>(
        self,
        receiver: &mut TransferReceiver<F>,
    ) -> Option<ReceivedFile<<F::Sink as FileSink>::Output>> {
        if matches!(self, ClientEvent::Closed) {
            let aborted = receiver.on_all_closed().await;
            if aborted > 0 {
                warn!("Relay connection closed with {} transfer(s) in flight", aborted);
            }
            return None;
        }
        let (from, frame) = self.into_transfer()?;
        receiver.on_frame(from, frame).await
    }
}

/// Host and sharing mode of a group we created or joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub code: GroupCode,
    pub host_id: PeerId,
    pub open_share: bool,
}

struct Shared {
    peer_id: PeerId,
    outbox: mpsc::UnboundedSender<Message>,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<ReplyResult>>>,
    next_request: AtomicU64,
    closed: AtomicBool,
    /// Woken on every acknowledgement and on close
    progress: Notify,
    request_timeout: Duration,
}

impl Shared {
    fn register(&self) -> (RequestId, oneshot::Receiver<ReplyResult>) {
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        (id, rx)
    }

    fn forget(&self, id: RequestId) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    fn send_message(&self, message: &ClientMessage) -> Result<(), ClientError> {
        let json = message.to_json()?;
        self.outbox
            .send(Message::Text(json.into()))
            .map_err(|_| ClientError::Closed)
    }

    fn send_chunk(&self, frame: &ChunkFrame) -> Result<(), ClientError> {
        let bytes = frame.to_bytes()?;
        self.outbox
            .send(Message::Binary(bytes.into()))
            .map_err(|_| ClientError::Closed)
    }

    async fn request(
        &self,
        build: impl FnOnce(RequestId) -> ClientMessage,
    ) -> Result<ReplyPayload, ClientError> {
        let (id, rx) = self.register();
        if let Err(e) = self.send_message(&build(id)) {
            self.forget(id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(ReplyResult::Ok(payload))) => Ok(payload),
            Ok(Ok(ReplyResult::Error(body))) => Err(ClientError::Rejected(body)),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                self.forget(id);
                Err(ClientError::Timeout)
            }
        }
    }

    fn resolve(&self, id: RequestId, result: ReplyResult) {
        let waiter = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => debug!("Reply for unknown request {}", id),
        }
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the senders fails every outstanding request
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.progress.notify_waiters();
    }
}

/// Handle to a relay connection. Clones share the connection.
#[derive(Clone)]
pub struct RelayClient {
    shared: Arc<Shared>,
}

impl RelayClient {
    /// Connect and wait for the relay to assign our peer id.
    pub async fn connect(
        url: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>), ClientError> {
        Self::connect_with_timeout(url, DEFAULT_REQUEST_TIMEOUT).await
    }

    pub async fn connect_with_timeout(
        url: &str,
        request_timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>), ClientError> {
        let (ws, _) = connect_async(url).await?;
        let (mut write, mut read) = ws.split();

        let peer_id = match tokio::time::timeout(request_timeout, read.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                match ServerMessage::from_json(text.as_bytes())? {
                    ServerMessage::Welcome { peer_id } => peer_id,
                    other => return Err(ClientError::Handshake(format!("{:?}", other))),
                }
            }
            Ok(Some(Ok(other))) => return Err(ClientError::Handshake(format!("{:?}", other))),
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(None) => return Err(ClientError::Closed),
            Err(_) => return Err(ClientError::Timeout),
        };
        debug!("Connected to relay as {}", peer_id);

        let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<Message>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            peer_id,
            outbox,
            pending: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            progress: Notify::new(),
            request_timeout,
        });

        tokio::spawn(async move {
            while let Some(message) = outbox_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if write.send(message).await.is_err() || closing {
                    break;
                }
            }
        });

        let reader = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let event = match msg {
                    Ok(Message::Text(text)) => match ServerMessage::from_json(text.as_bytes()) {
                        Ok(ServerMessage::Reply { request_id, result }) => {
                            reader.resolve(request_id, result);
                            continue;
                        }
                        Ok(message) => ClientEvent::Message(message),
                        Err(e) => {
                            warn!("Bad message from relay: {}", e);
                            continue;
                        }
                    },
                    Ok(Message::Binary(data)) => match ChunkFrame::from_bytes(&data) {
                        Ok(frame) => ClientEvent::Chunk(frame),
                        Err(e) => {
                            warn!("Bad chunk from relay: {}", e);
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let _ = events_tx.send(event);
            }
            reader.mark_closed();
            let _ = events_tx.send(ClientEvent::Closed);
        });

        Ok((Self { shared }, events_rx))
    }

    pub fn peer_id(&self) -> PeerId {
        self.shared.peer_id
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn send(&self, message: &ClientMessage) -> Result<(), ClientError> {
        self.shared.send_message(message)
    }

    pub fn enter_local(&self, display_name: &str) -> Result<(), ClientError> {
        self.send(&ClientMessage::EnterLocal {
            display_name: display_name.to_string(),
        })
    }

    pub fn leave_local(&self) -> Result<(), ClientError> {
        self.send(&ClientMessage::LeaveLocal)
    }

    pub async fn create_group(
        &self,
        display_name: &str,
        join_window_minutes: Option<u64>,
    ) -> Result<GroupInfo, ClientError> {
        let reply = self
            .shared
            .request(|request_id| ClientMessage::CreateGroup {
                request_id,
                display_name: display_name.to_string(),
                join_window_minutes,
            })
            .await?;
        match reply {
            ReplyPayload::GroupCreated {
                code,
                host_id,
                open_share,
            } => Ok(GroupInfo {
                code,
                host_id,
                open_share,
            }),
            other => Err(ClientError::UnexpectedReply(other)),
        }
    }

    pub async fn join_group(
        &self,
        display_name: &str,
        code: &GroupCode,
    ) -> Result<GroupInfo, ClientError> {
        let reply = self
            .shared
            .request(|request_id| ClientMessage::JoinGroup {
                request_id,
                display_name: display_name.to_string(),
                code: code.clone(),
            })
            .await?;
        match reply {
            ReplyPayload::GroupJoined {
                code,
                host_id,
                open_share,
            } => Ok(GroupInfo {
                code,
                host_id,
                open_share,
            }),
            other => Err(ClientError::UnexpectedReply(other)),
        }
    }

    pub fn leave_group(&self, code: &GroupCode) -> Result<(), ClientError> {
        self.send(&ClientMessage::LeaveGroup { code: code.clone() })
    }

    pub fn set_open_share(&self, code: &GroupCode, value: bool) -> Result<(), ClientError> {
        self.send(&ClientMessage::SetOpenShare {
            code: code.clone(),
            value,
        })
    }

    pub fn disband_group(&self, code: &GroupCode) -> Result<(), ClientError> {
        self.send(&ClientMessage::DisbandGroup { code: code.clone() })
    }

    pub fn signal(
        &self,
        to: PeerId,
        kind: SignalKind,
        payload: serde_json::Value,
    ) -> Result<(), ClientError> {
        self.send(&ClientMessage::Signal { to, kind, payload })
    }

    pub fn chat(&self, scope: Scope, display_name: &str, text: &str) -> Result<(), ClientError> {
        self.send(&ClientMessage::Chat {
            scope,
            display_name: display_name.to_string(),
            text: text.to_string(),
        })
    }

    /// A transfer channel to `target` through the relay. `room` names the
    /// group the transfer belongs to, if any.
    pub fn relay_channel(&self, target: PeerId, room: Option<GroupCode>) -> RelayChannel {
        RelayChannel {
            shared: Arc::clone(&self.shared),
            target,
            room,
            outstanding: Arc::new(AtomicUsize::new(0)),
            failure: Arc::new(Mutex::new(None)),
        }
    }

    pub fn close(&self) {
        let _ = self.shared.outbox.send(Message::Close(None));
    }
}

/// The relay path to one peer.
///
/// `buffered_amount` counts chunk bytes the relay has not yet acknowledged.
pub struct RelayChannel {
    shared: Arc<Shared>,
    target: PeerId,
    room: Option<GroupCode>,
    outstanding: Arc<AtomicUsize>,
    /// Set when the relay rejects a chunk
    failure: Arc<Mutex<Option<String>>>,
}

impl RelayChannel {
    fn failure(&self) -> Option<String> {
        self.failure.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn check_usable(&self) -> Result<(), TransferError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransferError::ChannelClosed);
        }
        match self.failure() {
            Some(reason) => Err(TransferError::Rejected(reason)),
            None => Ok(()),
        }
    }

    async fn acked(
        &self,
        build: impl FnOnce(RequestId) -> ClientMessage,
    ) -> Result<(), TransferError> {
        self.shared.request(build).await.map(|_| ()).map_err(|e| match e {
            ClientError::Rejected(body) => TransferError::Rejected(body.message),
            ClientError::Timeout => TransferError::Timeout,
            ClientError::Protocol(e) => TransferError::Protocol(e),
            _ => TransferError::ChannelClosed,
        })
    }
}

#[async_trait]
impl PeerChannel for RelayChannel {
    fn path(&self) -> PathKind {
        PathKind::Relay
    }

    fn is_open(&self) -> bool {
        self.check_usable().is_ok()
    }

    fn buffered_amount(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    async fn wait_buffered_at_most(&self, threshold: usize) -> Result<(), TransferError> {
        loop {
            let notified = self.shared.progress.notified();
            self.check_usable()?;
            if self.buffered_amount() <= threshold {
                return Ok(());
            }
            if tokio::time::timeout(self.shared.request_timeout, notified)
                .await
                .is_err()
            {
                return Err(TransferError::Timeout);
            }
        }
    }

    async fn send(&self, frame: TransferFrame) -> Result<(), TransferError> {
        self.check_usable()?;
        let target_id = self.target;

        match frame {
            TransferFrame::Meta(meta) => {
                let room = self.room.clone();
                self.acked(|request_id| ClientMessage::TransferMeta {
                    request_id: Some(request_id),
                    target_id,
                    room,
                    file_id: meta.file_id,
                    name: meta.name,
                    size: meta.size,
                    mime_type: meta.mime_type,
                    chunk_bytes: meta.chunk_bytes,
                })
                .await
            }
            TransferFrame::Chunk { file_id, seq, data } => {
                let (request_id, rx) = self.shared.register();
                let len = data.len();
                let frame = ChunkFrame {
                    peer: target_id,
                    file_id,
                    seq,
                    request_id: Some(request_id),
                    data,
                };
                self.outstanding.fetch_add(len, Ordering::SeqCst);
                if let Err(e) = self.shared.send_chunk(&frame) {
                    self.outstanding.fetch_sub(len, Ordering::SeqCst);
                    self.shared.forget(request_id);
                    return Err(match e {
                        ClientError::Protocol(e) => TransferError::Protocol(e),
                        _ => TransferError::ChannelClosed,
                    });
                }

                let shared = Arc::clone(&self.shared);
                let outstanding = Arc::clone(&self.outstanding);
                let failure = Arc::clone(&self.failure);
                tokio::spawn(async move {
                    let result = rx.await;
                    outstanding.fetch_sub(len, Ordering::SeqCst);
                    if let Ok(ReplyResult::Error(body)) = result {
                        warn!("Relay rejected chunk {}: {}", seq, body.message);
                        *failure.lock().unwrap_or_else(|e| e.into_inner()) = Some(body.message);
                    }
                    shared.progress.notify_waiters();
                });
                Ok(())
            }
            TransferFrame::Complete { file_id } => {
                self.acked(|request_id| ClientMessage::TransferComplete {
                    request_id: Some(request_id),
                    target_id,
                    file_id,
                })
                .await
            }
            TransferFrame::Abort { file_id, reason } => self
                .shared
                .send_message(&ClientMessage::TransferAbort {
                    target_id,
                    file_id,
                    reason,
                })
                .map_err(|_| TransferError::ChannelClosed),
        }
    }
}
