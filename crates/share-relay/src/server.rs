//! WebSocket server for accepting peer connections.
//!
//! Assigns each connection a fresh [`PeerId`] and hides per-connection tasks
//! behind `poll_event()` and `deliver()`.

use crate::connection::{encode, ConnectionEvent, PeerConnection};
use anyhow::Result;
use share_core::protocol::ErrorCode;
use share_core::{ChunkFrame, ClientMessage, Delivery, Outgoing, PeerId};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, error, info, warn};

/// Event emitted by the server.
#[derive(Debug)]
pub enum ServerEvent {
    Connected(PeerId),
    Message { from: PeerId, message: ClientMessage },
    Chunk { from: PeerId, frame: ChunkFrame },
    Disconnected(PeerId),
}

type Upgraded = (WebSocketStream<TcpStream>, SocketAddr);

/// Relayed chunk bytes allowed to wait for one recipient.
pub const DEFAULT_QUEUE_LIMIT: usize = 8 * 1024 * 1024;

pub struct RelayServer {
    connections: HashMap<PeerId, PeerConnection>,
    queue_limit: usize,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    event_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    upgrade_tx: mpsc::UnboundedSender<Upgraded>,
    upgrade_rx: mpsc::UnboundedReceiver<Upgraded>,
}

impl Default for RelayServer {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayServer {
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (upgrade_tx, upgrade_rx) = mpsc::unbounded_channel();
        Self {
            connections: HashMap::new(),
            queue_limit: DEFAULT_QUEUE_LIMIT,
            event_tx,
            event_rx,
            upgrade_tx,
            upgrade_rx,
        }
    }

    pub fn with_queue_limit(mut self, bytes: usize) -> Self {
        self.queue_limit = bytes;
        self
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("Relay listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Upgrade a TCP connection to WebSocket in the background. The peer
    /// shows up as `Connected` from `poll_event` once the upgrade finishes.
    pub fn accept_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let upgrade_tx = self.upgrade_tx.clone();
        tokio::spawn(async move {
            match accept_async(stream).await {
                Ok(ws) => {
                    let _ = upgrade_tx.send((ws, addr));
                }
                Err(e) => {
                    // Health checks connect and hang up without a handshake
                    let err_str = e.to_string();
                    if err_str.contains("Handshake not finished")
                        || err_str.contains("Connection reset")
                        || err_str.contains("unexpected EOF")
                    {
                        debug!("Connection closed before handshake from {}", addr);
                    } else {
                        error!("WebSocket upgrade failed for {}: {}", addr, e);
                    }
                }
            }
        });
    }

    /// Wait for the next server event.
    ///
    /// Events from connections that were already removed are skipped.
    pub async fn poll_event(&mut self) -> Option<ServerEvent> {
        loop {
            tokio::select! {
                Some((ws, addr)) = self.upgrade_rx.recv() => {
                    let peer = self.register(ws, addr);
                    return Some(ServerEvent::Connected(peer));
                }
                Some(event) = self.event_rx.recv() => {
                    match event {
                        ConnectionEvent::Message { peer, message } => {
                            if self.connections.contains_key(&peer) {
                                return Some(ServerEvent::Message { from: peer, message });
                            }
                        }
                        ConnectionEvent::Chunk { peer, frame } => {
                            if self.connections.contains_key(&peer) {
                                return Some(ServerEvent::Chunk { from: peer, frame });
                            }
                        }
                        ConnectionEvent::Closed { peer } => {
                            if self.connections.remove(&peer).is_some() {
                                info!("Peer {} disconnected", peer.short());
                                return Some(ServerEvent::Disconnected(peer));
                            }
                        }
                    }
                }
                else => return None,
            }
        }
    }

    fn register(&mut self, ws: WebSocketStream<TcpStream>, addr: SocketAddr) -> PeerId {
        let mut peer = PeerId::generate();
        while self.connections.contains_key(&peer) {
            peer = PeerId::generate();
        }
        info!("New connection from {} as {}", addr, peer);
        let conn = PeerConnection::new(peer, ws, self.event_tx.clone(), self.queue_limit);
        self.connections.insert(peer, conn);
        peer
    }

    /// Write out deliveries. Recipients that are gone are skipped.
    ///
    /// Chunks go through the recipient's bounded queue, and their receipt is
    /// answered to the sender once the chunk is written or refused.
    pub fn deliver(&self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            let frame = match encode(&delivery.message) {
                Ok(frame) => frame,
                Err(e) => {
                    error!("Failed to encode outgoing message: {}", e);
                    continue;
                }
            };

            if let Outgoing::Chunk(_) = &delivery.message {
                let mut receipt = delivery.receipt.and_then(|r| {
                    self.connections
                        .get(&r.to)
                        .map(|sender| sender.pending_ack(r.request_id))
                });
                for peer in &delivery.to {
                    let receipt = receipt.take();
                    match self.connections.get(peer) {
                        Some(conn) => {
                            if let Err(e) = conn.send_chunk(frame.clone(), receipt) {
                                warn!("{}", e);
                            }
                        }
                        None => {
                            debug!("No connection for {}, dropping chunk", peer.short());
                            if let Some(receipt) = receipt {
                                receipt.refuse(ErrorCode::PeerUnavailable, "Recipient disconnected");
                            }
                        }
                    }
                }
                continue;
            }

            for peer in &delivery.to {
                match self.connections.get(peer) {
                    Some(conn) => {
                        if let Err(e) = conn.send(frame.clone()) {
                            warn!("{}", e);
                        }
                    }
                    None => debug!("No connection for {}, dropping", peer.short()),
                }
            }
        }
    }

    /// Close every connection.
    pub fn close_all(&mut self) {
        for (_, mut conn) in self.connections.drain() {
            conn.close();
        }
    }

    pub fn peer_count(&self) -> usize {
        self.connections.len()
    }
}
