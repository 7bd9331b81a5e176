//! Sending side of a transfer: path selection, chunking, flow control and
//! progress reporting.
//!
//! Transfers to the same peer are serialized; transfers to different peers
//! run independently.

use super::channel::{PeerChannel, TransferFrame};
use super::events::{Direction, EventBus, TransferEvent};
use super::rate::RateMeter;
use super::{percent, FileId, FileMeta, PathKind, PathTuning, TransferConfig, TransferError};
use crate::clock::Clock;
use crate::PeerId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

/// Available paths to one target.
#[derive(Clone)]
pub struct Route {
    pub target: PeerId,
    pub direct: Option<Arc<dyn PeerChannel>>,
    pub relay: Option<Arc<dyn PeerChannel>>,
}

impl Route {
    pub fn relay_only(target: PeerId, relay: Arc<dyn PeerChannel>) -> Self {
        Self {
            target,
            direct: None,
            relay: Some(relay),
        }
    }

    /// Prefer an open direct channel, then an open relay channel.
    pub fn select(&self) -> Result<Arc<dyn PeerChannel>, TransferError> {
        [&self.direct, &self.relay]
            .into_iter()
            .flatten()
            .find(|channel| channel.is_open())
            .cloned()
            .ok_or(TransferError::ChannelNotReady(self.target))
    }
}

/// What the caller wants to send. Bytes come from a separate reader.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
}

/// Per-target outcome of a fan-out send.
#[derive(Debug)]
pub struct FanOut {
    pub file_id: FileId,
    pub outcomes: Vec<(PeerId, Result<(), TransferError>)>,
}

struct Leg {
    target: PeerId,
    channel: Arc<dyn PeerChannel>,
    tuning: PathTuning,
    sent: u64,
    rate: RateMeter,
    meta_sent: bool,
    error: Option<TransferError>,
}

impl Leg {
    fn is_live(&self) -> bool {
        self.error.is_none()
    }
}

pub struct TransferCoordinator {
    config: TransferConfig,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    pair_locks: Mutex<HashMap<PeerId, Arc<tokio::sync::Mutex<()>>>>,
}

impl TransferCoordinator {
    pub fn new(config: TransferConfig, events: Arc<EventBus>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            events,
            clock,
            pair_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Send one file to one peer over the best available path.
    ///
    /// Fails immediately with `ChannelNotReady` when no path is open.
    pub async fn send_file<R>(
        &self,
        route: &Route,
        file: OutgoingFile,
        reader: R,
    ) -> Result<FileId, TransferError>
    where
        R: AsyncRead + Unpin + Send,
    {
        route.select()?;
        let FanOut { file_id, outcomes } =
            self.send_to_many(std::slice::from_ref(route), file, reader).await;
        match outcomes.into_iter().next() {
            Some((_, Err(e))) => Err(e),
            _ => Ok(file_id),
        }
    }

    /// Send one file to several peers, reading the source once.
    ///
    /// Every target gets the same chunks in lockstep. A target whose channel
    /// fails is dropped; the rest carry on.
    pub async fn send_to_many<R>(&self, routes: &[Route], file: OutgoingFile, mut reader: R) -> FanOut
    where
        R: AsyncRead + Unpin + Send,
    {
        let file_id = FileId::generate();
        let mut outcomes = Vec::new();
        let mut legs = Vec::new();

        for route in routes {
            match route.select() {
                Ok(channel) => {
                    let tuning = self.config.tuning(channel.path());
                    legs.push(Leg {
                        target: route.target,
                        channel,
                        tuning,
                        sent: 0,
                        rate: RateMeter::new(self.config.rate_interval, self.clock.now_ms()),
                        meta_sent: false,
                        error: None,
                    });
                }
                Err(e) => outcomes.push((route.target, Err(e))),
            }
        }

        if legs.is_empty() {
            return FanOut { file_id, outcomes };
        }

        let _guards = self.lock_targets(&legs).await;

        let chunk_bytes = legs
            .iter()
            .map(|leg| leg.tuning.chunk_bytes)
            .min()
            .unwrap_or(self.config.relay.chunk_bytes)
            .max(1);
        let meta = FileMeta {
            file_id: file_id.clone(),
            name: file.name,
            size: file.size,
            mime_type: file.mime_type,
            chunk_bytes: chunk_bytes as u32,
        };
        let relay_delay = self.config.relay_chunk_delay;

        info!(
            "Sending {} ({} bytes) to {} peer(s) as {}",
            meta.name,
            meta.size,
            legs.len(),
            file_id
        );

        for leg in legs.iter_mut() {
            self.events.emit(TransferEvent::Started {
                direction: Direction::Send,
                peer: leg.target,
                file_id: file_id.clone(),
                name: meta.name.clone(),
                size: meta.size,
                path: Some(leg.channel.path()),
            });
            match leg.channel.send(TransferFrame::Meta(meta.clone())).await {
                Ok(()) => leg.meta_sent = true,
                Err(e) => self.fail(leg, &file_id, e).await,
            }
        }

        let mut buf = vec![0u8; chunk_bytes];
        let mut read_total: u64 = 0;
        let mut seq: u32 = 0;

        while legs.iter().any(Leg::is_live) {
            let n = match read_chunk(&mut reader, &mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    for leg in legs.iter_mut().filter(|l| l.is_live()) {
                        self.fail(leg, &file_id, TransferError::Source(e.to_string())).await;
                    }
                    break;
                }
            };
            if n == 0 {
                break;
            }

            read_total += n as u64;
            if read_total > meta.size {
                for leg in legs.iter_mut().filter(|l| l.is_live()) {
                    let err = TransferError::SizeMismatch {
                        expected: meta.size,
                        actual: read_total,
                    };
                    self.fail(leg, &file_id, err).await;
                }
                break;
            }

            for leg in legs.iter_mut().filter(|l| l.is_live()) {
                if let Err(e) = self.push_chunk(leg, &file_id, seq, &buf[..n], meta.size).await {
                    self.fail(leg, &file_id, e).await;
                }
            }
            seq += 1;

            let via_relay = legs
                .iter()
                .any(|l| l.is_live() && l.channel.path() == PathKind::Relay);
            if via_relay && !relay_delay.is_zero() {
                tokio::time::sleep(relay_delay).await;
            }
        }

        for leg in legs.iter_mut().filter(|l| l.is_live()) {
            if leg.sent != meta.size {
                let err = TransferError::SizeMismatch {
                    expected: meta.size,
                    actual: leg.sent,
                };
                self.fail(leg, &file_id, err).await;
                continue;
            }
            let complete = TransferFrame::Complete {
                file_id: file_id.clone(),
            };
            match leg.channel.send(complete).await {
                Ok(()) => {
                    debug!("Sent {} to {}", file_id, leg.target.short());
                    self.events.emit(TransferEvent::Completed {
                        direction: Direction::Send,
                        peer: leg.target,
                        file_id: file_id.clone(),
                        bytes: leg.sent,
                    });
                }
                Err(e) => self.fail(leg, &file_id, e).await,
            }
        }

        for leg in legs {
            let result = match leg.error {
                Some(e) => Err(e),
                None => Ok(()),
            };
            outcomes.push((leg.target, result));
        }
        FanOut { file_id, outcomes }
    }

    /// Hand one chunk to a leg's channel, waiting out backpressure first.
    async fn push_chunk(
        &self,
        leg: &mut Leg,
        file_id: &FileId,
        seq: u32,
        data: &[u8],
        total: u64,
    ) -> Result<(), TransferError> {
        if leg.channel.buffered_amount() > leg.tuning.high_watermark {
            debug!(
                "Backpressure on {} ({} buffered), waiting for {}",
                leg.target.short(),
                leg.channel.buffered_amount(),
                leg.tuning.low_watermark
            );
            leg.channel
                .wait_buffered_at_most(leg.tuning.low_watermark)
                .await?;
        }

        leg.channel
            .send(TransferFrame::Chunk {
                file_id: file_id.clone(),
                seq,
                data: data.to_vec(),
            })
            .await?;
        leg.sent += data.len() as u64;

        self.events.emit(TransferEvent::Progress {
            direction: Direction::Send,
            peer: leg.target,
            file_id: file_id.clone(),
            bytes: leg.sent,
            total,
            percent: percent(leg.sent, total),
        });
        if let Some(bytes_per_sec) = leg.rate.record(data.len() as u64, self.clock.now_ms()) {
            self.events.emit(TransferEvent::Rate {
                direction: Direction::Send,
                peer: leg.target,
                file_id: file_id.clone(),
                bytes_per_sec,
            });
        }
        Ok(())
    }

    /// Stop a leg: tell the receiver (best effort) and surface the abort.
    async fn fail(&self, leg: &mut Leg, file_id: &FileId, err: TransferError) {
        let reason = err.reason();
        warn!(
            "Transfer {} to {} aborted: {}",
            file_id,
            leg.target.short(),
            err
        );
        if leg.meta_sent && leg.channel.is_open() {
            let abort = TransferFrame::Abort {
                file_id: file_id.clone(),
                reason: reason.clone(),
            };
            if let Err(e) = leg.channel.send(abort).await {
                debug!("Could not deliver abort for {}: {}", file_id, e);
            }
        }
        self.events.emit(TransferEvent::Aborted {
            direction: Direction::Send,
            peer: leg.target,
            file_id: file_id.clone(),
            reason,
        });
        leg.error = Some(err);
    }

    /// Take the per-peer locks for every target, in a stable order.
    async fn lock_targets(&self, legs: &[Leg]) -> Vec<tokio::sync::OwnedMutexGuard<()>> {
        let mut targets: Vec<PeerId> = legs.iter().map(|l| l.target).collect();
        targets.sort();
        targets.dedup();

        let locks: Vec<_> = {
            let mut map = self.pair_locks.lock().unwrap_or_else(|e| e.into_inner());
            targets
                .iter()
                .map(|t| Arc::clone(map.entry(*t).or_default()))
                .collect()
        };

        let mut guards = Vec::with_capacity(locks.len());
        for lock in locks {
            guards.push(lock.lock_owned().await);
        }
        guards
    }
}

/// Fill `buf` from `reader`, stopping early only at end of input.
async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
