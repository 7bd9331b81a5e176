//! The relay event loop.
//!
//! One task owns the [`Hub`] and applies every event in arrival order:
//! new connections, decoded frames, disconnects and join-window timers.

use crate::config::RelayConfig;
use crate::server::{RelayServer, ServerEvent};
use crate::timer::TokioJoinWindowScheduler;
use anyhow::Result;
use share_core::{ChatRelay, Hub, SystemClock};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Run the relay on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    config: RelayConfig,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let (scheduler, mut timer_rx) = TokioJoinWindowScheduler::new();
    let mut hub = Hub::new(Arc::new(SystemClock), scheduler)
        .with_join_window_limits(config.default_join_window, config.max_join_window)
        .with_chat(ChatRelay::new(config.max_chat_len));
    let mut server = RelayServer::new().with_queue_limit(config.max_queued_bytes);

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => server.accept_connection(stream, addr),
                    Err(e) => error!("Failed to accept connection: {}", e),
                }
            }

            Some(event) = server.poll_event() => {
                let deliveries = match event {
                    ServerEvent::Connected(peer) => hub.connect(peer),
                    ServerEvent::Message { from, message } => hub.handle(from, message),
                    ServerEvent::Chunk { from, frame } => hub.handle_chunk(from, frame),
                    ServerEvent::Disconnected(peer) => hub.disconnect(peer),
                };
                server.deliver(deliveries);
            }

            Some(code) = timer_rx.recv() => {
                let deliveries = hub.join_window_elapsed(&code);
                server.deliver(deliveries);
            }

            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!(
        "Closing {} connection(s), {} group(s) and {} relay transfer(s) discarded",
        server.peer_count(),
        hub.groups().len(),
        hub.open_transfers()
    );
    server.close_all();
    Ok(())
}
