//! share-relay: the rendezvous and fallback relay for ephemeral file sharing,
//! and the peer-side client that talks to it.
//!
//! - [`relay::serve`] runs the relay loop over a bound listener
//! - [`client::RelayClient`] connects a peer and exposes the relay as a
//!   transfer path

pub mod client;
pub mod config;
pub mod connection;
pub mod relay;
pub mod server;
pub mod timer;

pub use client::{ClientError, ClientEvent, GroupInfo, RelayChannel, RelayClient};
pub use config::{Args, ConfigError, RelayConfig};
pub use relay::serve;
pub use server::{RelayServer, ServerEvent};
