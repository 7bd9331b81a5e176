//! PeerId: connection-scoped identifier for a peer on the relay.
//!
//! A PeerId lives exactly as long as one network connection. It is never
//! persisted; a reconnecting device receives a fresh one. Displays as a
//! 16-character hex string.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PeerIdError {
    #[error("Invalid peer ID format: expected 16 hex chars")]
    InvalidFormat,
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] std::num::ParseIntError),
}

/// Opaque identifier for one connected peer.
///
/// Used as the addressing key for roster entries, group membership and
/// relay targets.
///
/// # Examples
/// ```
/// use share_core::PeerId;
///
/// let peer_id = PeerId::generate();
/// let parsed: PeerId = peer_id.to_string().parse().unwrap();
/// assert_eq!(peer_id, parsed);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

impl PeerId {
    /// Generate a new random peer ID. Never returns zero.
    pub fn generate() -> Self {
        use rand::Rng;
        loop {
            let id: u64 = rand::rng().random();
            if id != 0 {
                return Self(id);
            }
        }
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// First six hex chars, for log lines and display labels.
    pub fn short(&self) -> String {
        let mut s = self.to_string();
        s.truncate(6);
        s
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == 16 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            let id =
                u64::from_str_radix(&s.to_ascii_lowercase(), 16).map_err(PeerIdError::InvalidHex)?;
            return Ok(Self(id));
        }
        Err(PeerIdError::InvalidFormat)
    }
}

impl From<u64> for PeerId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

// Serialize as hex string so JSON clients can treat it as opaque text
impl serde::Serialize for PeerId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for PeerId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
