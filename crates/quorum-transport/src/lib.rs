//! Quorum mesh transport layer.
//!
//! Turns a raw byte-stream into an authenticated, confidential, ordered
//! message channel: a 64-byte key handshake, then length-prefixed frames
//! that each carry `checksum ‖ signature ‖ hybrid ciphertext`.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use tokio::sync::mpsc;
//! use quorum_transport::{Direction, Dispatch, Identity, PublicIdentity, Transport, TransportConfig};
//!
//! struct Echo;
//!
//! impl Dispatch for Echo {
//!     fn dispatch(
//!         &self,
//!         _remote: PublicIdentity,
//!         _direction: Direction,
//!         inbound: mpsc::Receiver<Bytes>,
//!     ) -> mpsc::Receiver<Bytes> {
//!         // Echo every inbound message straight back.
//!         let (tx, rx) = mpsc::channel(16);
//!         let mut inbound = inbound;
//!         tokio::spawn(async move {
//!             while let Some(msg) = inbound.recv().await {
//!                 if tx.send(msg).await.is_err() {
//!                     break;
//!                 }
//!             }
//!         });
//!         rx
//!     }
//! }
//!
//! # async fn example() -> Result<(), quorum_transport::QuorumTransportError> {
//! let identity = Arc::new(Identity::generate());
//! let transport = Transport::new(identity, TransportConfig::new(), Arc::new(Echo));
//! let addr = transport.listen("127.0.0.1:0").await?;
//! println!("listening on {addr}");
//! transport.shutdown();
//! # Ok(())
//! # }
//! ```

mod codec;
mod config;
mod connection;
pub mod crypto;
mod error;
mod handshake;
mod identity;
mod node;

pub use codec::{SecureCodec, FRAME_OVERHEAD};
pub use config::TransportConfig;
pub use connection::{Direction, Dispatch};
pub use error::QuorumTransportError;
pub use handshake::handshake;
pub use identity::{Identity, PublicIdentity, HANDSHAKE_LEN, PUBLIC_KEY_LEN, SIGNATURE_LEN};
pub use node::Transport;

use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Mesh address of a node: SHA-256 of its X25519 public key.
///
/// Displayed and parsed as lowercase hex. The all-zero value is reserved
/// as the broadcast placeholder.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerHash([u8; 32]);

impl PeerHash {
    /// Width of a hash on the wire.
    pub const LEN: usize = 32;

    /// Reserved recipient meaning "every member".
    pub const BROADCAST: PeerHash = PeerHash([0u8; 32]);

    /// Wrap raw hash bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hash an X25519 public key into a mesh address.
    pub fn of_key(ecdh_public: &[u8; 32]) -> Self {
        Self(Sha256::digest(ecdh_public).into())
    }

    /// Read a hash from the first 32 bytes of `bytes`.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; 32] = bytes.get(..Self::LEN)?.try_into().ok()?;
        Some(Self(raw))
    }

    /// The raw 32 bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for PeerHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_broadcast() {
            return write!(f, "PeerHash(broadcast)");
        }
        let hex = hex::encode(&self.0[..6]);
        write!(f, "PeerHash({hex}...)")
    }
}

impl FromStr for PeerHash {
    type Err = QuorumTransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut raw = [0u8; 32];
        hex::decode_to_slice(s, &mut raw)
            .map_err(|_| QuorumTransportError::InvalidPeerHash(s.to_string()))?;
        Ok(Self(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_hash_hex_roundtrip() {
        let hash = PeerHash::of_key(&[7u8; 32]);
        let parsed: PeerHash = hash.to_string().parse().unwrap();
        assert_eq!(parsed, hash);
        assert_eq!(hash.to_string().len(), 64);
    }

    #[test]
    fn peer_hash_rejects_bad_hex() {
        assert!("zz".parse::<PeerHash>().is_err());
        assert!("abcd".parse::<PeerHash>().is_err());
    }

    #[test]
    fn broadcast_is_all_zero() {
        assert!(PeerHash::BROADCAST.is_broadcast());
        assert!(!PeerHash::of_key(&[0u8; 32]).is_broadcast());
        assert_eq!(format!("{:?}", PeerHash::BROADCAST), "PeerHash(broadcast)");
    }

    #[test]
    fn from_slice_needs_32_bytes() {
        assert!(PeerHash::from_slice(&[1u8; 31]).is_none());
        let hash = PeerHash::from_slice(&[1u8; 40]).unwrap();
        assert_eq!(hash.as_bytes(), &[1u8; 32]);
    }
}
