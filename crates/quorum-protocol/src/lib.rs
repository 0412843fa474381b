//! Quorum mesh protocol layer.
//!
//! Flood-routed signals over authenticated transport links, with a
//! bounded replay cache and quorum admission: a newbie is trusted only
//! once enough existing members have each opened a direct data channel
//! to it and the newbie has proven so to its gateway.
//!
//! Wire format: fixed 81-byte signal header, then the payload.
//! Sealed payloads: X25519 + HKDF + XChaCha20-Poly1305, signed with Ed25519.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use quorum_protocol::{MeshConfig, MeshNode, MemoryRtc, SignalType};
//! use quorum_transport::PeerHash;
//!
//! # async fn example() -> Result<(), quorum_protocol::QuorumProtocolError> {
//! let rtc = Arc::new(MemoryRtc::new());
//! let node = MeshNode::start(MeshConfig::new().founder(true), rtc)?;
//! node.listen("127.0.0.1:0").await?;
//!
//! let mut inbox = node.subscribe(SignalType::Message);
//! node.send_message(PeerHash::BROADCAST, b"hello".to_vec())?;
//! # let _ = inbox.recv().await;
//! node.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
mod message;
pub mod node;
pub mod onboarding;
pub mod rtc;
pub mod signal;

pub use cache::ReplayCache;
pub use config::MeshConfig;
pub use dispatcher::{Dispatcher, HandlerTable, Inbound, SignalHandler, Trust};
pub use error::QuorumProtocolError;
pub use event::MeshEvent;
pub use node::MeshNode;
pub use onboarding::{Onboarding, PROOF_LEN, SECRET_LEN};
pub use rtc::memory::MemoryRtc;
pub use rtc::{ChannelEvent, PeerConnection, PeerConnectionFactory, SdpType, SessionDescription};
pub use signal::{Signal, SignalType, HEADER_LEN, NONCE_LEN};
