/// WebRTC collaborator seam.
///
/// The mesh never drives ICE itself. It asks a [`PeerConnectionFactory`]
/// for connections, trades session descriptions through signals, and reads
/// the data channel through [`ChannelEvent`]s.
///
/// In production: an adapter over a real WebRTC stack.
/// In tests: [`memory::MemoryRtc`], which pairs connections in-process.
pub mod memory;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::QuorumProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SdpType {
    Offer,
    Answer,
}

/// An SDP blob and what it is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Data-channel lifecycle, in order: one `Open`, any number of
/// `Message`s, at most one `Close`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(Bytes),
    Close,
}

/// One peer connection with a single data channel.
#[async_trait::async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, QuorumProtocolError>;

    /// Requires the remote offer to be set first.
    async fn create_answer(&self) -> Result<SessionDescription, QuorumProtocolError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), QuorumProtocolError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), QuorumProtocolError>;

    /// The channel's event stream. Only the first call returns it.
    fn take_events(&self) -> Option<mpsc::Receiver<ChannelEvent>>;

    /// Send one message over the open data channel.
    async fn send(&self, data: Bytes) -> Result<(), QuorumProtocolError>;

    async fn close(&self);
}

#[async_trait::async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn PeerConnection>, QuorumProtocolError>;
}
