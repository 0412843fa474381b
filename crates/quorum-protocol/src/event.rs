use quorum_transport::PeerHash;

use crate::dispatcher::Trust;

/// Things a [`MeshNode`](crate::MeshNode) reports to its embedder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    /// A link was registered with the dispatcher.
    PeerConnected { peer: PeerHash, trust: Trust },
    /// A link was torn down (I/O failure, overflow, or explicit disconnect).
    PeerDisconnected(PeerHash),
    /// A pending link became a member link.
    PeerPromoted(PeerHash),
    /// We were the gateway and a newbie reached quorum.
    Admitted(PeerHash),
    /// This node received `Trusted` for itself.
    SelfAdmitted,
    /// A newbie we were gateway for ran out of time.
    AdmissionExpired(PeerHash),
}
