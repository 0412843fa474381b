/// Mesh node: wires transport, dispatcher and onboarding together.
///
/// The node owns one identity. Transport links and data channels both end
/// up as dispatcher peers; the onboarding machine decides how far each one
/// is trusted.
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::ToSocketAddrs;
use tokio::sync::{broadcast, mpsc};

use quorum_transport::{Direction, Dispatch, Identity, PeerHash, PublicIdentity, Transport};

use crate::cache::ReplayCache;
use crate::config::MeshConfig;
use crate::dispatcher::{Dispatcher, HandlerTable, Trust};
use crate::event::MeshEvent;
use crate::message::MessageHandler;
use crate::onboarding::Onboarding;
use crate::rtc::PeerConnectionFactory;
use crate::signal::{Signal, SignalType};
use crate::QuorumProtocolError;

/// Bridges upgraded transport links into the dispatcher.
struct LinkDispatch {
    dispatcher: Arc<Dispatcher>,
    allowed: Arc<Mutex<HashSet<PeerHash>>>,
}

impl Dispatch for LinkDispatch {
    fn dispatch(
        &self,
        remote: PublicIdentity,
        direction: Direction,
        inbound: mpsc::Receiver<Bytes>,
    ) -> mpsc::Receiver<Bytes> {
        let peer = remote.hash();
        // We chose our entrypoint; whoever dials us must be vouched for.
        let trust = match direction {
            Direction::Outbound => Trust::Member,
            Direction::Inbound if self.allowed.lock().contains(&peer) => Trust::Member,
            Direction::Inbound => Trust::Pending,
        };
        self.dispatcher.dispatch(peer, trust, inbound)
    }
}

pub struct MeshNode {
    identity: Arc<Identity>,
    dispatcher: Arc<Dispatcher>,
    onboarding: Arc<Onboarding>,
    transport: Transport,
    allowed: Arc<Mutex<HashSet<PeerHash>>>,
}

impl MeshNode {
    /// Start a node with a fresh identity.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: MeshConfig,
        rtc: Arc<dyn PeerConnectionFactory>,
    ) -> Result<Self, QuorumProtocolError> {
        Self::start_with_identity(Arc::new(Identity::generate()), config, rtc)
    }

    pub fn start_with_identity(
        identity: Arc<Identity>,
        config: MeshConfig,
        rtc: Arc<dyn PeerConnectionFactory>,
    ) -> Result<Self, QuorumProtocolError> {
        config.validate()?;
        config.transport.validate()?;

        let cache = Arc::new(ReplayCache::new(
            config.replay_buckets,
            config.replay_bucket_size,
        ));
        let onboarding = Onboarding::new(identity.clone(), rtc, &config);

        let mut handlers = HandlerTable::new();
        onboarding.register(&mut handlers);
        MessageHandler::register(&mut handlers);

        let dispatcher = Dispatcher::start(identity.hash(), cache, handlers, &config);
        let allowed = Arc::new(Mutex::new(HashSet::new()));
        let transport = Transport::new(
            identity.clone(),
            config.transport.clone(),
            Arc::new(LinkDispatch {
                dispatcher: dispatcher.clone(),
                allowed: allowed.clone(),
            }),
        );

        tracing::info!(
            founder = config.founder,
            "Mesh node {} started",
            identity.hash()
        );
        Ok(Self {
            identity,
            dispatcher,
            onboarding,
            transport,
            allowed,
        })
    }

    pub fn id(&self) -> PeerHash {
        self.identity.hash()
    }

    pub fn public(&self) -> &PublicIdentity {
        self.identity.public()
    }

    // ── Links ───────────────────────────────────────────────────────

    /// Accept inbound links on `addr`. Returns the bound address.
    pub async fn listen(&self, addr: impl ToSocketAddrs) -> Result<SocketAddr, QuorumProtocolError> {
        Ok(self.transport.listen(addr).await?)
    }

    /// Dial an entrypoint. The link is a member link on our side.
    pub async fn attach(&self, addr: SocketAddr) -> Result<PeerHash, QuorumProtocolError> {
        let remote = self.transport.attach(addr).await?;
        Ok(remote.hash())
    }

    /// Upgrade an arbitrary byte stream into a link.
    pub async fn connect_stream<S>(
        &self,
        stream: S,
        direction: Direction,
    ) -> Result<PeerHash, QuorumProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let remote = self.transport.upgrade(stream, direction).await?;
        Ok(remote.hash())
    }

    /// Let inbound links from `peer` join as members straight away.
    pub fn trust(&self, peer: PeerHash) {
        self.allowed.lock().insert(peer);
    }

    // ── Onboarding ──────────────────────────────────────────────────

    /// Broadcast `NeedNewbieInvite` through our gateway.
    pub fn seek_admission(&self) -> Result<(), QuorumProtocolError> {
        self.ensure_running()?;
        if self.is_admitted() {
            tracing::debug!("Already admitted, not seeking");
            return Ok(());
        }
        self.dispatcher.send(&self.onboarding.seek_signal());
        Ok(())
    }

    /// Ask other members for more direct links.
    pub fn request_links(&self) -> Result<(), QuorumProtocolError> {
        self.ensure_running()?;
        if !self.is_admitted() {
            return Err(QuorumProtocolError::malformed(
                "only admitted members can request links",
            ));
        }
        self.dispatcher.send(&self.onboarding.top_up_signal());
        Ok(())
    }

    pub fn is_admitted(&self) -> bool {
        self.onboarding.is_admitted()
    }

    /// Newbies this node is currently gateway for.
    pub fn pending_admissions(&self) -> usize {
        self.onboarding.pending_admissions()
    }

    // ── Messages and events ─────────────────────────────────────────

    /// Send application bytes to `to`, or to everyone with
    /// [`PeerHash::BROADCAST`].
    pub fn send_message(
        &self,
        to: PeerHash,
        payload: impl Into<Bytes>,
    ) -> Result<(), QuorumProtocolError> {
        self.ensure_running()?;
        self.dispatcher
            .send(&Signal::new(SignalType::Message, self.id(), to, payload));
        Ok(())
    }

    pub fn subscribe(&self, kind: SignalType) -> mpsc::Receiver<Signal> {
        self.dispatcher.subscribe(kind)
    }

    pub fn events(&self) -> broadcast::Receiver<MeshEvent> {
        self.dispatcher.events()
    }

    pub fn is_member(&self, peer: &PeerHash) -> bool {
        self.dispatcher.is_member(peer)
    }

    pub fn members(&self) -> Vec<PeerHash> {
        self.dispatcher.members()
    }

    pub fn peer_count(&self) -> usize {
        self.dispatcher.peer_count()
    }

    pub fn disconnect(&self, peer: PeerHash) -> bool {
        self.dispatcher.disconnect(peer)
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Close every link and data channel and stop all tasks.
    pub async fn shutdown(&self) {
        self.transport.shutdown();
        self.dispatcher.shutdown();
        self.onboarding.shutdown().await;
        tracing::info!("Mesh node {} shut down", self.id());
    }

    fn ensure_running(&self) -> Result<(), QuorumProtocolError> {
        if self.dispatcher.is_shut_down() {
            return Err(QuorumProtocolError::Shutdown);
        }
        Ok(())
    }
}
