use crate::codec::SecureCodec;
use crate::config::TransportConfig;
use crate::connection::{spawn_link, Direction, Dispatch};
use crate::handshake::handshake;
use crate::{Identity, PublicIdentity, QuorumTransportError};

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

/// A quorum transport endpoint: accept, dial, upgrade.
///
/// Every stream it upgrades is handed to the [`Dispatch`] it was built
/// with. Cloning is cheap and every clone drives the same endpoint.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

struct Inner {
    identity: Arc<Identity>,
    config: TransportConfig,
    dispatch: Arc<dyn Dispatch>,
    shutdown: CancellationToken,
}

impl Transport {
    pub fn new(
        identity: Arc<Identity>,
        config: TransportConfig,
        dispatch: Arc<dyn Dispatch>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                identity,
                config,
                dispatch,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// This endpoint's keys.
    pub fn identity(&self) -> &Arc<Identity> {
        &self.inner.identity
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Handshake over `stream`, then start its reader and writer tasks.
    ///
    /// Works on any byte stream; TCP is just the common case. Returns the
    /// peer's public identity once the link is live.
    pub async fn upgrade<S>(
        &self,
        mut stream: S,
        direction: Direction,
    ) -> Result<PublicIdentity, QuorumTransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(QuorumTransportError::Shutdown);
        }

        let deadline = tokio::time::Instant::now() + inner.config.handshake_timeout;
        let remote = handshake(&mut stream, &inner.identity, deadline, &inner.shutdown).await?;

        let codec = SecureCodec::new(
            inner.identity.clone(),
            remote,
            inner.config.max_frame_len,
        );
        spawn_link(
            Framed::new(stream, codec),
            direction,
            inner.dispatch.as_ref(),
            inner.config.inbound_buffer,
            inner.shutdown.child_token(),
        );

        tracing::debug!(?direction, "Link up with {}", remote.hash());
        Ok(remote)
    }

    /// Bind a TCP listener and upgrade every accepted stream as inbound.
    ///
    /// Returns the bound address (useful with port 0). The accept loop runs
    /// until [`shutdown`](Self::shutdown).
    pub async fn listen(&self, addr: impl ToSocketAddrs) -> Result<SocketAddr, QuorumTransportError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(QuorumTransportError::Shutdown);
        }
        let listener = TcpListener::bind(addr)
            .await
            .map_err(QuorumTransportError::Bind)?;
        let local = listener.local_addr()?;
        tracing::info!("Listening on {local}");

        let transport = self.clone();
        tokio::spawn(async move { transport.accept_loop(listener).await });
        Ok(local)
    }

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer_addr)) => {
                    let _ = stream.set_nodelay(true);
                    let transport = self.clone();
                    // Handshakes run off the accept loop so one slow peer
                    // cannot stall the rest.
                    tokio::spawn(async move {
                        if let Err(e) = transport.upgrade(stream, Direction::Inbound).await {
                            tracing::warn!("Inbound link from {peer_addr} failed: {e}");
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!("Accept failed: {e}");
                }
            }
        }
        tracing::debug!("Accept loop stopped");
    }

    /// Dial `addr` over TCP and upgrade the stream as outbound.
    pub async fn attach(&self, addr: SocketAddr) -> Result<PublicIdentity, QuorumTransportError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(QuorumTransportError::Shutdown);
        }
        let stream = tokio::time::timeout(self.inner.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| QuorumTransportError::Connect {
                addr,
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
            })?
            .map_err(|source| QuorumTransportError::Connect { addr, source })?;
        let _ = stream.set_nodelay(true);
        self.upgrade(stream, Direction::Outbound).await
    }

    /// Stop accepting, abort pending handshakes, and close every link.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}
