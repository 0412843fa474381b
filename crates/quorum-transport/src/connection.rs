use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::codec::SecureCodec;
use crate::{PeerHash, PublicIdentity, QuorumTransportError};

/// Which side opened the underlying stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted by our listener.
    Inbound,
    /// Dialed by us.
    Outbound,
}

/// Hands an upgraded link to whatever routes its messages.
///
/// The transport feeds decrypted inbound messages into `inbound` and
/// writes whatever comes out of the returned receiver to the wire, in
/// order. Dropping the returned receiver's sender closes the link.
pub trait Dispatch: Send + Sync + 'static {
    fn dispatch(
        &self,
        remote: PublicIdentity,
        direction: Direction,
        inbound: mpsc::Receiver<Bytes>,
    ) -> mpsc::Receiver<Bytes>;
}

/// Split a framed stream into one reader task and one writer task.
///
/// Either task ending cancels `link`, which stops the other; the stream
/// is dropped once both are gone.
pub(crate) fn spawn_link<S>(
    framed: Framed<S, SecureCodec>,
    direction: Direction,
    dispatch: &dyn Dispatch,
    inbound_buffer: usize,
    link: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let remote = *framed.codec().remote();
    let peer = remote.hash();
    let (sink, stream) = framed.split();
    let (inbound_tx, inbound_rx) = mpsc::channel(inbound_buffer);
    let outbound = dispatch.dispatch(remote, direction, inbound_rx);

    tokio::spawn(read_loop(stream, inbound_tx, link.clone(), peer));
    tokio::spawn(write_loop(sink, outbound, link, peer));
}

async fn read_loop<St>(
    mut frames: St,
    inbound: mpsc::Sender<Bytes>,
    link: CancellationToken,
    peer: PeerHash,
) where
    St: futures_util::Stream<Item = Result<Bytes, QuorumTransportError>> + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = link.cancelled() => break,
            next = frames.next() => next,
        };
        match next {
            Some(Ok(message)) => {
                let delivered = tokio::select! {
                    _ = link.cancelled() => false,
                    sent = inbound.send(message) => sent.is_ok(),
                };
                if !delivered {
                    break;
                }
            }
            Some(Err(e)) => {
                tracing::warn!("Link to {peer} failed: {e}");
                break;
            }
            None => {
                tracing::debug!("Link to {peer} closed by remote");
                break;
            }
        }
    }
    link.cancel();
}

async fn write_loop<Si>(
    mut sink: Si,
    mut outbound: mpsc::Receiver<Bytes>,
    link: CancellationToken,
    peer: PeerHash,
) where
    Si: futures_util::Sink<Bytes, Error = QuorumTransportError> + Unpin,
{
    loop {
        let message = tokio::select! {
            _ = link.cancelled() => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        match sink.send(message).await {
            Ok(()) => {}
            // One oversized message is dropped; the link stays usable.
            Err(QuorumTransportError::FrameTooLarge { size, max }) => {
                tracing::warn!("Dropping {size}-byte frame to {peer} (max {max})");
            }
            Err(e) => {
                tracing::warn!("Write to {peer} failed: {e}");
                break;
            }
        }
    }
    let _ = sink.close().await;
    link.cancel();
}
