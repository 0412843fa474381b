use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{Identity, PublicIdentity, QuorumTransportError, HANDSHAKE_LEN, PUBLIC_KEY_LEN};

/// Exchange public keys over a fresh stream.
///
/// Writes `Ed25519 pub ‖ X25519 pub` while concurrently reading the peer's
/// copy. Nothing here is authenticated; every later frame is signed and
/// verified against the keys learned here.
///
/// Fails with `HandshakeTimeout` when `deadline` has already passed or
/// passes first, with `Cancelled` when `cancel` fires, and with
/// `InvalidPublicKey` when the peer's bytes are not usable keys.
pub async fn handshake<S>(
    stream: &mut S,
    local: &Identity,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<PublicIdentity, QuorumTransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if cancel.is_cancelled() {
        return Err(QuorumTransportError::Cancelled);
    }
    if Instant::now() >= deadline {
        return Err(QuorumTransportError::HandshakeTimeout);
    }

    let mut ours = [0u8; HANDSHAKE_LEN];
    ours[..PUBLIC_KEY_LEN].copy_from_slice(local.public().signing_key().as_bytes());
    ours[PUBLIC_KEY_LEN..].copy_from_slice(local.public().ecdh_key().as_bytes());

    let exchange = async {
        let (mut reader, mut writer) = tokio::io::split(&mut *stream);
        let mut theirs = [0u8; HANDSHAKE_LEN];
        tokio::try_join!(
            async {
                writer.write_all(&ours).await?;
                writer.flush().await
            },
            reader.read_exact(&mut theirs),
        )?;
        Ok::<_, std::io::Error>(theirs)
    };

    let theirs = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(QuorumTransportError::Cancelled),
        result = tokio::time::timeout_at(deadline, exchange) => match result {
            Err(_) => return Err(QuorumTransportError::HandshakeTimeout),
            Ok(io) => io?,
        },
    };

    let mut signing = [0u8; PUBLIC_KEY_LEN];
    let mut ecdh = [0u8; PUBLIC_KEY_LEN];
    signing.copy_from_slice(&theirs[..PUBLIC_KEY_LEN]);
    ecdh.copy_from_slice(&theirs[PUBLIC_KEY_LEN..]);
    PublicIdentity::from_keys(ecdh, signing)
}
