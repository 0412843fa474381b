use std::net::SocketAddr;

/// Errors returned by the quorum transport layer.
///
/// Every variant is fatal to the link that produced it and to nothing else.
#[derive(Debug, thiserror::Error)]
pub enum QuorumTransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind listener: {0}")]
    Bind(#[source] std::io::Error),

    #[error("connection to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("handshake deadline elapsed")]
    HandshakeTimeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("decryption failed: {0}")]
    Decrypt(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("frame too short: {size} bytes (min {min})")]
    FrameTooShort { size: usize, min: usize },

    #[error("transport is shut down")]
    Shutdown,

    #[error("invalid peer hash: {0}")]
    InvalidPeerHash(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}
