/// Protocol-level errors for the quorum mesh.
///
/// Wraps transport errors and adds protocol-specific variants
/// (signal parsing, crypto, WebRTC, serialization).
#[derive(Debug, thiserror::Error)]
pub enum QuorumProtocolError {
    #[error("transport error: {0}")]
    Transport(#[from] quorum_transport::QuorumTransportError),

    #[error("malformed signal: {reason}")]
    MalformedSignal { reason: String },

    #[error("unknown signal type: {0}")]
    UnknownSignalType(u8),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("webrtc error: {0}")]
    WebRtc(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("node is shut down")]
    Shutdown,
}

impl QuorumProtocolError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        QuorumProtocolError::MalformedSignal {
            reason: reason.into(),
        }
    }
}

impl From<rmp_serde::encode::Error> for QuorumProtocolError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        QuorumProtocolError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for QuorumProtocolError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        QuorumProtocolError::Deserialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_malformed_signal() {
        let err = QuorumProtocolError::malformed("shorter than header");
        assert_eq!(err.to_string(), "malformed signal: shorter than header");
    }

    #[test]
    fn test_display_unknown_type() {
        let err = QuorumProtocolError::UnknownSignalType(42);
        assert_eq!(err.to_string(), "unknown signal type: 42");
    }

    #[test]
    fn test_display_invalid_signature() {
        let err = QuorumProtocolError::InvalidSignature;
        assert_eq!(err.to_string(), "signature verification failed");
    }

    #[test]
    fn test_transport_error_wraps() {
        let err: QuorumProtocolError =
            quorum_transport::QuorumTransportError::HandshakeTimeout.into();
        assert_eq!(err.to_string(), "transport error: handshake deadline elapsed");
    }

    #[test]
    fn test_rmp_decode_error_converts() {
        let bad: Result<String, _> = rmp_serde::from_slice(&[0xc1]);
        let err: QuorumProtocolError = bad.unwrap_err().into();
        assert!(matches!(err, QuorumProtocolError::Deserialization(_)));
    }
}
