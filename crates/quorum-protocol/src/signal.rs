/// Signal wire format.
///
/// `nonce (16) ‖ type (1) ‖ author (32) ‖ recipient (32) ‖ payload`.
/// The nonce only feeds duplicate suppression; it carries no crypto meaning.
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

use quorum_transport::PeerHash;

use crate::QuorumProtocolError;

pub const NONCE_LEN: usize = 16;
/// Bytes before the payload.
pub const HEADER_LEN: usize = NONCE_LEN + 1 + 2 * PeerHash::LEN;

pub type Nonce = [u8; NONCE_LEN];

/// Closed set of signal types. Codes outside `1..=11` never parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SignalType {
    NeedInvite = 1,
    NeedNewbieInvite = 2,
    ReadyToInviteNewbie = 3,
    ReadyToInvite = 4,
    WaitOffer = 5,
    WaitAnswer = 6,
    Answer = 7,
    ConnectionSecret = 8,
    ConnectionProof = 9,
    Trusted = 10,
    Message = 11,
}

impl SignalType {
    pub const ALL: [SignalType; 11] = [
        SignalType::NeedInvite,
        SignalType::NeedNewbieInvite,
        SignalType::ReadyToInviteNewbie,
        SignalType::ReadyToInvite,
        SignalType::WaitOffer,
        SignalType::WaitAnswer,
        SignalType::Answer,
        SignalType::ConnectionSecret,
        SignalType::ConnectionProof,
        SignalType::Trusted,
        SignalType::Message,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            SignalType::NeedInvite => "NeedInvite",
            SignalType::NeedNewbieInvite => "NeedNewbieInvite",
            SignalType::ReadyToInviteNewbie => "ReadyToInviteNewbie",
            SignalType::ReadyToInvite => "ReadyToInvite",
            SignalType::WaitOffer => "WaitOffer",
            SignalType::WaitAnswer => "WaitAnswer",
            SignalType::Answer => "Answer",
            SignalType::ConnectionSecret => "ConnectionSecret",
            SignalType::ConnectionProof => "ConnectionProof",
            SignalType::Trusted => "Trusted",
            SignalType::Message => "Message",
        }
    }
}

impl TryFrom<u8> for SignalType {
    type Error = QuorumProtocolError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        SignalType::ALL
            .into_iter()
            .find(|kind| kind.code() == code)
            .ok_or(QuorumProtocolError::UnknownSignalType(code))
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One protocol message. Immutable once built.
#[derive(Clone, PartialEq, Eq)]
pub struct Signal {
    nonce: Nonce,
    kind: SignalType,
    author: PeerHash,
    recipient: PeerHash,
    payload: Bytes,
}

impl Signal {
    /// Build a signal with a fresh random nonce.
    pub fn new(
        kind: SignalType,
        author: PeerHash,
        recipient: PeerHash,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self::from_parts(
            uuid::Uuid::new_v4().into_bytes(),
            kind,
            author,
            recipient,
            payload,
        )
    }

    /// Build a signal addressed to every member.
    pub fn broadcast(kind: SignalType, author: PeerHash, payload: impl Into<Bytes>) -> Self {
        Self::new(kind, author, PeerHash::BROADCAST, payload)
    }

    /// Build a signal with an explicit nonce.
    pub fn from_parts(
        nonce: Nonce,
        kind: SignalType,
        author: PeerHash,
        recipient: PeerHash,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            nonce,
            kind,
            author,
            recipient,
            payload: payload.into(),
        }
    }

    pub fn nonce(&self) -> &Nonce {
        &self.nonce
    }

    pub fn kind(&self) -> SignalType {
        self.kind
    }

    pub fn author(&self) -> PeerHash {
        self.author
    }

    pub fn recipient(&self) -> PeerHash {
        self.recipient
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient.is_broadcast()
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_slice(&self.nonce);
        buf.put_u8(self.kind.code());
        buf.put_slice(self.author.as_bytes());
        buf.put_slice(self.recipient.as_bytes());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a signal. The payload shares `frame`'s buffer.
    pub fn decode(frame: Bytes) -> Result<Self, QuorumProtocolError> {
        if frame.len() < HEADER_LEN {
            return Err(QuorumProtocolError::malformed(format!(
                "{} bytes is shorter than the {HEADER_LEN}-byte header",
                frame.len()
            )));
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&frame[..NONCE_LEN]);
        let kind = SignalType::try_from(frame[NONCE_LEN])?;

        let author_at = NONCE_LEN + 1;
        let recipient_at = author_at + PeerHash::LEN;
        let author = PeerHash::from_slice(&frame[author_at..])
            .ok_or_else(|| QuorumProtocolError::malformed("truncated author"))?;
        let recipient = PeerHash::from_slice(&frame[recipient_at..])
            .ok_or_else(|| QuorumProtocolError::malformed("truncated recipient"))?;

        Ok(Self {
            nonce,
            kind,
            author,
            recipient,
            payload: frame.slice(HEADER_LEN..),
        })
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("kind", &self.kind)
            .field("author", &self.author)
            .field("recipient", &self.recipient)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: u8) -> PeerHash {
        PeerHash::from_bytes([byte; 32])
    }

    #[test]
    fn header_is_81_bytes() {
        assert_eq!(HEADER_LEN, 81);
        let signal = Signal::new(SignalType::Trusted, hash(1), hash(2), Bytes::new());
        assert_eq!(signal.encode().len(), 81);
    }

    #[test]
    fn encode_layout() {
        let signal = Signal::from_parts(
            [9; 16],
            SignalType::WaitOffer,
            hash(1),
            hash(2),
            Bytes::from_static(b"xyz"),
        );
        let wire = signal.encode();
        assert_eq!(&wire[..16], &[9; 16]);
        assert_eq!(wire[16], 5);
        assert_eq!(&wire[17..49], &[1; 32]);
        assert_eq!(&wire[49..81], &[2; 32]);
        assert_eq!(&wire[81..], b"xyz");

        let decoded = Signal::decode(wire).unwrap();
        assert_eq!(decoded, signal);
    }

    #[test]
    fn short_frame_is_malformed() {
        let result = Signal::decode(Bytes::from(vec![0u8; 80]));
        assert!(matches!(
            result,
            Err(QuorumProtocolError::MalformedSignal { .. })
        ));
    }

    #[test]
    fn unknown_types_are_rejected() {
        for code in [0u8, 12, 200, 255] {
            let mut wire = vec![0u8; HEADER_LEN];
            wire[NONCE_LEN] = code;
            assert!(matches!(
                Signal::decode(Bytes::from(wire)),
                Err(QuorumProtocolError::UnknownSignalType(c)) if c == code
            ));
        }
    }

    #[test]
    fn every_type_roundtrips_its_code() {
        for kind in SignalType::ALL {
            assert_eq!(SignalType::try_from(kind.code()).unwrap(), kind);
        }
        assert_eq!(SignalType::Message.code(), 11);
        assert_eq!(SignalType::NeedNewbieInvite.to_string(), "NeedNewbieInvite");
    }

    #[test]
    fn fresh_nonces_differ() {
        let a = Signal::broadcast(SignalType::Message, hash(1), Bytes::new());
        let b = Signal::broadcast(SignalType::Message, hash(1), Bytes::new());
        assert_ne!(a.nonce(), b.nonce());
        assert!(a.is_broadcast());
    }
}
