/// Secure Channel Codec.
///
/// Write: hybrid-encrypt, prepend signature over the ciphertext, prepend
/// checksum over `signature ‖ ciphertext`, length-prefix (u16 LE).
/// Read: the mirror, failing hard at the first mismatch.
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::crypto::{self, CHECKSUM_LEN, MIN_CIPHERTEXT_LEN};
use crate::{Identity, PublicIdentity, QuorumTransportError, SIGNATURE_LEN};

/// Bytes a frame adds on top of the plaintext it carries.
pub const FRAME_OVERHEAD: usize = CHECKSUM_LEN + SIGNATURE_LEN + MIN_CIPHERTEXT_LEN;

/// Frames one authenticated, encrypted link between `local` and `remote`.
pub struct SecureCodec {
    local: Arc<Identity>,
    remote: PublicIdentity,
    frames: LengthDelimitedCodec,
    max_frame_len: usize,
}

impl SecureCodec {
    pub fn new(local: Arc<Identity>, remote: PublicIdentity, max_frame_len: usize) -> Self {
        let max_frame_len = max_frame_len.min(u16::MAX as usize);
        let frames = LengthDelimitedCodec::builder()
            .length_field_length(2)
            .little_endian()
            .max_frame_length(max_frame_len)
            .new_codec();
        Self {
            local,
            remote,
            frames,
            max_frame_len,
        }
    }

    pub fn remote(&self) -> &PublicIdentity {
        &self.remote
    }

    /// Run the write pipeline, without the length prefix.
    pub fn seal(&self, payload: &[u8]) -> Result<Vec<u8>, QuorumTransportError> {
        let ciphertext = crypto::encrypt(payload, &self.local, &self.remote)?;
        let signature = self.local.sign(&ciphertext);

        let mut signed = Vec::with_capacity(SIGNATURE_LEN + ciphertext.len());
        signed.extend_from_slice(&signature);
        signed.extend_from_slice(&ciphertext);

        let mut frame = Vec::with_capacity(CHECKSUM_LEN + signed.len());
        frame.extend_from_slice(&crypto::checksum(&signed));
        frame.extend_from_slice(&signed);
        Ok(frame)
    }

    /// Run the read pipeline on one frame body.
    pub fn open(&self, frame: &[u8]) -> Result<Vec<u8>, QuorumTransportError> {
        if frame.len() < FRAME_OVERHEAD {
            return Err(QuorumTransportError::FrameTooShort {
                size: frame.len(),
                min: FRAME_OVERHEAD,
            });
        }

        let (sum, signed) = frame.split_at(CHECKSUM_LEN);
        if crypto::checksum(signed) != sum {
            return Err(QuorumTransportError::ChecksumMismatch);
        }

        let (signature, ciphertext) = signed.split_at(SIGNATURE_LEN);
        self.remote.verify(ciphertext, signature)?;

        crypto::decrypt(ciphertext, &self.local, &self.remote)
    }
}

impl Decoder for SecureCodec {
    type Item = Bytes;
    type Error = QuorumTransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, Self::Error> {
        match self.frames.decode(src)? {
            Some(frame) => Ok(Some(Bytes::from(self.open(&frame)?))),
            None => Ok(None),
        }
    }
}

impl Encoder<Bytes> for SecureCodec {
    type Error = QuorumTransportError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = self.seal(&item)?;
        if frame.len() > self.max_frame_len {
            return Err(QuorumTransportError::FrameTooLarge {
                size: frame.len(),
                max: self.max_frame_len,
            });
        }
        self.frames.encode(Bytes::from(frame), dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (SecureCodec, SecureCodec) {
        let alice = Arc::new(Identity::from_secret_bytes([1; 32], [2; 32]));
        let bob = Arc::new(Identity::from_secret_bytes([3; 32], [4; 32]));
        let a = SecureCodec::new(alice.clone(), *bob.public(), u16::MAX as usize);
        let b = SecureCodec::new(bob, *alice.public(), u16::MAX as usize);
        (a, b)
    }

    #[test]
    fn encode_decode_roundtrip() {
        let (mut alice, mut bob) = pair();
        let mut wire = BytesMut::new();
        alice.encode(Bytes::from_static(b"hello"), &mut wire).unwrap();

        let len = u16::from_le_bytes([wire[0], wire[1]]) as usize;
        assert_eq!(len, wire.len() - 2);
        assert_eq!(len, FRAME_OVERHEAD + 5);

        let decoded = bob.decode(&mut wire).unwrap().unwrap();
        assert_eq!(&decoded[..], b"hello");
        assert!(wire.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let (mut alice, mut bob) = pair();
        let mut wire = BytesMut::new();
        alice.encode(Bytes::from_static(b"split"), &mut wire).unwrap();

        let mut first = wire.split_to(10);
        assert!(bob.decode(&mut first).unwrap().is_none());
        first.unsplit(wire);
        assert_eq!(&bob.decode(&mut first).unwrap().unwrap()[..], b"split");
    }

    #[test]
    fn tampered_checksum_is_rejected() {
        let (alice, bob) = pair();
        let mut frame = alice.seal(b"payload").unwrap();
        frame[0] ^= 0x01;
        assert!(matches!(
            bob.open(&frame),
            Err(QuorumTransportError::ChecksumMismatch)
        ));
    }

    #[test]
    fn tampered_ciphertext_fails_signature() {
        let (alice, bob) = pair();
        let mut frame = alice.seal(b"payload").unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        // Recompute the checksum so tampering reaches the signature stage.
        let sum = crypto::checksum(&frame[CHECKSUM_LEN..]);
        frame[..CHECKSUM_LEN].copy_from_slice(&sum);
        assert!(matches!(
            bob.open(&frame),
            Err(QuorumTransportError::InvalidSignature)
        ));
    }

    #[test]
    fn frame_from_wrong_sender_fails_signature() {
        let (alice, _bob) = pair();
        let carol = Arc::new(Identity::from_secret_bytes([5; 32], [6; 32]));
        let frame = alice.seal(b"payload").unwrap();
        let receiver = SecureCodec::new(carol.clone(), *carol.public(), u16::MAX as usize);
        assert!(receiver.open(&frame).is_err());
    }

    #[test]
    fn short_frame_is_rejected() {
        let (_alice, bob) = pair();
        assert!(matches!(
            bob.open(&[0u8; 10]),
            Err(QuorumTransportError::FrameTooShort { size: 10, .. })
        ));
    }

    #[test]
    fn oversized_payload_is_refused_on_encode() {
        let alice = Arc::new(Identity::from_secret_bytes([1; 32], [2; 32]));
        let bob = Identity::from_secret_bytes([3; 32], [4; 32]);
        let mut codec = SecureCodec::new(alice, *bob.public(), 512);
        let mut wire = BytesMut::new();
        let result = codec.encode(Bytes::from(vec![0u8; 512]), &mut wire);
        assert!(matches!(
            result,
            Err(QuorumTransportError::FrameTooLarge { max: 512, .. })
        ));
        assert!(wire.is_empty());
    }

    #[test]
    fn oversized_frame_on_the_wire_is_an_error() {
        let alice = Arc::new(Identity::from_secret_bytes([1; 32], [2; 32]));
        let bob = Identity::from_secret_bytes([3; 32], [4; 32]);
        let mut codec = SecureCodec::new(alice, *bob.public(), 512);
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&1000u16.to_le_bytes());
        wire.extend_from_slice(&[0u8; 1000]);
        assert!(codec.decode(&mut wire).is_err());
    }
}
