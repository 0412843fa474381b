/// Node identity: an X25519 key pair for agreement and an Ed25519 key pair
/// for signing. The mesh address is derived from the X25519 half only.
use curve25519_dalek::montgomery::MontgomeryPoint;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use std::fmt;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519Secret};

use crate::{PeerHash, QuorumTransportError};

/// Width of an X25519 or Ed25519 public key.
pub const PUBLIC_KEY_LEN: usize = 32;
/// Width of an Ed25519 signature.
pub const SIGNATURE_LEN: usize = 64;
/// Two public keys side by side.
pub const HANDSHAKE_LEN: usize = 2 * PUBLIC_KEY_LEN;

/// A node's private keys. Generated once per session, never serialized.
pub struct Identity {
    ecdh: X25519Secret,
    signing: SigningKey,
    public: PublicIdentity,
}

impl Identity {
    /// Generate fresh keys from the OS RNG.
    pub fn generate() -> Self {
        use chacha20poly1305::aead::rand_core::{OsRng, RngCore};

        let mut ecdh = [0u8; 32];
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut ecdh);
        OsRng.fill_bytes(&mut seed);
        Self::from_secret_bytes(ecdh, seed)
    }

    /// Rebuild an identity from raw secret material (X25519 scalar, Ed25519 seed).
    pub fn from_secret_bytes(ecdh: [u8; 32], signing_seed: [u8; 32]) -> Self {
        let ecdh = X25519Secret::from(ecdh);
        let signing = SigningKey::from_bytes(&signing_seed);
        let ecdh_public = X25519PublicKey::from(&ecdh);
        let public = PublicIdentity {
            hash: PeerHash::of_key(ecdh_public.as_bytes()),
            ecdh: ecdh_public,
            signing: signing.verifying_key(),
        };
        Self {
            ecdh,
            signing,
            public,
        }
    }

    pub fn public(&self) -> &PublicIdentity {
        &self.public
    }

    pub fn hash(&self) -> PeerHash {
        self.public.hash
    }

    /// Ed25519 signature over `message`.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing.sign(message).to_bytes()
    }

    pub(crate) fn ecdh_secret(&self) -> &X25519Secret {
        &self.ecdh
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("hash", &self.public.hash)
            .finish_non_exhaustive()
    }
}

/// The public half of an [`Identity`], as learned from a handshake or a
/// handshake-carrying signal.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicIdentity {
    ecdh: X25519PublicKey,
    signing: VerifyingKey,
    hash: PeerHash,
}

impl PublicIdentity {
    /// Validate and wrap raw public keys.
    ///
    /// Rejects Ed25519 bytes that do not decompress or that encode a weak
    /// (small-order) point, and X25519 bytes that map to a small-order point.
    pub fn from_keys(
        ecdh: [u8; PUBLIC_KEY_LEN],
        signing: [u8; PUBLIC_KEY_LEN],
    ) -> Result<Self, QuorumTransportError> {
        let signing = VerifyingKey::from_bytes(&signing).map_err(|e| {
            QuorumTransportError::InvalidPublicKey(format!("signing key: {e}"))
        })?;
        if signing.is_weak() {
            return Err(QuorumTransportError::InvalidPublicKey(
                "signing key is a small-order point".into(),
            ));
        }

        match MontgomeryPoint(ecdh).to_edwards(0) {
            Some(point) if !point.is_small_order() => {}
            _ => {
                return Err(QuorumTransportError::InvalidPublicKey(
                    "agreement key is not a usable curve point".into(),
                ))
            }
        }

        Ok(Self {
            ecdh: X25519PublicKey::from(ecdh),
            signing,
            hash: PeerHash::of_key(&ecdh),
        })
    }

    /// Parse the signal-payload layout: `X25519 pub ‖ Ed25519 pub`.
    pub fn from_handshake(bytes: &[u8]) -> Result<Self, QuorumTransportError> {
        if bytes.len() != HANDSHAKE_LEN {
            return Err(QuorumTransportError::InvalidPublicKey(format!(
                "handshake needs {HANDSHAKE_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut ecdh = [0u8; PUBLIC_KEY_LEN];
        let mut signing = [0u8; PUBLIC_KEY_LEN];
        ecdh.copy_from_slice(&bytes[..PUBLIC_KEY_LEN]);
        signing.copy_from_slice(&bytes[PUBLIC_KEY_LEN..HANDSHAKE_LEN]);
        Self::from_keys(ecdh, signing)
    }

    /// Encode in the signal-payload layout: `X25519 pub ‖ Ed25519 pub`.
    pub fn to_handshake(&self) -> [u8; HANDSHAKE_LEN] {
        let mut out = [0u8; HANDSHAKE_LEN];
        out[..PUBLIC_KEY_LEN].copy_from_slice(self.ecdh.as_bytes());
        out[PUBLIC_KEY_LEN..].copy_from_slice(self.signing.as_bytes());
        out
    }

    pub fn hash(&self) -> PeerHash {
        self.hash
    }

    pub fn ecdh_key(&self) -> &X25519PublicKey {
        &self.ecdh
    }

    pub fn signing_key(&self) -> &VerifyingKey {
        &self.signing
    }

    /// Verify an Ed25519 signature made by this identity over `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), QuorumTransportError> {
        let signature =
            Signature::from_slice(signature).map_err(|_| QuorumTransportError::InvalidSignature)?;
        self.signing
            .verify(message, &signature)
            .map_err(|_| QuorumTransportError::InvalidSignature)
    }
}

impl fmt::Debug for PublicIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicIdentity")
            .field("hash", &self.hash)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(seed: u8) -> Identity {
        Identity::from_secret_bytes([seed; 32], [seed.wrapping_add(100); 32])
    }

    #[test]
    fn hash_is_sha256_of_agreement_key() {
        let id = identity(1);
        assert_eq!(id.hash(), PeerHash::of_key(id.public().ecdh_key().as_bytes()));
    }

    #[test]
    fn handshake_layout_roundtrip() {
        let id = identity(2);
        let bytes = id.public().to_handshake();
        let parsed = PublicIdentity::from_handshake(&bytes).unwrap();
        assert_eq!(&parsed, id.public());
        assert_eq!(&bytes[..32], id.public().ecdh_key().as_bytes());
    }

    #[test]
    fn zero_agreement_key_is_rejected() {
        let id = identity(3);
        let result = PublicIdentity::from_keys([0u8; 32], *id.public().signing_key().as_bytes());
        assert!(matches!(result, Err(QuorumTransportError::InvalidPublicKey(_))));
    }

    #[test]
    fn weak_signing_key_is_rejected() {
        let id = identity(4);
        let result = PublicIdentity::from_keys(*id.public().ecdh_key().as_bytes(), [0u8; 32]);
        assert!(matches!(result, Err(QuorumTransportError::InvalidPublicKey(_))));
    }

    #[test]
    fn wrong_length_handshake_is_rejected() {
        assert!(PublicIdentity::from_handshake(&[1u8; 63]).is_err());
        let mut long = identity(8).public().to_handshake().to_vec();
        long.push(0);
        assert!(matches!(
            PublicIdentity::from_handshake(&long),
            Err(QuorumTransportError::InvalidPublicKey(_))
        ));
    }

    #[test]
    fn sign_verify() {
        let id = identity(5);
        let sig = id.sign(b"payload");
        assert!(id.public().verify(b"payload", &sig).is_ok());
        assert!(id.public().verify(b"tampered", &sig).is_err());
        assert!(id.public().verify(b"payload", &sig[..10]).is_err());
    }

    #[test]
    fn debug_hides_secrets() {
        let rendered = format!("{:?}", identity(6));
        assert!(rendered.starts_with("Identity { hash: PeerHash("));
    }
}
