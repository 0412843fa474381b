/// Hybrid encryption between two static identities.
///
/// Each message gets a fresh random 256-bit content key. The message is
/// sealed under that key with XChaCha20-Poly1305, and the content key is
/// sealed the same way under a wrapping key derived by HKDF-SHA256 from
/// the X25519 shared secret of sender and recipient.
///
/// Layout: `sealed content key (72) ‖ sealed message (24 + n + 16)`, where
/// every sealed block is `nonce (24) ‖ ciphertext ‖ tag (16)`.
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519Secret};

use crate::{Identity, PublicIdentity, QuorumTransportError};

/// HKDF info string for domain separation.
const HKDF_INFO: &[u8] = b"quorum-mesh-content-key-wrap-v1";

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;
pub const CHECKSUM_LEN: usize = 32;

/// Size of the sealed content key at the front of every ciphertext.
pub const SEALED_KEY_LEN: usize = NONCE_LEN + KEY_LEN + TAG_LEN;

/// Smallest valid ciphertext (empty plaintext).
pub const MIN_CIPHERTEXT_LEN: usize = SEALED_KEY_LEN + NONCE_LEN + TAG_LEN;

/// Derive the 32-byte wrapping key from an X25519 agreement.
fn wrapping_key(
    secret: &X25519Secret,
    public: &X25519PublicKey,
) -> Result<[u8; KEY_LEN], QuorumTransportError> {
    let shared = secret.diffie_hellman(public);
    if !shared.was_contributory() {
        return Err(QuorumTransportError::Crypto(
            "non-contributory key agreement".into(),
        ));
    }
    let hkdf = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut key = [0u8; KEY_LEN];
    hkdf.expand(HKDF_INFO, &mut key)
        .map_err(|e| QuorumTransportError::Crypto(format!("key derivation failed: {e}")))?;
    Ok(key)
}

/// Seal `plaintext` under `key` with a random nonce: `nonce ‖ ciphertext`.
fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>, QuorumTransportError> {
    use chacha20poly1305::aead::rand_core::{OsRng, RngCore};

    let cipher = XChaCha20Poly1305::new(&(*key).into());

    // Random 24-byte nonce (safe for random generation with XChaCha20)
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from(nonce_bytes);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| QuorumTransportError::Crypto(format!("encryption failed: {e}")))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Reverse of [`seal`].
fn open(key: &[u8; KEY_LEN], sealed: &[u8]) -> Result<Vec<u8>, QuorumTransportError> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(QuorumTransportError::Decrypt("truncated input".into()));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = XChaCha20Poly1305::new(&(*key).into());
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| QuorumTransportError::Decrypt("authentication error".into()))
}

/// Encrypt `plaintext` from `sender` to `recipient`.
pub fn encrypt(
    plaintext: &[u8],
    sender: &Identity,
    recipient: &PublicIdentity,
) -> Result<Vec<u8>, QuorumTransportError> {
    use chacha20poly1305::aead::rand_core::{OsRng, RngCore};

    let mut content_key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut content_key);

    let wrap = wrapping_key(sender.ecdh_secret(), recipient.ecdh_key())?;
    let sealed_key = seal(&wrap, &content_key)?;
    let sealed_message = seal(&content_key, plaintext)?;

    let mut out = sealed_key;
    out.extend_from_slice(&sealed_message);
    Ok(out)
}

/// Decrypt a ciphertext produced by [`encrypt`] from `sender` to `recipient`.
pub fn decrypt(
    ciphertext: &[u8],
    recipient: &Identity,
    sender: &PublicIdentity,
) -> Result<Vec<u8>, QuorumTransportError> {
    if ciphertext.len() < MIN_CIPHERTEXT_LEN {
        return Err(QuorumTransportError::Decrypt(format!(
            "ciphertext is {} bytes, need at least {MIN_CIPHERTEXT_LEN}",
            ciphertext.len()
        )));
    }
    let (sealed_key, sealed_message) = ciphertext.split_at(SEALED_KEY_LEN);

    let wrap = wrapping_key(recipient.ecdh_secret(), sender.ecdh_key())?;
    let content_key: [u8; KEY_LEN] = open(&wrap, sealed_key)?
        .try_into()
        .map_err(|_| QuorumTransportError::Decrypt("content key has wrong length".into()))?;

    open(&content_key, sealed_message)
}

/// `N` bytes from the OS RNG.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    use chacha20poly1305::aead::rand_core::{OsRng, RngCore};

    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

/// SHA-256 over `data`.
pub fn checksum(data: &[u8]) -> [u8; CHECKSUM_LEN] {
    Sha256::digest(data).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Generate a deterministic identity from a seed.
    fn identity(seed: u64) -> Identity {
        use rand::{RngCore, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let mut ecdh = [0u8; 32];
        let mut signing = [0u8; 32];
        rng.fill_bytes(&mut ecdh);
        rng.fill_bytes(&mut signing);
        Identity::from_secret_bytes(ecdh, signing)
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let alice = identity(1);
        let bob = identity(2);
        let plaintext = b"Hello from the mesh!";

        let encrypted = encrypt(plaintext, &alice, bob.public()).unwrap();
        let decrypted = decrypt(&encrypted, &bob, alice.public()).unwrap();

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn encrypt_decrypt_empty_payload() {
        let alice = identity(3);
        let bob = identity(4);
        let encrypted = encrypt(b"", &alice, bob.public()).unwrap();
        assert_eq!(encrypted.len(), MIN_CIPHERTEXT_LEN);
        let decrypted = decrypt(&encrypted, &bob, alice.public()).unwrap();
        assert!(decrypted.is_empty());
    }

    #[test]
    fn ciphertext_overhead() {
        let alice = identity(5);
        let bob = identity(6);
        let plaintext = b"test payload";
        let encrypted = encrypt(plaintext, &alice, bob.public()).unwrap();
        assert_eq!(encrypted.len(), MIN_CIPHERTEXT_LEN + plaintext.len());
    }

    #[test]
    fn wrong_recipient_fails() {
        let alice = identity(7);
        let bob = identity(8);
        let eve = identity(9);

        let encrypted = encrypt(b"secret", &alice, bob.public()).unwrap();
        assert!(decrypt(&encrypted, &eve, alice.public()).is_err());
    }

    #[test]
    fn wrong_sender_fails() {
        let alice = identity(10);
        let bob = identity(11);
        let eve = identity(12);

        let encrypted = encrypt(b"secret", &alice, bob.public()).unwrap();
        assert!(decrypt(&encrypted, &bob, eve.public()).is_err());
    }

    #[test]
    fn tampered_sealed_key_fails() {
        let alice = identity(13);
        let bob = identity(14);
        let mut encrypted = encrypt(b"secret", &alice, bob.public()).unwrap();
        encrypted[NONCE_LEN + 1] ^= 0xFF;
        assert!(matches!(
            decrypt(&encrypted, &bob, alice.public()),
            Err(QuorumTransportError::Decrypt(_))
        ));
    }

    #[test]
    fn tampered_message_fails() {
        let alice = identity(15);
        let bob = identity(16);
        let mut encrypted = encrypt(b"secret", &alice, bob.public()).unwrap();
        let last = encrypted.len() - 1;
        encrypted[last] ^= 0x01;
        assert!(decrypt(&encrypted, &bob, alice.public()).is_err());
    }

    #[test]
    fn truncated_input_fails() {
        let alice = identity(17);
        let bob = identity(18);
        let encrypted = encrypt(b"secret", &alice, bob.public()).unwrap();
        assert!(decrypt(&encrypted[..MIN_CIPHERTEXT_LEN - 1], &bob, alice.public()).is_err());
    }

    #[test]
    fn different_encryptions_differ() {
        let alice = identity(19);
        let bob = identity(20);
        let e1 = encrypt(b"same message", &alice, bob.public()).unwrap();
        let e2 = encrypt(b"same message", &alice, bob.public()).unwrap();
        assert_ne!(e1, e2);
    }

    #[test]
    fn agreement_is_symmetric() {
        let alice = identity(21);
        let bob = identity(22);
        let ab = wrapping_key(alice.ecdh_secret(), bob.public().ecdh_key()).unwrap();
        let ba = wrapping_key(bob.ecdh_secret(), alice.public().ecdh_key()).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn random_bytes_are_fresh() {
        let a: [u8; 26] = random_bytes();
        let b: [u8; 26] = random_bytes();
        assert_ne!(a, b);
    }

    #[test]
    fn checksum_is_sha256() {
        assert_eq!(
            hex::encode(checksum(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
