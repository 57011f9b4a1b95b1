//! Shared-secret derived keys for connection auth and session payload sealing.
//!
//! Session keys come from the shared secret: both peers derive the same group
//! key from it and the session id, and seal payloads with ChaCha20-Poly1305
//! before they leave the process. Anything holding the secret, the overlay
//! node included, can derive the same key.

use bytes::Bytes;
use parley_naming::Name;
use parley_wire::{open_aead, CodecError, CryptoParams, EncAlg, KEY_LEN, NONCE_LEN};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::SessionError;

/// Minimum accepted shared secret length in characters
pub const MIN_SECRET_LEN: usize = 32;

const HELLO_DOMAIN: &[u8] = b"parley-hello-v1";
const GROUP_DOMAIN: &[u8] = b"parley-group-v1";

/// Shared secret used to authorise connections and derive session keys
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret(String);

impl SharedSecret {
    /// Wrap a secret, rejecting ones shorter than [`MIN_SECRET_LEN`]
    pub fn new(secret: impl Into<String>) -> Result<Self, SessionError> {
        let secret = secret.into();
        if secret.chars().count() < MIN_SECRET_LEN {
            return Err(SessionError::InvalidSecret {
                min: MIN_SECRET_LEN,
            });
        }
        Ok(Self(secret))
    }

    fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

/// Proof a client sends in its HELLO for the node's challenge nonce
pub fn hello_proof(secret: &SharedSecret, nonce: &[u8], name: &Name) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(HELLO_DOMAIN);
    hasher.update(secret.as_bytes());
    hasher.update(nonce);
    hasher.update(name.to_string().as_bytes());
    hasher.finalize().into()
}

/// Fresh random challenge nonce
pub fn challenge_nonce() -> [u8; 32] {
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Per-session symmetric key shared by both peers
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct GroupKey {
    key: [u8; KEY_LEN],
    #[zeroize(skip)]
    session_id: u64,
}

impl GroupKey {
    /// Derive the key for `session_id`
    pub fn derive(secret: &SharedSecret, session_id: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(GROUP_DOMAIN);
        hasher.update(secret.as_bytes());
        hasher.update(session_id.to_be_bytes());
        Self {
            key: hasher.finalize().into(),
            session_id,
        }
    }

    /// Session this key belongs to
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Parameters for sealing one payload under a fresh random nonce
    pub fn seal_params(&self) -> CryptoParams {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        CryptoParams {
            enc_alg: EncAlg::Chacha20Poly1305,
            key: self.key,
            nonce,
            aad: self.aad(),
        }
    }

    /// Open a payload sealed by the peer
    pub fn open(&self, nonce: &[u8], cipher_and_tag: &[u8]) -> Result<Bytes, CodecError> {
        open_aead(
            EncAlg::Chacha20Poly1305,
            &self.key,
            nonce,
            &self.aad(),
            cipher_and_tag,
        )
    }

    fn aad(&self) -> Bytes {
        Bytes::copy_from_slice(&self.session_id.to_be_bytes())
    }
}

impl fmt::Debug for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupKey")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_wire::seal_aead;

    fn secret() -> SharedSecret {
        SharedSecret::new("demo-shared-secret-min-32-chars!!").unwrap()
    }

    #[test]
    fn test_short_secret_rejected() {
        assert_eq!(
            SharedSecret::new("too-short").unwrap_err(),
            SessionError::InvalidSecret { min: MIN_SECRET_LEN }
        );
    }

    #[test]
    fn test_hello_proof_binds_inputs() {
        let bob = Name::parse("org/bob/v1").unwrap();
        let alice = Name::parse("org/alice/v1").unwrap();
        let nonce = challenge_nonce();

        let proof = hello_proof(&secret(), &nonce, &bob);
        assert_eq!(proof, hello_proof(&secret(), &nonce, &bob));
        assert_ne!(proof, hello_proof(&secret(), &nonce, &alice));
        assert_ne!(proof, hello_proof(&secret(), &challenge_nonce(), &bob));

        let other = SharedSecret::new("another-shared-secret-of-32-chars!").unwrap();
        assert_ne!(proof, hello_proof(&other, &nonce, &bob));
    }

    #[test]
    fn test_group_key_is_per_session() {
        let a = GroupKey::derive(&secret(), 1);
        let b = GroupKey::derive(&secret(), 1);
        let c = GroupKey::derive(&secret(), 2);

        let params = a.seal_params();
        let sealed = seal_aead(params.enc_alg, &params.key, &params.nonce, &params.aad, b"42")
            .unwrap();

        assert_eq!(b.open(&params.nonce, &sealed).unwrap(), Bytes::from_static(b"42"));
        assert!(c.open(&params.nonce, &sealed).is_err());
    }
}
