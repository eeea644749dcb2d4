//! X25519 half-keys: the key-agreement halves carried in ARKs, polls, and
//! encrypted envelopes.

use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use prism_types::message::HalfKeyMap;

/// Errors from key agreement.
#[derive(Debug, thiserror::Error)]
pub enum HalfKeyError {
    /// Public bytes of the wrong length or algorithm.
    #[error("unusable half-key")]
    BadPublicKey,
}

const KDF_INFO: &[u8] = b"prism halfkey v0";

/// The private half of an X25519 exchange.
#[derive(Clone)]
pub struct PrivateHalfKey {
    secret: StaticSecret,
}

impl std::fmt::Debug for PrivateHalfKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print secret material.
        f.write_str("PrivateHalfKey(..)")
    }
}

impl PrivateHalfKey {
    /// Generate a fresh key pair.
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(rand::rngs::OsRng),
        }
    }

    /// The wire form of the public half.
    pub fn public(&self) -> HalfKeyMap {
        HalfKeyMap::ecdh(PublicKey::from(&self.secret).as_bytes().to_vec())
    }

    /// Run the exchange against a peer's public half and derive a 32-byte
    /// symmetric key via HKDF-SHA256.
    pub fn exchange(&self, peer: &HalfKeyMap) -> Result<[u8; 32], HalfKeyError> {
        let bytes: [u8; 32] = peer
            .public
            .as_slice()
            .try_into()
            .map_err(|_| HalfKeyError::BadPublicKey)?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(bytes));
        let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut key = [0u8; 32];
        hk.expand(KDF_INFO, &mut key)
            .expect("32 bytes is a valid hkdf length");
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_derive_the_same_key() {
        let a = PrivateHalfKey::generate();
        let b = PrivateHalfKey::generate();
        assert_eq!(
            a.exchange(&b.public()).unwrap(),
            b.exchange(&a.public()).unwrap()
        );
    }

    #[test]
    fn rejects_malformed_public() {
        let a = PrivateHalfKey::generate();
        let bad = HalfKeyMap::ecdh(vec![1, 2, 3]);
        assert!(a.exchange(&bad).is_err());
    }
}
