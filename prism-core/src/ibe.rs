//! The identity-based-encryption capability.
//!
//! User payloads are encrypted for a recipient *name*, so senders need no
//! per-recipient key exchange. The protocol treats the IBE primitive as an
//! abstract capability; this module defines the interface plus a KDF-based
//! development cipher good enough to run the full pipeline end to end.
//!
//! The development cipher derives each identity's private key from a system
//! root via HKDF. The registration committee holds the root; each committee
//! member can deterministically compute its own XOR shard of any identity
//! key, and a client combines all shards into the usable key. This is not a
//! pairing-based IBE and offers no security against the committee itself.

use aes_gcm::aead::Aead as _;
use aes_gcm::{Aes256Gcm, KeyInit as _, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;

use crate::make_nonce;

/// An IBE-encrypted payload as carried on the wire: the bulk ciphertext,
/// the wrapped message key, and the shared nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    /// AES-GCM ciphertext of the payload under the message key.
    pub ciphertext: Vec<u8>,
    /// The message key wrapped under the recipient's identity key.
    pub wrapped_key: Vec<u8>,
    /// Nonce used for both layers (the keys differ).
    pub nonce: Vec<u8>,
}

/// Errors from the IBE capability.
#[derive(Debug, thiserror::Error)]
pub enum IbeError {
    /// Decryption attempted before the private key was bootstrapped.
    #[error("no private key loaded")]
    NoPrivateKey,
    /// AEAD failure on either layer.
    #[error("cannot decrypt payload")]
    DecryptFailure,
}

fn hkdf_derive(root: &[u8], info: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(None, root);
    let mut out = [0u8; 32];
    hk.expand(info, &mut out)
        .expect("32 bytes is a valid hkdf length");
    out
}

/// The per-identity private key under the development scheme.
pub fn identity_key(public_params: &[u8], address: &str) -> [u8; 32] {
    hkdf_derive(public_params, format!("ibe-identity:{address}").as_bytes())
}

/// Shard `index` (of `count`) of an identity key. Shards XOR to the key and
/// are deterministic, so independent committee members agree without
/// coordination.
pub fn identity_key_shard(
    public_params: &[u8],
    address: &str,
    index: usize,
    count: usize,
) -> [u8; 32] {
    let key = identity_key(public_params, address);
    if index + 1 < count {
        return hkdf_derive(
            public_params,
            format!("ibe-shard:{index}:{count}:{address}").as_bytes(),
        );
    }
    // The last shard absorbs the XOR of all the deterministic ones.
    let mut last = key;
    for i in 0..count.saturating_sub(1) {
        let shard = hkdf_derive(
            public_params,
            format!("ibe-shard:{i}:{count}:{address}").as_bytes(),
        );
        for (byte, s) in last.iter_mut().zip(shard) {
            *byte ^= s;
        }
    }
    last
}

/// The client-side IBE handle: always able to encrypt, able to decrypt once
/// the private key has been bootstrapped from the registration committee.
#[derive(Clone)]
pub struct IbeCipher {
    /// The identity this handle decrypts for.
    pub name: String,
    public_params: Vec<u8>,
    private_key: Option<[u8; 32]>,
}

impl std::fmt::Debug for IbeCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IbeCipher")
            .field("name", &self.name)
            .field("can_decrypt", &self.can_decrypt())
            .finish()
    }
}

impl IbeCipher {
    /// Load a handle. `private_key` is `None` before bootstrap.
    pub fn load(
        name: impl Into<String>,
        private_key: Option<Vec<u8>>,
        public_params: Vec<u8>,
    ) -> Self {
        Self {
            name: name.into(),
            public_params,
            private_key: private_key.and_then(|k| k.as_slice().try_into().ok()),
        }
    }

    /// Whether decryption is possible yet.
    pub fn can_decrypt(&self) -> bool {
        self.private_key.is_some()
    }

    /// Encrypt `plaintext` for whoever holds `address`'s identity key.
    pub fn encrypt(&self, address: &str, plaintext: &[u8]) -> EncryptedPayload {
        let nonce = make_nonce();
        let mut message_key = [0u8; 32];
        {
            use rand::RngCore as _;
            rand::thread_rng().fill_bytes(&mut message_key);
        }

        let bulk = Aes256Gcm::new_from_slice(&message_key).expect("32-byte key");
        let ciphertext = bulk
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .expect("aes-gcm encryption is infallible");

        let id_key = identity_key(&self.public_params, address);
        let wrap = Aes256Gcm::new_from_slice(&id_key).expect("32-byte key");
        let wrapped_key = wrap
            .encrypt(Nonce::from_slice(&nonce), message_key.as_slice())
            .expect("aes-gcm encryption is infallible");

        EncryptedPayload {
            ciphertext,
            wrapped_key,
            nonce,
        }
    }

    /// Decrypt a payload addressed to this handle's identity.
    pub fn decrypt(&self, payload: &EncryptedPayload) -> Result<Vec<u8>, IbeError> {
        let private = self.private_key.ok_or(IbeError::NoPrivateKey)?;
        let wrap = Aes256Gcm::new_from_slice(&private).expect("32-byte key");
        let message_key = wrap
            .decrypt(
                Nonce::from_slice(&payload.nonce),
                payload.wrapped_key.as_slice(),
            )
            .map_err(|_| IbeError::DecryptFailure)?;
        let bulk = Aes256Gcm::new_from_slice(&message_key).map_err(|_| IbeError::DecryptFailure)?;
        bulk.decrypt(
            Nonce::from_slice(&payload.nonce),
            payload.ciphertext.as_slice(),
        )
        .map_err(|_| IbeError::DecryptFailure)
    }

    /// Combine the key shards received from the registration committee into
    /// the usable private key.
    pub fn load_private_shards<I>(&mut self, shards: I)
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        let mut key = [0u8; 32];
        let mut any = false;
        for shard in shards {
            if shard.len() != 32 {
                tracing::warn!("ignoring malformed IBE key shard");
                continue;
            }
            any = true;
            for (byte, s) in key.iter_mut().zip(shard) {
                *byte ^= s;
            }
        }
        if any {
            self.private_key = Some(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let params = b"system root".to_vec();
        let sender = IbeCipher::load("alice", None, params.clone());
        let payload = sender.encrypt("bob", b"hello bob");

        let key = identity_key(&params, "bob");
        let bob = IbeCipher::load("bob", Some(key.to_vec()), params);
        assert_eq!(bob.decrypt(&payload).unwrap(), b"hello bob");
    }

    #[test]
    fn wrong_identity_cannot_decrypt() {
        let params = b"system root".to_vec();
        let sender = IbeCipher::load("alice", None, params.clone());
        let payload = sender.encrypt("bob", b"hello bob");

        let key = identity_key(&params, "carol");
        let carol = IbeCipher::load("carol", Some(key.to_vec()), params);
        assert!(matches!(
            carol.decrypt(&payload),
            Err(IbeError::DecryptFailure)
        ));
    }

    #[test]
    fn shards_combine_into_the_identity_key() {
        let params = b"system root".to_vec();
        let shards: Vec<Vec<u8>> = (0..3)
            .map(|i| identity_key_shard(&params, "bob", i, 3).to_vec())
            .collect();

        let mut bob = IbeCipher::load("bob", None, params.clone());
        assert!(!bob.can_decrypt());
        bob.load_private_shards(shards);
        assert!(bob.can_decrypt());

        let sender = IbeCipher::load("alice", None, params);
        let payload = sender.encrypt("bob", b"bootstrap works");
        assert_eq!(bob.decrypt(&payload).unwrap(), b"bootstrap works");
    }
}
