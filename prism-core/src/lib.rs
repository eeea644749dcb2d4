#![deny(missing_docs)]
//! Cryptographic core of the PRISM anonymous messaging system.
//!
//! This crate carries everything below the network layer:
//!
//! * [`sharing`] — the secret-sharing algebra (Shamir, Feldman, and
//!   full-threshold) over `Z_p`, including chunked byte sharing and the
//!   Beaver-triple reconstruction step used by MPC multiplication.
//! * [`halfkey`] / [`envelope`] — X25519 half-keys and the AES-256-GCM
//!   envelope every nested wire message is sealed with.
//! * [`ibe`] — the identity-based-encryption capability used for
//!   end-to-end user payloads, with a KDF-based development cipher.
//! * [`pseudonym`] — `SHA-256(salt ∥ name)` recipient pseudonyms and
//!   dropbox shard derivation.
//! * [`vrf`] — the sortition distribution and the signature-based VRF that
//!   assigns roles per epoch.
//! * [`cert`] — the toy root-signed certificate chain and ARK
//!   signing/verification.

pub mod cert;
pub mod envelope;
pub mod field;
pub mod halfkey;
pub mod ibe;
pub mod pseudonym;
pub mod sharing;
pub mod vrf;

pub use halfkey::PrivateHalfKey;
pub use pseudonym::Pseudonym;
pub use sharing::Sharing;

/// A fresh 12-byte AEAD nonce.
pub fn make_nonce() -> Vec<u8> {
    use rand::RngCore as _;
    let mut nonce = vec![0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// A fresh 32-byte operation / fragment identifier.
pub fn random_id() -> Vec<u8> {
    use rand::RngCore as _;
    let mut id = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut id);
    id
}
