//! The AES-256-GCM envelope nested wire messages are sealed with.
//!
//! Encryption runs a fresh X25519 exchange against the recipient's
//! announced half-key; the ephemeral public half travels alongside the
//! ciphertext so the recipient can re-derive the symmetric key. Decryption
//! failures are recovered locally (drop and log), never propagated as
//! protocol errors.

use aes_gcm::aead::Aead as _;
use aes_gcm::{Aes256Gcm, KeyInit as _, Nonce};

use prism_types::message::{CipherKind, HalfKeyMap, MsgType, PrismMessage};

use crate::halfkey::PrivateHalfKey;
use crate::make_nonce;

/// Seal raw bytes for `peer` under a fresh exchange with `private`.
pub fn encrypt_data(
    plaintext: &[u8],
    private: &PrivateHalfKey,
    peer: &HalfKeyMap,
    nonce: &[u8],
) -> Option<Vec<u8>> {
    let key = private.exchange(peer).ok()?;
    let cipher = Aes256Gcm::new_from_slice(&key).expect("32-byte key");
    cipher.encrypt(Nonce::from_slice(nonce), plaintext).ok()
}

/// Seal a nested message for `peer`.
pub fn encrypt(
    message: &PrismMessage,
    private: &PrivateHalfKey,
    peer: &HalfKeyMap,
    nonce: &[u8],
) -> Option<Vec<u8>> {
    encrypt_data(&message.encode(), private, peer, nonce)
}

/// Open the ciphertext of an encrypted wire message. The sender's public
/// half is taken from the message itself unless `peer` overrides it.
pub fn decrypt_data(
    encrypted: &PrismMessage,
    private: &PrivateHalfKey,
    peer: Option<&HalfKeyMap>,
) -> Option<Vec<u8>> {
    let peer = peer.or(encrypted.half_key.as_ref())?;
    let (ciphertext, nonce) = match (&encrypted.ciphertext, &encrypted.nonce) {
        (Some(c), Some(n)) => (c, n),
        _ => return None,
    };
    let key = private.exchange(peer).ok()?;
    let cipher = Aes256Gcm::new_from_slice(&key).expect("32-byte key");
    match cipher.decrypt(Nonce::from_slice(nonce), ciphertext.as_slice()) {
        Ok(plaintext) => Some(plaintext),
        Err(_) => {
            tracing::debug!("cannot decrypt {:?} envelope", encrypted.msg_type);
            None
        }
    }
}

/// Open and decode a nested message.
pub fn decrypt(
    encrypted: &PrismMessage,
    private: &PrivateHalfKey,
    peer: Option<&HalfKeyMap>,
) -> Option<PrismMessage> {
    let plaintext = decrypt_data(encrypted, private, peer)?;
    match PrismMessage::decode(&plaintext) {
        Ok(message) => Some(message),
        Err(err) => {
            tracing::debug!("decrypted payload is not a wire message: {err}");
            None
        }
    }
}

/// Wrap `inner` in an encrypted envelope of the given outer type, using a
/// fresh ephemeral key against `peer`.
pub fn wrap_encrypted(
    msg_type: MsgType,
    inner: &PrismMessage,
    peer: &HalfKeyMap,
) -> Option<PrismMessage> {
    let ephemeral = PrivateHalfKey::generate();
    let nonce = make_nonce();
    let ciphertext = encrypt(inner, &ephemeral, peer, &nonce)?;
    Some(PrismMessage {
        cipher: Some(CipherKind::AesGcm),
        ciphertext: Some(ciphertext),
        half_key: Some(ephemeral.public()),
        nonce: Some(nonce),
        ..PrismMessage::new(msg_type)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_and_open() {
        let recipient = PrivateHalfKey::generate();
        let inner = PrismMessage {
            messagetext: Some("onion layer".into()),
            ..PrismMessage::new(MsgType::UserMessage)
        };
        let wrapped =
            wrap_encrypted(MsgType::EncryptEmixMessage, &inner, &recipient.public()).unwrap();
        assert_eq!(wrapped.msg_type, MsgType::EncryptEmixMessage);
        let opened = decrypt(&wrapped, &recipient, None).unwrap();
        assert_eq!(opened, inner);
    }

    #[test]
    fn tampered_ciphertext_fails_closed() {
        let recipient = PrivateHalfKey::generate();
        let inner = PrismMessage::new(MsgType::UserMessage);
        let mut wrapped =
            wrap_encrypted(MsgType::EncryptDropboxMessage, &inner, &recipient.public()).unwrap();
        wrapped.ciphertext.as_mut().unwrap()[0] ^= 0xff;
        assert!(decrypt(&wrapped, &recipient, None).is_none());
    }

    #[test]
    fn wrong_key_fails_closed() {
        let recipient = PrivateHalfKey::generate();
        let other = PrivateHalfKey::generate();
        let inner = PrismMessage::new(MsgType::UserMessage);
        let wrapped =
            wrap_encrypted(MsgType::EncryptPeerMessage, &inner, &recipient.public()).unwrap();
        assert!(decrypt(&wrapped, &other, None).is_none());
    }
}
