//! The user-visible form of a message, before onion wrapping and after
//! reassembly.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::message::{MsgType, PrismMessage};

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A cleartext message between two named users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearText {
    /// Recipient name.
    pub receiver: String,
    /// Sender name.
    pub sender: String,
    /// Text payload, when the message is human-readable.
    #[serde(default)]
    pub message: Option<String>,
    /// Binary payload, when the message carries protocol bytes (IBE
    /// bootstrap requests travel this way).
    #[serde(default)]
    pub message_bytes: Option<Vec<u8>>,
    /// Random nonce distinguishing otherwise-identical messages.
    pub nonce: Vec<u8>,
    /// Send time, seconds since the UNIX epoch.
    pub timestamp: u64,
    /// Receive time, filled in on the receiving side.
    #[serde(default)]
    pub receive_time: Option<u64>,
    /// Whether the payload should be IBE-encrypted for the receiver.
    /// Protocol-internal sends (already-encrypted payloads) set this false.
    #[serde(default = "default_true")]
    pub use_ibe: bool,
}

fn default_true() -> bool {
    true
}

impl ClearText {
    /// A text message from `sender` to `receiver`.
    pub fn new(sender: impl Into<String>, receiver: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            receiver: receiver.into(),
            sender: sender.into(),
            message: Some(message.into()),
            message_bytes: None,
            nonce: rand_nonce(),
            timestamp: now_secs(),
            receive_time: None,
            use_ibe: true,
        }
    }

    /// Total payload length in bytes.
    pub fn len(&self) -> usize {
        self.message.as_ref().map_or(0, String::len)
            + self.message_bytes.as_ref().map_or(0, Vec::len)
    }

    /// Whether there is any payload at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wrap as a USER_MESSAGE wire record.
    pub fn to_wire(&self) -> PrismMessage {
        PrismMessage {
            name: Some(self.sender.clone()),
            messagetext: self.message.clone(),
            ciphertext: self.message_bytes.clone(),
            nonce: Some(self.nonce.clone()),
            origination_timestamp: Some(self.timestamp),
            ..PrismMessage::new(MsgType::UserMessage)
        }
    }

    /// Rebuild from a USER_MESSAGE the given receiver decrypted.
    pub fn from_wire(message: &PrismMessage, receiver: impl Into<String>) -> Option<Self> {
        if message.msg_type != MsgType::UserMessage {
            return None;
        }
        Some(Self {
            receiver: receiver.into(),
            sender: message.name.clone()?,
            message: message.messagetext.clone(),
            message_bytes: message.ciphertext.clone(),
            nonce: message.nonce.clone().unwrap_or_default(),
            timestamp: message.origination_timestamp.unwrap_or_default(),
            receive_time: None,
            use_ibe: true,
        })
    }
}

fn rand_nonce() -> Vec<u8> {
    use rand::RngCore as _;
    let mut nonce = vec![0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip() {
        let clear = ClearText::new("alice", "bob", "hello");
        let wire = clear.to_wire();
        let back = ClearText::from_wire(&wire, "bob").unwrap();
        assert_eq!(back.sender, "alice");
        assert_eq!(back.message.as_deref(), Some("hello"));
        assert_eq!(back.nonce, clear.nonce);
    }
}
