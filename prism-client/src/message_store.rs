//! Local log of sent and received cleartexts.

use parking_lot::Mutex;

use prism_types::cleartext::ClearText;

/// An append-only in-memory message log.
#[derive(Default)]
pub struct MessageStore {
    messages: Mutex<Vec<ClearText>>,
}

impl MessageStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message.
    pub fn record(&self, message: ClearText) {
        self.messages.lock().push(message);
    }

    /// Snapshot of everything recorded so far.
    pub fn messages(&self) -> Vec<ClearText> {
        self.messages.lock().clone()
    }

    /// Messages received from `sender`.
    pub fn from_sender(&self, sender: &str) -> Vec<ClearText> {
        self.messages
            .lock()
            .iter()
            .filter(|m| m.sender == sender)
            .cloned()
            .collect()
    }
}
