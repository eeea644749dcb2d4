//! Stored dropbox fragments.

use std::time::Instant;

use prism_types::share::Share;

/// One stored fragment: a pseudonym share and an opaque ciphertext share,
/// keyed by a random fragment id.
#[derive(Debug, Clone)]
pub struct Fragment {
    /// The 32-byte random id the leader assigned at store time.
    pub fragment_id: Vec<u8>,
    /// This peer's share of the recipient pseudonym.
    pub pseudonym_share: Share,
    /// This peer's packed column of ciphertext shares.
    pub ciphertext: Vec<u8>,
    /// When the fragment was stored; drives the orphan sweep.
    pub stored_at: Instant,
}

impl Fragment {
    /// Wrap freshly stored fragment data.
    pub fn new(fragment_id: Vec<u8>, pseudonym_share: Share, ciphertext: Vec<u8>) -> Self {
        Self {
            fragment_id,
            pseudonym_share,
            ciphertext,
            stored_at: Instant::now(),
        }
    }

    /// The placeholder standing in for a fragment this peer does not hold.
    /// Its dummy share poisons any arithmetic done with it, which the
    /// opening side detects as an unopenable column.
    pub fn dummy() -> Self {
        Self {
            fragment_id: Vec::new(),
            pseudonym_share: Share::dummy(),
            ciphertext: Vec::new(),
            stored_at: Instant::now(),
        }
    }
}
