//! Receive-side deduplication: a SHA-256 seen-set with per-entry TTL.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sha2::{Digest as _, Sha256};
use tokio_util::sync::CancellationToken;

/// Remembers message digests for a TTL; checking an entry refreshes it.
pub struct Deduplicator {
    ttl: Duration,
    sweep: Duration,
    seen: Mutex<HashMap<[u8; 32], Instant>>,
}

impl Deduplicator {
    /// A deduplicator whose entries live for `ttl`, purged every `sweep`.
    pub fn new(ttl: Duration, sweep: Duration) -> Self {
        Self {
            ttl,
            sweep,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Whether these bytes are new. Always refreshes the entry, so two
    /// identical messages within the TTL of each other yield exactly one
    /// `true`.
    pub fn is_new(&self, bytes: &[u8]) -> bool {
        let digest: [u8; 32] = Sha256::digest(bytes).into();
        let expiry = Instant::now() + self.ttl;
        self.seen.lock().insert(digest, expiry).is_none_or(|old| old <= Instant::now())
    }

    /// Drop expired entries until cancelled.
    pub async fn purge_task(&self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.sweep);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let now = Instant::now();
                    self.seen.lock().retain(|_, expiry| *expiry > now);
                }
                _ = cancel.cancelled() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_within_ttl_is_suppressed() {
        let dedupe = Deduplicator::new(Duration::from_secs(60), Duration::from_secs(60));
        assert!(dedupe.is_new(b"message"));
        assert!(!dedupe.is_new(b"message"));
        assert!(dedupe.is_new(b"other"));
    }

    #[test]
    fn expired_entries_count_as_new_again() {
        let dedupe = Deduplicator::new(Duration::from_millis(0), Duration::from_secs(60));
        assert!(dedupe.is_new(b"message"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(dedupe.is_new(b"message"));
    }
}
