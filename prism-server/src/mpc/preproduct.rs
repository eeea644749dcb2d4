//! Pooled Beaver triples and shared random numbers.
//!
//! Preproducts are created in batches; each batch is owned by the peer that
//! requested it, exists in parallel on every participating peer, and only
//! the owner claims chunks from it. Peers serve requested chunks from their
//! local copy and null out consumed positions so a replayed claim fails
//! loudly instead of silently reusing secret material.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use prism_core::sharing::Triple;
use prism_types::share::{PreproductInfo, Share};

use crate::mpc::peer::PeerState;

/// A consumed slice of preproducts, ready for one MPC op.
#[derive(Debug, Clone)]
pub struct PreproductChunk {
    /// One Beaver triple per multiplied component.
    pub triples: Vec<Triple>,
    /// One shared random number per component.
    pub random_numbers: Vec<Share>,
}

impl PreproductChunk {
    /// Component capacity of the chunk.
    pub fn len(&self) -> usize {
        self.triples.len()
    }

    /// Whether the chunk is empty.
    pub fn is_empty(&self) -> bool {
        self.triples.is_empty()
    }
}

/// One batch of preproducts mirrored across its participant set.
#[derive(Debug)]
pub struct PreproductBatch {
    /// Random id assigned by the requesting owner.
    pub batch_id: Vec<u8>,
    /// Participating peer names.
    pub peers: HashSet<String>,
    /// Whether this node owns (and may claim from) the batch.
    pub owned: bool,
    /// Triples, nulled as they are consumed.
    pub triples: Vec<Option<Triple>>,
    /// Shared randoms, nulled as they are consumed.
    pub random_numbers: Vec<Option<Share>>,
    /// Next unclaimed position (owner side).
    pub next: usize,
}

impl PreproductBatch {
    /// Positions not yet claimed by the owner.
    pub fn remaining(&self) -> usize {
        self.triples.len().saturating_sub(self.next)
    }

    /// Owner-side claim of up to `size` positions. Returns
    /// `(start, claimed)`.
    fn claim(&mut self, size: usize) -> (usize, usize) {
        debug_assert!(self.owned, "only the owner claims from a batch");
        let start = self.next;
        let claimed = size.min(self.remaining());
        self.next += claimed;
        (start, claimed)
    }

    /// Consume the positions `[start, start+size)`.
    ///
    /// # Panics
    /// Panics if any position was already consumed; preproduct reuse would
    /// silently break the secrecy of the multiplication, so it must never
    /// go unnoticed.
    fn take(&mut self, start: usize, size: usize) -> PreproductChunk {
        let mut triples = Vec::with_capacity(size);
        let mut random_numbers = Vec::with_capacity(size);
        for i in start..start + size {
            let triple = self.triples[i]
                .take()
                .unwrap_or_else(|| panic!("preproduct triple {i} consumed twice"));
            let random = self.random_numbers[i]
                .take()
                .unwrap_or_else(|| panic!("preproduct random {i} consumed twice"));
            triples.push(triple);
            random_numbers.push(random);
        }
        PreproductChunk {
            triples,
            random_numbers,
        }
    }

    /// Whether this batch can serve ops across the listed peers: every
    /// peer participated and has confirmed the batch.
    pub fn serves(&self, peers: &[PeerState], exact: bool) -> bool {
        let names: HashSet<&str> = peers.iter().map(|p| p.name.as_str()).collect();
        if peers
            .iter()
            .any(|peer| !peer.preproduct_batches.contains(&self.batch_id))
        {
            return false;
        }
        if exact {
            names.len() == self.peers.len() && names.iter().all(|n| self.peers.contains(*n))
        } else {
            names.iter().all(|n| self.peers.contains(*n))
        }
    }
}

/// The per-role preproduct store.
pub struct PreproductStore {
    batches: Mutex<HashMap<Vec<u8>, PreproductBatch>>,
    restocked: Notify,
}

impl PreproductStore {
    /// An empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            batches: Mutex::new(HashMap::new()),
            restocked: Notify::new(),
        })
    }

    /// Install a freshly generated batch.
    pub fn add_batch(&self, batch: PreproductBatch) {
        self.batches.lock().insert(batch.batch_id.clone(), batch);
        self.restocked.notify_waiters();
    }

    /// Drop a batch (generation failed or GC).
    pub fn remove_batch(&self, batch_id: &[u8]) {
        self.batches.lock().remove(batch_id);
    }

    /// Whether a batch is present.
    pub fn has_batch(&self, batch_id: &[u8]) -> bool {
        self.batches.lock().contains_key(batch_id)
    }

    /// Total unclaimed preproducts in owned batches serving `peers`.
    pub fn total_remaining(&self, peers: &[PeerState], exact: bool) -> usize {
        self.batches
            .lock()
            .values()
            .filter(|batch| batch.owned && batch.serves(peers, exact))
            .map(PreproductBatch::remaining)
            .sum()
    }

    /// Claim roughly `size` preproducts usable with `peers`, splicing
    /// across batches when needed. Blocks until at least one preproduct is
    /// available; the peer snapshot is refreshed through `peers_fn` while
    /// waiting.
    pub async fn claim_chunk(
        &self,
        size: usize,
        peers_fn: impl Fn() -> Vec<PeerState>,
    ) -> PreproductInfo {
        loop {
            {
                let peers = peers_fn();
                let mut batches = self.batches.lock();
                let mut candidates: Vec<&mut PreproductBatch> = batches
                    .values_mut()
                    .filter(|batch| {
                        batch.owned && batch.remaining() > 0 && batch.serves(&peers, false)
                    })
                    .collect();
                // Prefer draining the fullest batches first.
                candidates.sort_by_key(|batch| std::cmp::Reverse(batch.remaining()));

                if !candidates.is_empty() {
                    let mut info = PreproductInfo::default();
                    let mut to_claim = size;
                    for batch in candidates {
                        let (start, claimed) = batch.claim(to_claim);
                        if claimed == 0 {
                            continue;
                        }
                        info.batches.push(batch.batch_id.clone());
                        info.starts.push(start as u64);
                        info.sizes.push(claimed as u64);
                        to_claim -= claimed;
                        if to_claim == 0 {
                            break;
                        }
                    }
                    if info.size() > 0 {
                        return info;
                    }
                }
            }
            tracing::debug!("awaiting preproduct availability");
            let _ = tokio::time::timeout(Duration::from_millis(100), self.restocked.notified())
                .await;
        }
    }

    /// Consume the slices named by `info` from the local batches. Returns
    /// `None` when a referenced batch is unknown (this peer missed it).
    pub fn get_chunk(&self, info: &PreproductInfo) -> Option<PreproductChunk> {
        let mut batches = self.batches.lock();
        let mut triples = Vec::new();
        let mut random_numbers = Vec::new();
        for ((batch_id, start), size) in info
            .batches
            .iter()
            .zip(&info.starts)
            .zip(&info.sizes)
        {
            let batch = batches.get_mut(batch_id)?;
            let chunk = batch.take(*start as usize, *size as usize);
            triples.extend(chunk.triples);
            random_numbers.extend(chunk.random_numbers);
        }
        Some(PreproductChunk {
            triples,
            random_numbers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigUint;

    fn share(v: u64) -> Share {
        Share::new(BigUint::from(v), 0)
    }

    fn batch(id: u8, size: usize, owned: bool, peers: &[&str]) -> PreproductBatch {
        PreproductBatch {
            batch_id: vec![id],
            peers: peers.iter().map(|s| s.to_string()).collect(),
            owned,
            triples: (0..size)
                .map(|i| {
                    Some(Triple {
                        a: share(i as u64),
                        b: share(i as u64 + 1),
                        c: share(i as u64 + 2),
                    })
                })
                .collect(),
            random_numbers: (0..size).map(|i| Some(share(i as u64))).collect(),
            next: 0,
        }
    }

    fn peer(name: &str, batches: &[u8]) -> PeerState {
        let mut p = PeerState::new(0, name);
        p.preproduct_batches = batches.iter().map(|b| vec![*b]).collect();
        p
    }

    #[tokio::test]
    async fn claims_splice_across_batches() {
        let store = PreproductStore::new();
        store.add_batch(batch(1, 3, true, &["a", "b"]));
        store.add_batch(batch(2, 5, true, &["a", "b"]));
        let peers = vec![peer("a", &[1, 2]), peer("b", &[1, 2])];

        let info = store.claim_chunk(6, || peers.clone()).await;
        assert_eq!(info.size(), 6);
        assert!(info.batches.len() >= 2, "6 > any single batch, must splice");

        let chunk = store.get_chunk(&info).unwrap();
        assert_eq!(chunk.len(), 6);
    }

    #[tokio::test]
    async fn short_claims_return_what_is_available() {
        let store = PreproductStore::new();
        store.add_batch(batch(1, 2, true, &["a"]));
        let peers = vec![peer("a", &[1])];
        let info = store.claim_chunk(10, || peers.clone()).await;
        assert_eq!(info.size(), 2);
    }

    #[test]
    #[should_panic(expected = "consumed twice")]
    fn double_consumption_panics() {
        let store = PreproductStore::new();
        store.add_batch(batch(1, 2, true, &["a"]));
        let info = PreproductInfo {
            batches: vec![vec![1]],
            starts: vec![0],
            sizes: vec![2],
        };
        store.get_chunk(&info).unwrap();
        store.get_chunk(&info).unwrap();
    }

    #[test]
    fn unowned_batches_do_not_serve_claims() {
        let store = PreproductStore::new();
        store.add_batch(batch(1, 4, false, &["a"]));
        let peers = vec![peer("a", &[1])];
        assert_eq!(store.total_remaining(&peers, false), 0);
    }

    #[test]
    fn serving_requires_peer_confirmation() {
        let b = batch(1, 4, true, &["a", "b"]);
        // Peer "b" has not confirmed batch 1.
        let peers = vec![peer("a", &[1]), peer("b", &[])];
        assert!(!b.serves(&peers, false));
    }
}
