//! Committee peer bookkeeping.

use std::collections::HashSet;
use std::time::Instant;

use parking_lot::RwLock;

use prism_types::message::HalfKeyMap;

/// What one peer of the committee looks like from here.
#[derive(Debug, Clone)]
pub struct PeerState {
    /// The peer's index within the committee.
    pub party_id: usize,
    /// Its node name.
    pub name: String,
    /// Its pseudonym, learned during the hello handshake.
    pub pseudonym: Option<Vec<u8>>,
    /// Its announced half-key.
    pub half_key: Option<HalfKeyMap>,
    /// Whether it has reported readiness.
    pub ready: bool,
    /// Whether this entry is ourselves.
    pub local: bool,
    /// Last acknowledged hello.
    pub last_hello_ack: Option<Instant>,
    /// Last acknowledged ready exchange.
    pub last_ready_ack: Option<Instant>,
    /// Preproduct batches the peer confirmed.
    pub preproduct_batches: HashSet<Vec<u8>>,
    /// Fragments the peer is believed to hold.
    pub stored_fragments: HashSet<Vec<u8>>,
}

impl PeerState {
    /// A fresh peer entry.
    pub fn new(party_id: usize, name: impl Into<String>) -> Self {
        Self {
            party_id,
            name: name.into(),
            pseudonym: None,
            half_key: None,
            ready: false,
            local: false,
            last_hello_ack: None,
            last_ready_ack: None,
            preproduct_batches: HashSet::new(),
            stored_fragments: HashSet::new(),
        }
    }

    /// The half-key to advertise in ARKs; only ready peers count.
    pub fn ark_key(&self) -> Option<HalfKeyMap> {
        self.ready.then(|| self.half_key.clone()).flatten()
    }
}

/// The committee's peer table, shared across the role's tasks.
#[derive(Default)]
pub struct PeerTable {
    peers: RwLock<Vec<PeerState>>,
}

impl PeerTable {
    /// Install the committee membership.
    pub fn set_peers(&self, peers: Vec<PeerState>) {
        *self.peers.write() = peers;
    }

    /// Number of committee members.
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    /// Whether the committee has been formed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of one peer.
    pub fn get(&self, party_id: usize) -> Option<PeerState> {
        self.peers.read().get(party_id).cloned()
    }

    /// Snapshot of every peer.
    pub fn snapshot(&self) -> Vec<PeerState> {
        self.peers.read().clone()
    }

    /// Mutate one peer's entry; unknown party ids are ignored.
    pub fn update(&self, party_id: usize, f: impl FnOnce(&mut PeerState)) {
        if let Some(peer) = self.peers.write().get_mut(party_id) {
            f(peer);
        }
    }

    /// Peers that have announced a half-key.
    pub fn keyed_count(&self) -> usize {
        self.peers
            .read()
            .iter()
            .filter(|p| p.half_key.is_some())
            .count()
    }
}
