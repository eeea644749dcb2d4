//! Live poll state on the dropbox leader.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rand::seq::SliceRandom as _;

use prism_core::envelope;
use prism_core::halfkey::PrivateHalfKey;
use prism_core::make_nonce;
use prism_transport::Link;
use prism_types::message::{HalfKeyMap, LinkAddress, MsgType, PrismMessage};

use crate::mpc::peer::PeerState;

/// One client poll being served: created on arrival, live until its
/// expiration passes (or immediately after one pass when it has none),
/// closing its return links on termination.
pub struct Poll {
    /// The client-chosen request id; replies are tagged with it.
    pub nonce: Vec<u8>,
    /// The client's half-key for the response envelope.
    pub half_key: HalfKeyMap,
    /// When the poll stops being served.
    pub expiration: Option<SystemTime>,
    /// Per-party encrypted pseudonym-share submessages.
    pub peer_fragments: HashMap<u64, PrismMessage>,
    /// Client-supplied return addresses.
    pub link_addresses: Vec<LinkAddress>,
    /// Fragment ids already checked against this poll.
    pub checked: Mutex<HashSet<Vec<u8>>>,
    /// Loaded return links, owned by the poll.
    pub links: Mutex<Vec<Arc<dyn Link>>>,
}

impl Poll {
    /// Build poll state from a decrypted READ_OBLIVIOUS_DROPBOX request.
    pub fn from_message(message: &PrismMessage) -> Option<Self> {
        if message.msg_type != MsgType::ReadObliviousDropbox {
            return None;
        }
        let peer_fragments = message
            .submessages
            .as_deref()?
            .iter()
            .filter_map(|sub| sub.party_id.map(|party| (party, sub.clone())))
            .collect();
        Some(Self {
            nonce: message.nonce.clone()?,
            half_key: message.half_key.clone()?,
            expiration: message
                .expiration
                .map(|secs| UNIX_EPOCH + Duration::from_secs(secs)),
            peer_fragments,
            link_addresses: message.link_addresses.clone().unwrap_or_default(),
            checked: Mutex::new(HashSet::new()),
            links: Mutex::new(Vec::new()),
        })
    }

    /// Whether the poll should still be served.
    pub fn live(&self) -> bool {
        self.expiration
            .is_none_or(|expiration| expiration > SystemTime::now())
    }

    /// Decide which fragments to check next: pick a pivot fragment held by
    /// at least `threshold` peers, then up to `limit` fragments held by all
    /// of the pivot's holders, skipping anything already checked.
    pub fn fragments_to_check(
        &self,
        peers: &[PeerState],
        threshold: usize,
        limit: usize,
    ) -> HashSet<Vec<u8>> {
        let checked = self.checked.lock();
        let mut fragments: Vec<Vec<u8>> = peers
            .iter()
            .flat_map(|peer| peer.stored_fragments.iter().cloned())
            .filter(|fragment| !checked.contains(fragment))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        drop(checked);

        let mut rng = rand::thread_rng();
        fragments.shuffle(&mut rng);

        let mut pivot_holders: Option<Vec<&PeerState>> = None;
        for fragment in &fragments {
            let holders: Vec<&PeerState> = peers
                .iter()
                .filter(|peer| peer.stored_fragments.contains(fragment))
                .collect();
            if holders.len() >= threshold {
                pivot_holders = Some(holders);
                break;
            }
        }
        let Some(holders) = pivot_holders else {
            return HashSet::new();
        };

        let mut common: Vec<Vec<u8>> = fragments
            .into_iter()
            .filter(|fragment| {
                holders
                    .iter()
                    .all(|peer| peer.stored_fragments.contains(fragment))
            })
            .collect();
        common.shuffle(&mut rng);
        common.truncate(limit);
        common.into_iter().collect()
    }

    /// Construct the encrypted reply carrying retrieved fragment
    /// submessages back to the polling client.
    pub fn reply(&self, submessages: Vec<PrismMessage>) -> Option<PrismMessage> {
        let inner = PrismMessage {
            submessages: Some(submessages),
            ..PrismMessage::new(MsgType::ReadObliviousDropboxResponse)
        };
        let key = PrivateHalfKey::generate();
        let nonce = make_nonce();
        let ciphertext = envelope::encrypt(&inner, &key, &self.half_key, &nonce)?;
        Some(PrismMessage {
            enc_dropbox_response_id: Some(self.nonce.clone()),
            ciphertext: Some(ciphertext),
            half_key: Some(key.public()),
            nonce: Some(nonce),
            ..PrismMessage::new(MsgType::EncryptedReadObliviousDropboxResponse)
        })
    }

    /// Close all return links.
    pub async fn close_links(&self) {
        let links: Vec<Arc<dyn Link>> = self.links.lock().drain(..).collect();
        for link in links {
            link.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer_with(party_id: usize, fragments: &[&[u8]]) -> PeerState {
        let mut peer = PeerState::new(party_id, format!("peer-{party_id}"));
        peer.stored_fragments = fragments.iter().map(|f| f.to_vec()).collect();
        peer
    }

    fn poll() -> Poll {
        Poll {
            nonce: vec![1; 12],
            half_key: PrivateHalfKey::generate().public(),
            expiration: None,
            peer_fragments: HashMap::new(),
            link_addresses: Vec::new(),
            checked: Mutex::new(HashSet::new()),
            links: Mutex::new(Vec::new()),
        }
    }

    #[test]
    fn picks_fragments_common_to_a_threshold_subset() {
        let peers = vec![
            peer_with(0, &[b"f1", b"f2"]),
            peer_with(1, &[b"f1", b"f2"]),
            peer_with(2, &[b"f3"]),
        ];
        let poll = poll();
        let chosen = poll.fragments_to_check(&peers, 2, 10);
        // f3 is held by a single peer and can never clear the threshold.
        assert!(chosen.contains(b"f1".as_slice()) || chosen.contains(b"f2".as_slice()));
        assert!(!chosen.contains(b"f3".as_slice()));
    }

    #[test]
    fn checked_fragments_are_not_revisited() {
        let peers = vec![peer_with(0, &[b"f1"]), peer_with(1, &[b"f1"])];
        let poll = poll();
        poll.checked.lock().insert(b"f1".to_vec());
        assert!(poll.fragments_to_check(&peers, 2, 10).is_empty());
    }

    #[test]
    fn limit_bounds_the_batch() {
        let fragments: Vec<Vec<u8>> = (0..20u8).map(|i| vec![i]).collect();
        let refs: Vec<&[u8]> = fragments.iter().map(Vec::as_slice).collect();
        let peers = vec![peer_with(0, &refs), peer_with(1, &refs)];
        let poll = poll();
        assert_eq!(poll.fragments_to_check(&peers, 2, 5).len(), 5);
    }

    #[test]
    fn expired_polls_are_not_live() {
        let mut p = poll();
        assert!(p.live());
        p.expiration = Some(SystemTime::now() - Duration::from_secs(1));
        assert!(!p.live());
    }
}
