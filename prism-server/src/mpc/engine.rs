//! The MPC engine: op/response plumbing, oblivious preproduct generation,
//! and Beaver multiplication across a committee.
//!
//! Messages are routed by `(op id, action)`: an operation picks a random op
//! id, and every round of communication within it carries a distinct
//! action, so messages meant for one step are never consumed by another.
//! Replies are buffered by a response hook keyed by
//! `(pseudonym, party id, op id, action)` and gathered until a count or
//! timeout is reached.

use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools as _;
use num_bigint::BigUint;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use prism_core::envelope;
use prism_core::field::rand_nonzero;
use prism_core::make_nonce;
use prism_core::random_id;
use prism_core::sharing::{Sharing, Triple};
use prism_transport::EpochTransport;
use prism_transport::enums::ConnectionType;
use prism_transport::hooks::HookFilter;
use prism_types::message::{Action, MpcMap, MsgType, PrismMessage};
use prism_types::share::Share;

use crate::config::ServerConfig;
use crate::data::KeyMaterial;
use crate::lsp::LsRouting;
use crate::mpc::peer::{PeerState, PeerTable};
use crate::mpc::preproduct::{PreproductBatch, PreproductStore};

/// The shared MPC state of one committee member.
pub struct MpcEngine {
    /// Epoch-scoped transport.
    pub transport: EpochTransport,
    /// Server tunables.
    pub config: Arc<ServerConfig>,
    /// Epoch key material (peer-message encryption).
    pub keys: KeyMaterial,
    /// Our pseudonym.
    pub pseudonym: Vec<u8>,
    /// Our index within the committee.
    pub party_id: usize,
    /// The committee.
    pub peers: PeerTable,
    /// The sharing geometry.
    pub sharing: Sharing,
    /// Pooled triples and shared randoms.
    pub preproducts: Arc<PreproductStore>,
    ls: Option<Arc<LsRouting>>,
    ready_fn: Box<dyn Fn(&MpcEngine) -> bool + Send + Sync>,
}

impl MpcEngine {
    /// Assemble the engine for a formed committee.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: EpochTransport,
        config: Arc<ServerConfig>,
        keys: KeyMaterial,
        pseudonym: Vec<u8>,
        party_id: usize,
        peers: PeerTable,
        sharing: Sharing,
        ls: Option<Arc<LsRouting>>,
        ready_fn: Box<dyn Fn(&MpcEngine) -> bool + Send + Sync>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            config,
            keys,
            pseudonym,
            party_id,
            peers,
            sharing,
            preproducts: PreproductStore::new(),
            ls,
            ready_fn,
        })
    }

    /// Peer 0 owns client-facing links and initiates preproduct batches.
    pub fn is_leader(&self) -> bool {
        self.party_id == 0
    }

    /// Our own peer entry.
    pub fn local_peer(&self) -> PeerState {
        self.peers.get(self.party_id).expect("local peer exists")
    }

    /// Whether a peer is usable for ops: ready, and (when link-state
    /// routing is on) deemed alive by the router.
    pub fn online(&self, peer: &PeerState) -> bool {
        if peer.local {
            return true;
        }
        if !peer.ready {
            return false;
        }
        if !self.config.ls_routing {
            return true;
        }
        match &self.ls {
            Some(ls) => {
                let alive = ls.neighborhood.is_alive_address(&peer.name);
                if !alive {
                    tracing::debug!("peer {} not online per link-state routing", peer.name);
                }
                alive
            }
            None => true,
        }
    }

    /// Every currently usable peer.
    pub fn online_peers(&self) -> Vec<PeerState> {
        self.peers
            .snapshot()
            .into_iter()
            .filter(|peer| self.online(peer))
            .collect()
    }

    /// Peers needed to run triple generation: the degree-reduction
    /// polynomial has degree `2·(threshold−1)`.
    pub fn preprocessing_threshold(&self) -> usize {
        2 * (self.sharing.threshold() - 1) + 1
    }

    /// Channel-informed padding for an op's timeout, derived from the
    /// estimated round count, per-peer traffic, and the worst direct
    /// channel. Does not account for concurrent ops, so callers add a base
    /// budget on top.
    pub fn timeout_padding(&self, rounds: u32, bytes_per_peer: usize, peer_count: usize) -> Duration {
        let direct: Vec<_> = self
            .transport
            .channels()
            .iter()
            .map(|c| c.descriptor())
            .filter(|d| d.connection_type == ConnectionType::Direct)
            .collect();
        let worst_latency_ms = direct
            .iter()
            .map(|d| d.latency_ms)
            .filter(|l| *l > 0)
            .max()
            .unwrap_or(500);
        let worst_bandwidth = direct
            .iter()
            .map(|d| d.bandwidth_bps)
            .filter(|b| *b > 0)
            .min()
            .unwrap_or(200_000);

        let est_bits = 8 * bytes_per_peer as u64 * peer_count.saturating_sub(1) as u64;
        Duration::from_millis(worst_latency_ms * rounds as u64)
            + Duration::from_secs_f64(est_bits as f64 / worst_bandwidth as f64)
    }

    /// Deadline for generating a preproduct batch of `size` across
    /// `peer_count` peers.
    pub fn batch_timeout(&self, size: usize, peer_count: usize) -> Duration {
        Duration::from_secs_f64(self.config.mpc_lf_batch_timeout * size as f64)
            + self.timeout_padding(6, 250 * size, peer_count)
    }

    fn mpc_message(
        &self,
        msg_type: MsgType,
        action: Action,
        op_id: &[u8],
        mut mpc: MpcMap,
    ) -> PrismMessage {
        mpc.action = Some(action);
        mpc.request_id = Some(op_id.to_vec());
        PrismMessage {
            party_id: Some(self.party_id as u64),
            mpc_map: Some(mpc),
            ..PrismMessage::new(msg_type)
        }
    }

    /// A message launching an op on peers.
    pub fn request(&self, action: Action, op_id: &[u8], mpc: MpcMap) -> PrismMessage {
        self.mpc_message(MsgType::MpcRequest, action, op_id, mpc)
    }

    /// A message for a round of communication within an op.
    pub fn response(&self, action: Action, op_id: &[u8], mpc: MpcMap) -> PrismMessage {
        self.mpc_message(MsgType::MpcResponse, action, op_id, mpc)
    }

    /// Build the reply to an op request, echoing its action and op id.
    pub fn reply_message(&self, request: &PrismMessage, mpc: MpcMap) -> Option<PrismMessage> {
        let req_mpc = request.mpc_map.as_ref()?;
        Some(self.response(req_mpc.action?, req_mpc.request_id.as_deref()?, mpc))
    }

    /// Send the reply of an op back to its requester.
    pub async fn respond_to(&self, request: &PrismMessage, response: PrismMessage) -> bool {
        let Some(party) = request.party_id else {
            return false;
        };
        let Some(peer) = self.peers.get(party as usize) else {
            return false;
        };
        self.send_to_peer(&peer, response).await
    }

    fn encrypt_peer_message(&self, peer: &PeerState, message: PrismMessage) -> PrismMessage {
        if !self.config.mpc_lf_encrypt_peer {
            return message;
        }
        let (Some(half_key), Some(_)) = (&peer.half_key, peer.last_hello_ack) else {
            return message;
        };
        let nonce = make_nonce();
        let Some(ciphertext) =
            envelope::encrypt(&message, &self.keys.private_key, half_key, &nonce)
        else {
            tracing::debug!("failed to encrypt message for {}", peer.name);
            return message;
        };
        PrismMessage {
            pseudonym: peer.pseudonym.clone(),
            ciphertext: Some(ciphertext),
            nonce: Some(nonce),
            party_id: Some(self.party_id as u64),
            ..PrismMessage::new(MsgType::EncryptPeerMessage)
        }
    }

    /// Send one message to one peer. Local peers get in-process delivery;
    /// remote peers get (optionally encrypted) traffic addressed by name or
    /// routed by pseudonym.
    pub async fn send_to_peer(&self, peer: &PeerState, message: PrismMessage) -> bool {
        if peer.local {
            let addressed = PrismMessage {
                dest_party_id: Some(peer.party_id as u64),
                nonce: message.nonce.clone().or_else(|| Some(make_nonce())),
                pseudonym: Some(self.pseudonym.clone()),
                ..message
            };
            self.transport.deliver_local(addressed);
            return true;
        }

        let outgoing = self.encrypt_peer_message(peer, message);
        // A fresh nonce keeps otherwise-identical MPC messages distinct.
        let addressed = PrismMessage {
            dest_party_id: Some(peer.party_id as u64),
            nonce: outgoing.nonce.clone().or_else(|| Some(make_nonce())),
            pseudonym: peer.pseudonym.clone(),
            ..outgoing
        };

        let route_by_pseudonym =
            self.config.ls_routing && peer.pseudonym.is_some() && self.ls.is_some();
        if route_by_pseudonym {
            self.ls
                .as_ref()
                .expect("checked above")
                .emit(addressed, None)
                .await
        } else {
            let sent = self
                .transport
                .emit_on_links(&peer.name, &addressed, None, None)
                .await;
            if !sent {
                tracing::debug!("no usable link towards peer {} yet", peer.name);
            }
            sent
        }
    }

    /// Send N messages to N peers in parallel.
    pub async fn send_to_peers(&self, peers: &[PeerState], messages: Vec<PrismMessage>) {
        debug_assert_eq!(peers.len(), messages.len());
        let sends = peers
            .iter()
            .zip(messages)
            .map(|(peer, message)| self.send_to_peer(peer, message));
        futures::future::join_all(sends).await;
    }

    /// Send per-peer messages and gather responses matching the op id and
    /// action until `min_replies` (default: all peers) arrive or the
    /// timeout passes. Returns whatever arrived, sorted by party id.
    pub async fn send_and_gather(
        &self,
        peers: &[PeerState],
        messages: Vec<PrismMessage>,
        min_replies: Option<usize>,
        timeout: Duration,
    ) -> Vec<PrismMessage> {
        if messages.is_empty() || peers.is_empty() {
            return Vec::new();
        }
        let mpc = messages[0].mpc_map.as_ref().expect("mpc messages only");
        let op_id = mpc.request_id.clone().expect("op id set");
        let action = mpc.action;
        let count = min_replies.unwrap_or(peers.len());

        let mut hook = self.transport.register_hook(HookFilter::MpcResponse {
            pseudonym: self.pseudonym.clone(),
            party_id: self.party_id as u64,
            op_id: op_id.clone(),
            action,
        });

        self.send_to_peers(peers, messages).await;

        let deadline = tokio::time::Instant::now() + timeout;
        let mut responses: Vec<PrismMessage> = Vec::new();
        while responses.len() < count {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match hook.recv_timeout(remaining).await {
                Some(package) => responses.push(package.message),
                None => break,
            }
        }
        if responses.len() < count {
            tracing::debug!(
                "gather for op {} ({action:?}) got {}/{count} responses",
                hex::encode(&op_id[..6.min(op_id.len())]),
                responses.len(),
            );
        }
        responses.sort_by_key(|m| m.party_id);
        responses
    }

    /// Sum a row of received shares into this party's share of the sum.
    pub fn sum_shares(&self, shares: &[Share]) -> Share {
        let m = self.sharing.modulus();
        let value = shares
            .iter()
            .fold(BigUint::default(), |acc, s| (acc + &s.value) % m);
        Share::new(value, self.party_id as i64)
    }

    /// Redistribute locally generated share vectors so the i-th party ends
    /// up holding the i-th share of every vector. Requires every peer to
    /// answer; a partial exchange would corrupt the sums, so it fails
    /// all-or-nothing.
    pub async fn distribute_shares(
        &self,
        op_id: &[u8],
        action: Action,
        peers: &[PeerState],
        shares: &[Vec<Share>],
        timeout: Duration,
    ) -> Vec<Vec<Share>> {
        let messages: Vec<PrismMessage> = peers
            .iter()
            .map(|peer| {
                let column: Vec<Share> = shares
                    .iter()
                    .map(|vector| vector[peer.party_id].clone())
                    .collect();
                self.response(
                    action,
                    op_id,
                    MpcMap {
                        shares: Some(column),
                        ..MpcMap::default()
                    },
                )
            })
            .collect();

        let responses = self
            .send_and_gather(peers, messages, Some(peers.len()), timeout)
            .await;
        if responses.len() < peers.len() {
            return Vec::new();
        }
        let rows: Vec<Vec<Share>> = responses
            .iter()
            .filter_map(|m| m.mpc_map.as_ref().and_then(|mpc| mpc.shares.clone()))
            .collect();
        if rows.len() < peers.len() || rows.iter().any(|row| row.len() != shares.len()) {
            return Vec::new();
        }
        (0..shares.len())
            .map(|i| rows.iter().map(|row| row[i].clone()).collect())
            .collect()
    }

    /// Obliviously generate `size` shared random numbers: every party
    /// shares fresh randoms, the shares are redistributed, and each column
    /// sum is a share of a common but unknown value. One round.
    pub async fn generate_shares(
        &self,
        op_id: &[u8],
        peers: &[PeerState],
        size: usize,
        timeout: Duration,
    ) -> Vec<Share> {
        let local: Vec<Vec<Share>> = {
            let mut rng = rand::thread_rng();
            (0..size)
                .map(|_| {
                    let value = rand_nonzero(&mut rng, self.sharing.modulus());
                    self.sharing.share(&value, &mut rng)
                })
                .collect()
        };
        let received = self
            .distribute_shares(op_id, Action::GenerateShares, peers, &local, timeout)
            .await;
        received
            .iter()
            .map(|row| self.sum_shares(row))
            .collect()
    }

    /// Open a list of shares collectively: send ours to every op peer,
    /// gather theirs, and reconstruct column-wise. Columns that cannot be
    /// opened (too many dummies) come back as `None`.
    #[allow(clippy::too_many_arguments)]
    pub async fn open_multiple(
        &self,
        op_id: &[u8],
        peers: &[PeerState],
        action: Action,
        sharing: &Sharing,
        shares: Vec<Share>,
        min_replies: Option<usize>,
        timeout: Option<Duration>,
    ) -> Vec<Option<BigUint>> {
        let timeout = timeout.unwrap_or_else(|| {
            self.config.mpc_lf_base_op_timeout
                + self.timeout_padding(2, 64 * shares.len(), peers.len())
        });
        let count = shares.len();
        let message = self.response(
            action,
            op_id,
            MpcMap {
                shares: Some(shares),
                ..MpcMap::default()
            },
        );
        let messages = vec![message; peers.len()];
        let responses = self
            .send_and_gather(peers, messages, min_replies, timeout)
            .await;
        if responses.is_empty() {
            return Vec::new();
        }
        let rows: Vec<Vec<Share>> = responses
            .iter()
            .filter_map(|m| m.mpc_map.as_ref().and_then(|mpc| mpc.shares.clone()))
            .filter(|row| row.len() == count)
            .collect();
        (0..count)
            .map(|i| {
                let column: Vec<Share> = rows.iter().map(|row| row[i].clone()).collect();
                sharing.open(&column).ok()
            })
            .collect()
    }

    /// Hadamard product of two share vectors, consuming one Beaver triple
    /// per component. One open round; unopenable components come back as
    /// dummies.
    pub async fn mulm(
        &self,
        xs: &[Share],
        ys: &[Share],
        triples: &[Triple],
        peers: &[PeerState],
        op_id: &[u8],
    ) -> Vec<Share> {
        let eps: Vec<Share> = xs
            .iter()
            .zip(triples)
            .map(|(x, t)| self.sharing.sub(x, &t.a))
            .collect();
        let deltas: Vec<Share> = ys
            .iter()
            .zip(triples)
            .map(|(y, t)| self.sharing.sub(y, &t.b))
            .collect();
        let mut both = eps;
        both.extend(deltas);

        let opened = self
            .open_multiple(
                op_id,
                peers,
                Action::MulHandler,
                &self.sharing,
                both,
                Some(self.sharing.threshold()),
                None,
            )
            .await;
        if opened.len() != xs.len() * 2 {
            return Vec::new();
        }
        let (eps_open, delta_open) = opened.split_at(xs.len());

        eps_open
            .iter()
            .zip(delta_open)
            .zip(triples)
            .map(|((eps, delta), triple)| match (eps, delta) {
                (Some(eps), Some(delta)) => self.sharing.mul_ed(eps, delta, triple),
                _ => Share::dummy(),
            })
            .collect()
    }

    /// Multiply-then-reduce used during triple generation: multiply
    /// locally (doubling the degree), mask with fresh randoms shared at
    /// both degrees, open the masked high-degree value, and unmask at low
    /// degree. Two rounds.
    pub async fn mulm_etf(
        &self,
        op_id: &[u8],
        peers: &[PeerState],
        xs: &[Share],
        ys: &[Share],
        timeout: Duration,
    ) -> Vec<Share> {
        let low_degree = self.sharing.threshold() - 1;
        let high_threshold = (low_degree * 2 + 1) as u64;
        let Ok(high_sharing) = self.sharing.with_threshold(high_threshold) else {
            return Vec::new();
        };

        // Step 1: [x·y] at high degree, locally.
        let xy_high: Vec<Share> = xs
            .iter()
            .zip(ys)
            .map(|(x, y)| self.sharing.mul(x, y))
            .collect();

        // Step 2: fresh randoms shared at both degrees, redistributed.
        let local: Vec<Vec<Share>> = {
            let mut rng = rand::thread_rng();
            let rs: Vec<BigUint> = (0..xs.len())
                .map(|_| rand_nonzero(&mut rng, self.sharing.modulus()))
                .collect();
            let mut local: Vec<Vec<Share>> = rs
                .iter()
                .map(|r| self.sharing.share(r, &mut rng))
                .collect();
            local.extend(rs.iter().map(|r| high_sharing.share(r, &mut rng)));
            local
        };

        let received = self
            .distribute_shares(op_id, Action::MulmBgwRand, peers, &local, timeout)
            .await;
        if received.is_empty() {
            return Vec::new();
        }
        let summed: Vec<Share> = received.iter().map(|row| self.sum_shares(row)).collect();
        if summed.len() != xs.len() * 2 {
            tracing::error!("mulm_etf length check failed");
            return Vec::new();
        }
        let (r_low, r_high) = summed.split_at(xs.len());

        // Step 3: [r − x·y] at high degree.
        let z_high: Vec<Share> = r_high
            .iter()
            .zip(&xy_high)
            .map(|(r, xy)| self.sharing.sub(r, xy))
            .collect();

        // Step 4: open z.
        let zs = self
            .open_multiple(
                op_id,
                peers,
                Action::MulmBgwOpen,
                &high_sharing,
                z_high,
                Some(peers.len()),
                Some(timeout),
            )
            .await;
        if zs.len() != xs.len() || zs.iter().any(Option::is_none) {
            return Vec::new();
        }

        // Step 5: [x·y] = [r] − (r − x·y), back at low degree.
        r_low
            .iter()
            .zip(zs)
            .map(|(r, z)| self.sharing.subc(r, &z.expect("checked above")))
            .collect()
    }

    // --- Preproduct pipeline ------------------------------------------------

    /// All peer subsets that could generate preproducts: they include us
    /// (we will own the batch) and are large enough for degree reduction.
    pub fn preproduct_groups(&self) -> Vec<Vec<PeerState>> {
        let peers = self.peers.snapshot();
        let mut groups = Vec::new();
        for count in self.preprocessing_threshold()..=peers.len() {
            for combo in peers.iter().combinations(count) {
                if combo.iter().any(|peer| peer.party_id == self.party_id) {
                    groups.push(combo.into_iter().cloned().collect());
                }
            }
        }
        groups
    }

    /// Leader task keeping every peer group stocked with preproducts.
    pub async fn preproduct_task(self: Arc<Self>, cancel: CancellationToken) {
        if !self.is_leader() {
            return;
        }
        let mut tasks = JoinSet::new();
        for group in self.preproduct_groups() {
            let this = self.clone();
            let cancel = cancel.clone();
            tracing::debug!(
                "launching preproduct task for group of {} peers",
                group.len()
            );
            tasks.spawn(async move { this.preproduct_group_task(group, cancel).await });
        }
        cancel.cancelled().await;
        tasks.abort_all();
    }

    async fn preproduct_group_task(&self, group: Vec<PeerState>, cancel: CancellationToken) {
        let group_ids: Vec<usize> = group.iter().map(|p| p.party_id).collect();
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let batch_size = self.config.mpc_preproduct_batch_size;
            let min_reserve =
                (batch_size as f64 * self.config.mpc_preproduct_refresh_threshold) as usize;
            let group_now: Vec<PeerState> = group_ids
                .iter()
                .filter_map(|id| self.peers.get(*id))
                .collect();
            let remaining = self.preproducts.total_remaining(&group_now, true);
            ::metrics::gauge!(crate::metrics::METRICS_ID_MPC_PREPRODUCTS_AVAILABLE)
                .set(self.preproducts.total_remaining(&[], false) as f64);
            if remaining < min_reserve {
                if group_now.iter().all(|peer| self.online(peer)) {
                    self.generate_preproduct_batch(batch_size, &group_now).await;
                } else {
                    tracing::debug!("not enough peers online for preproduct group");
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Run one batch generation across `peers`. Three rounds.
    pub async fn generate_preproduct_batch(&self, size: usize, peers: &[PeerState]) {
        let batch_id = random_id();
        let timeout = self.batch_timeout(size, peers.len());
        tracing::debug!(
            "starting preproduct batch {} for {} peers (timeout {timeout:?})",
            hex::encode(&batch_id[..6]),
            peers.len()
        );

        let request = self.request(
            Action::OfflineInit,
            &batch_id,
            MpcMap {
                size: Some(size as u64),
                participants: Some(peers.iter().map(|p| p.party_id as u64).collect()),
                ..MpcMap::default()
            },
        );
        let messages = vec![request; peers.len()];
        let successes = self
            .send_and_gather(peers, messages, Some(peers.len()), timeout)
            .await;

        if successes.len() >= peers.len() {
            for success in &successes {
                if let Some(party) = success.party_id {
                    self.peers.update(party as usize, |peer| {
                        peer.preproduct_batches.insert(batch_id.clone());
                    });
                }
            }
            tracing::debug!("preproduct batch {} succeeded", hex::encode(&batch_id[..6]));
        } else {
            tracing::debug!(
                "preproduct batch {} failed with {} responses",
                hex::encode(&batch_id[..6]),
                successes.len()
            );
            ::metrics::counter!(crate::metrics::METRICS_ID_MPC_BATCH_FAILURES).increment(1);
            // Abandoned batches must not stay partially visible.
            self.preproducts.remove_batch(&batch_id);
        }
    }

    /// Peer op for preproduct generation: derive a large pool of shared
    /// randoms, turn two thirds of it into Beaver triples via
    /// multiply-then-reduce, and persist the batch.
    pub async fn preproduct_op(&self, message: &PrismMessage) {
        let Some(mpc) = &message.mpc_map else { return };
        let (Some(batch_id), Some(size), Some(participants)) =
            (&mpc.request_id, mpc.size, &mpc.participants)
        else {
            return;
        };
        let size = size as usize;
        let peers: Vec<PeerState> = participants
            .iter()
            .filter_map(|id| self.peers.get(*id as usize))
            .collect();
        let Some(owner) = message.party_id else { return };
        let timeout = self.batch_timeout(size, peers.len());

        tracing::debug!("preproduct batch {} requested", hex::encode(&batch_id[..6]));
        let random_shares = self
            .generate_shares(batch_id, &peers, size * 3, timeout)
            .await;
        if random_shares.len() != size * 3 {
            tracing::debug!("batch {} failed to generate shares", hex::encode(&batch_id[..6]));
            return;
        }

        let randoms = random_shares[size * 2..].to_vec();
        let a = &random_shares[..size];
        let b = &random_shares[size..size * 2];
        let c = self.mulm_etf(batch_id, &peers, a, b, timeout).await;
        if c.len() != size {
            tracing::warn!("batch {} failed to multiply", hex::encode(&batch_id[..6]));
            return;
        }

        let triples = a
            .iter()
            .zip(b)
            .zip(c)
            .map(|((a, b), c)| {
                Some(Triple {
                    a: a.clone(),
                    b: b.clone(),
                    c,
                })
            })
            .collect();

        let batch = PreproductBatch {
            batch_id: batch_id.clone(),
            peers: peers.iter().map(|p| p.name.clone()).collect(),
            owned: owner as usize == self.party_id,
            triples,
            random_numbers: randoms.into_iter().map(Some).collect(),
            next: 0,
        };
        self.preproducts.add_batch(batch);
        self.peers.update(self.party_id, |peer| {
            peer.preproduct_batches.insert(batch_id.clone());
        });
        tracing::debug!("preproduct batch {} generated", hex::encode(&batch_id[..6]));

        if let Some(reply) = self.reply_message(
            message,
            MpcMap {
                op_success: Some(true),
                ..MpcMap::default()
            },
        ) {
            self.respond_to(message, reply).await;
        }
    }

    // --- Handshake ----------------------------------------------------------

    /// Periodic half-key and readiness exchange with every peer.
    pub async fn handshake_task(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let timeout = self.config.mpc_lf_hello_timeout;
            self.say_hello(timeout).await;
            self.say_ready(timeout).await;
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {}
                _ = cancel.cancelled() => return,
            }
        }
    }

    async fn say_hello(&self, timeout: Duration) {
        let hello_peers: Vec<PeerState> = self
            .peers
            .snapshot()
            .into_iter()
            .filter(|peer| !peer.local && peer.last_hello_ack.is_none())
            .collect();
        if hello_peers.is_empty() {
            return;
        }
        let hello = PrismMessage {
            half_key: Some(self.keys.private_key.public()),
            sender: Some(self.pseudonym.clone()),
            ..self.request(Action::Hello, &random_id(), MpcMap::default())
        };
        tracing::debug!("sending key info to {} peers", hello_peers.len());
        let messages = vec![hello; hello_peers.len()];
        let responses = self
            .send_and_gather(&hello_peers, messages, None, timeout)
            .await;
        for response in responses {
            if let Some(party) = response.party_id {
                self.peers.update(party as usize, |peer| {
                    peer.last_hello_ack = Some(std::time::Instant::now());
                });
            }
        }
    }

    /// Handle a peer's hello: record its half-key and pseudonym.
    pub async fn hello_op(&self, message: &PrismMessage) {
        let (Some(party), Some(half_key), Some(sender)) =
            (message.party_id, &message.half_key, &message.sender)
        else {
            return;
        };
        self.peers.update(party as usize, |peer| {
            peer.half_key = Some(half_key.clone());
            peer.pseudonym = Some(sender.clone());
        });
        tracing::debug!("received half-key from party {party}");
        if let Some(reply) = self.reply_message(
            message,
            MpcMap {
                op_success: Some(true),
                ..MpcMap::default()
            },
        ) {
            self.respond_to(message, reply).await;
        }
    }

    async fn say_ready(&self, timeout: Duration) {
        if !(self.ready_fn)(self) {
            return;
        }
        self.peers.update(self.party_id, |peer| peer.ready = true);
        let ready_peers: Vec<PeerState> = self
            .peers
            .snapshot()
            .into_iter()
            .filter(|peer| !peer.local && peer.last_ready_ack.is_none())
            .collect();
        if ready_peers.is_empty() {
            return;
        }
        let ready = self.request(Action::Ready, &random_id(), MpcMap::default());
        let messages = vec![ready; ready_peers.len()];
        let responses = self
            .send_and_gather(&ready_peers, messages, None, timeout)
            .await;
        for response in responses {
            if let Some(party) = response.party_id {
                self.peers.update(party as usize, |peer| {
                    peer.last_ready_ack = Some(std::time::Instant::now());
                });
            }
        }
    }

    /// Handle a peer's readiness announcement.
    pub async fn ready_op(&self, message: &PrismMessage) {
        if let Some(party) = message.party_id {
            self.peers.update(party as usize, |peer| peer.ready = true);
        }
        if let Some(reply) = self.reply_message(
            message,
            MpcMap {
                op_success: Some(true),
                ..MpcMap::default()
            },
        ) {
            self.respond_to(message, reply).await;
        }
    }

    /// Handle committee-internal encrypted traffic: decrypt with the
    /// source peer's half-key and re-deliver locally so the usual hooks
    /// pick the inner message up.
    pub async fn handle_enc_peer(&self, message: &PrismMessage) {
        if message.dest_party_id != Some(self.party_id as u64) {
            return;
        }
        let Some(source) = message.party_id.and_then(|p| self.peers.get(p as usize)) else {
            return;
        };
        let Some(peer_key) = &source.half_key else {
            tracing::debug!("cannot decrypt peer message: no key for {}", source.name);
            return;
        };
        let Some(decrypted) = envelope::decrypt(message, &self.keys.private_key, Some(peer_key))
        else {
            return;
        };
        let redelivered = PrismMessage {
            dest_party_id: message.dest_party_id,
            pseudonym: decrypted.pseudonym.clone().or_else(|| message.pseudonym.clone()),
            ..decrypted
        };
        self.transport.deliver_local(redelivered);
    }
}
