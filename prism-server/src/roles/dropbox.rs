//! The lock-free MPC dropbox.
//!
//! Clients secret-share both the message and the recipient pseudonym and
//! encrypt each party's column for that party. Storing distributes the
//! encrypted submessages under a fresh random fragment id. Polling runs an
//! oblivious equality: each checked fragment's stored pseudonym share is
//! subtracted from the poll's pseudonym share and the difference is
//! multiplied by a shared random number; the opened product is zero exactly
//! when the pseudonyms match, and reveals nothing else.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::seq::SliceRandom as _;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use prism_core::envelope;
use prism_core::halfkey::PrivateHalfKey;
use prism_core::make_nonce;
use prism_core::random_id;
use prism_core::sharing::Sharing;
use prism_core::vrf::VrfSortition;
use prism_transport::Link;
use prism_types::message::{Action, MpcMap, MsgType, PrismMessage};
use prism_types::share::Share;

use crate::data::KeyMaterial;
use crate::flooding::Flooding;
use crate::metrics::{
    METRICS_ID_DROPBOX_ACTIVE_POLLS, METRICS_ID_DROPBOX_STORED_FRAGMENTS,
    METRICS_ID_DROPBOX_STORE_RETRIES,
};
use crate::mpc::engine::MpcEngine;
use crate::mpc::fragment::Fragment;
use crate::mpc::peer::{PeerState, PeerTable};
use crate::mpc::poll::Poll;
use crate::roles::announcer::{Announcer, ArkBehavior};
use crate::roles::context::RoleContext;

/// A retrieved message: one fragment id plus the per-peer re-encrypted
/// submessages collected for it.
struct RetrievedMessage {
    fragment_id: Vec<u8>,
    submessages: Vec<PrismMessage>,
}

/// The lock-free dropbox role of one committee member.
pub struct LockFreeDropbox {
    /// Shared role context.
    pub ctx: Arc<RoleContext>,
    /// Announcing machinery.
    pub announcer: Arc<Announcer>,
    /// The MPC engine; `None` when this server did not make the active
    /// committee for the epoch.
    pub engine: Option<Arc<MpcEngine>>,
    stored: Mutex<HashMap<Vec<u8>, Fragment>>,
    retrieved: Mutex<HashSet<Vec<u8>>>,
    store_sem: Arc<Semaphore>,
    find_sem: Arc<Semaphore>,
    active_polls: AtomicU64,
    accepting: AtomicBool,
    previous_flood: Option<Arc<Flooding>>,
}

impl LockFreeDropbox {
    /// Build the role, forming the committee from configuration (genesis)
    /// or from the previous epoch's flooded epoch-ARKs.
    pub fn new(
        ctx: Arc<RoleContext>,
        vrf_sortition: Option<VrfSortition>,
        previous_flood: Option<Arc<Flooding>>,
    ) -> eyre::Result<Arc<Self>> {
        let announcer = Announcer::new(ctx.clone(), vrf_sortition);
        let committee = Self::form_committee(&ctx, previous_flood.as_deref())?;

        let engine = match committee {
            Some((party_id, peers)) => {
                let parties = peers.len() as u64;
                let sharing =
                    Sharing::shamir(parties, ctx.config.threshold, ctx.config.modulus()?)
                        .map_err(|e| eyre::eyre!("bad sharing geometry: {e}"))?;
                let table = PeerTable::default();
                table.set_peers(peers);
                table.update(party_id, |peer| {
                    peer.local = true;
                    peer.pseudonym = Some(ctx.server_data.pseudonym.clone());
                    peer.half_key = Some(ctx.keys.private_key.public());
                });
                Some(MpcEngine::new(
                    ctx.transport.clone(),
                    ctx.config.clone(),
                    KeyMaterial {
                        private_key: ctx.keys.private_key.clone(),
                        identity: ctx.keys.identity.clone(),
                    },
                    ctx.server_data.pseudonym.clone(),
                    party_id,
                    table,
                    sharing,
                    Some(ctx.ls_routing.clone()),
                    Box::new(|engine: &MpcEngine| {
                        engine.peers.keyed_count() >= engine.preprocessing_threshold()
                    }),
                ))
            }
            None => None,
        };

        let role = Arc::new(Self {
            store_sem: Arc::new(Semaphore::new(
                ctx.config.mpc_lf_concurrent_store_limit.max(1),
            )),
            find_sem: Arc::new(Semaphore::new(
                ctx.config.mpc_lf_concurrent_find_limit.max(1),
            )),
            ctx,
            announcer,
            engine,
            stored: Mutex::new(HashMap::new()),
            retrieved: Mutex::new(HashSet::new()),
            active_polls: AtomicU64::new(0),
            accepting: AtomicBool::new(true),
            previous_flood,
        });
        role.announcer.set_behavior(role.clone());
        Ok(role)
    }

    /// Decide the committee membership and our party id.
    fn form_committee(
        ctx: &Arc<RoleContext>,
        previous_flood: Option<&Flooding>,
    ) -> eyre::Result<Option<(usize, Vec<PeerState>)>> {
        if ctx.epoch() == "genesis" {
            let members = ctx.config.genesis_committee();
            if members.is_empty() {
                eyre::bail!("genesis dropbox requires committee_members");
            }
            let party_id = ctx.config.party_id;
            if party_id < 0 {
                return Ok(None);
            }
            let peers = members
                .iter()
                .enumerate()
                .map(|(i, name)| PeerState::new(i, name.clone()))
                .collect();
            return Ok(Some((party_id as usize, peers)));
        }

        let Some(flood) = previous_flood else {
            eyre::bail!("epoch committee formation requires the previous epoch's flood");
        };
        let committee_name = ctx.server_data.committee.clone().unwrap_or_default();
        let mut members: Vec<PrismMessage> = flood
            .payloads()
            .into_iter()
            .filter(|eark| {
                eark.msg_type == MsgType::EpochArk
                    && eark.committee.as_deref() == Some(committee_name.as_str())
            })
            .collect();
        members.sort_by_key(|eark| eark.pseudonym.clone().map(hex::encode));
        members.truncate(ctx.config.mpc_nparties as usize);

        let minimum = ctx.config.threshold as usize + 1;
        if members.len() < minimum {
            tracing::error!(
                "not enough known members sorted into committee {committee_name}; idling until next epoch"
            );
            return Ok(None);
        }
        let party_id = members
            .iter()
            .position(|eark| eark.name.as_deref() == Some(ctx.server_data.id.as_str()));
        let Some(party_id) = party_id else {
            return Ok(None);
        };
        let peers = members
            .iter()
            .enumerate()
            .map(|(i, eark)| {
                let mut peer = PeerState::new(i, eark.name.clone().unwrap_or_default());
                peer.pseudonym = eark.pseudonym.clone();
                peer
            })
            .collect();
        tracing::debug!("committee {committee_name} formed with {} members", members.len());
        Ok(Some((party_id, peers)))
    }

    /// Stop accepting new client work; outstanding polls keep running.
    pub fn enter_handoff(&self) {
        self.accepting.store(false, Ordering::Relaxed);
    }

    /// Fragments currently stored on this peer (monitoring/tests).
    pub fn stored_fragment_count(&self) -> usize {
        self.stored.lock().len()
    }

    /// Run until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> eyre::Result<()> {
        let mut tasks = JoinSet::new();
        tasks.spawn(self.ctx.flooding.clone().listen_task(cancel.clone()));
        tasks.spawn(self.ctx.ls_routing.clone().main_task(cancel.clone()));

        let Some(engine) = self.engine.clone() else {
            // Not an active member; keep the control plane alive only.
            cancel.cancelled().await;
            tasks.abort_all();
            return Ok(());
        };

        tasks.spawn(self.announcer.clone().run(cancel.clone()));
        tasks.spawn(engine.clone().handshake_task(cancel.clone()));
        tasks.spawn(engine.clone().preproduct_task(cancel.clone()));
        tasks.spawn(self.clone().peer_link_task(cancel.clone()));
        tasks.spawn(self.clone().op_dispatch_loop(cancel.clone()));
        tasks.spawn(self.clone().enc_peer_loop(cancel.clone()));
        tasks.spawn(self.clone().dropbox_intake_loop(cancel.clone()));
        tasks.spawn(self.clone().fragment_janitor(cancel.clone()));
        if engine.is_leader() && self.ctx.config.dynamic_links {
            tasks.spawn(self.clone().outgoing_link_task(cancel.clone()));
        }

        cancel.cancelled().await;
        tasks.abort_all();
        Ok(())
    }

    fn engine(&self) -> &Arc<MpcEngine> {
        self.engine.as_ref().expect("active member tasks only")
    }

    async fn outgoing_link_task(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            self.announcer.maintain_outgoing_link("downlink").await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }

    /// Keep links to committee peers alive: load direct addresses in
    /// genesis, or the link addresses flooded with the peers' epoch-ARKs.
    async fn peer_link_task(self: Arc<Self>, cancel: CancellationToken) {
        let engine = self.engine().clone();
        loop {
            if cancel.is_cancelled() {
                return;
            }
            for peer in engine.peers.snapshot() {
                if peer.local
                    || !self
                        .ctx
                        .transport
                        .links_for_address(&peer.name)
                        .is_empty()
                {
                    continue;
                }
                self.load_peer_link(&peer).await;
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    async fn load_peer_link(&self, peer: &PeerState) {
        if self.ctx.epoch() != "genesis"
            && let Some(flood) = &self.previous_flood
        {
            let eark = flood.payloads().into_iter().find(|eark| {
                eark.msg_type == MsgType::EpochArk
                    && eark.name.as_deref() == Some(peer.name.as_str())
            });
            if let Some(eark) = eark
                && let Some(address) = eark.link_addresses.as_deref().and_then(<[_]>::first)
            {
                if self
                    .ctx
                    .transport
                    .load_address(address, &[peer.name.clone()])
                    .await
                    .is_some()
                {
                    return;
                }
            }
        }
        // Fall back to the configured direct address template.
        let address = self.ctx.config.direct_address_for(&peer.name);
        for channel in self.ctx.transport.channels() {
            if channel.descriptor().connection_type
                == prism_transport::enums::ConnectionType::Direct
                && channel
                    .load_link(&address, &[peer.name.clone()], &self.ctx.transport.epoch)
                    .await
                    .is_some()
            {
                return;
            }
        }
    }

    // --- Op dispatch --------------------------------------------------------

    async fn op_dispatch_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut hook = self.ctx.type_hook(true, vec![MsgType::MpcRequest]);
        loop {
            let package = tokio::select! {
                package = hook.recv() => package,
                _ = cancel.cancelled() => return,
            };
            let Some(package) = package else { return };
            let this = self.clone();
            tokio::spawn(async move { this.handle_op(package.message).await });
        }
    }

    async fn enc_peer_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut hook = self
            .ctx
            .type_hook(true, vec![MsgType::EncryptPeerMessage]);
        loop {
            let package = tokio::select! {
                package = hook.recv() => package,
                _ = cancel.cancelled() => return,
            };
            let Some(package) = package else { return };
            self.engine().handle_enc_peer(&package.message).await;
        }
    }

    async fn handle_op(&self, message: PrismMessage) {
        let Some(action) = message.mpc_map.as_ref().and_then(|mpc| mpc.action) else {
            return;
        };
        let engine = self.engine();
        match action {
            Action::OfflineInit => engine.preproduct_op(&message).await,
            Action::Hello => engine.hello_op(&message).await,
            Action::Ready => engine.ready_op(&message).await,
            Action::StoreFragment => self.handle_store_op(&message).await,
            Action::FindHandler => self.handle_find_op(&message).await,
            Action::Retrieve => self.handle_retrieve_op(&message).await,
            Action::Delete => self.handle_delete_op(&message).await,
            other => tracing::warn!("got request for unhandled op {other:?}"),
        }
    }

    // --- Client intake ------------------------------------------------------

    async fn dropbox_intake_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut hook = self
            .ctx
            .type_hook(true, vec![MsgType::EncryptDropboxMessage]);
        loop {
            let package = tokio::select! {
                package = hook.recv() => package,
                _ = cancel.cancelled() => return,
            };
            let Some(package) = package else { return };
            if !self.accepting.load(Ordering::Relaxed) {
                tracing::debug!("in handoff; ignoring new dropbox request");
                continue;
            }
            let Some(decrypted) = self.ctx.open_incoming(package.message) else {
                continue;
            };
            let this = self.clone();
            match decrypted.msg_type {
                MsgType::ReadObliviousDropbox => {
                    tokio::spawn(async move { this.poll_task(decrypted).await });
                }
                MsgType::WriteObliviousDropbox => {
                    tokio::spawn(async move { this.store_task(decrypted).await });
                }
                other => tracing::debug!("dropbox ignoring decrypted {other:?}"),
            }
        }
    }

    // --- Store --------------------------------------------------------------

    /// Store a write request, retrying with a fresh fragment id until at
    /// least `threshold` peers hold it.
    async fn store_task(&self, message: PrismMessage) {
        let submessages = message.submessages.unwrap_or_default();
        loop {
            let fragment_id = random_id();
            tracing::debug!("storing fragment {}", hex::encode(&fragment_id[..6]));
            let _permit = self
                .store_sem
                .acquire()
                .await
                .expect("semaphore never closed");
            if self.attempt_store(&fragment_id, &submessages).await {
                return;
            }
            ::metrics::counter!(METRICS_ID_DROPBOX_STORE_RETRIES).increment(1);
            tracing::debug!(
                "failed to store {} on enough peers; retrying with a fresh id",
                hex::encode(&fragment_id[..6])
            );
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
    }

    async fn attempt_store(&self, fragment_id: &[u8], submessages: &[PrismMessage]) -> bool {
        let engine = self.engine();
        let mut peers = Vec::new();
        let mut requests = Vec::new();
        for sub in submessages {
            let Some(party) = sub.party_id else { continue };
            let Some(peer) = engine.peers.get(party as usize) else {
                continue;
            };
            if engine.online(&peer) && !peer.stored_fragments.contains(fragment_id) {
                let request = PrismMessage {
                    sub_msg: Some(Box::new(sub.clone())),
                    ..engine.request(Action::StoreFragment, fragment_id, MpcMap::default())
                };
                peers.push(peer);
                requests.push(request);
            }
        }

        let responses = engine
            .send_and_gather(&peers, requests, None, self.ctx.config.mpc_lf_store_timeout)
            .await;
        for response in responses {
            if let Some(party) = response.party_id {
                engine.peers.update(party as usize, |peer| {
                    peer.stored_fragments.insert(fragment_id.to_vec());
                });
            }
        }

        let stored = engine
            .online_peers()
            .into_iter()
            .filter(|peer| peer.ready && peer.stored_fragments.contains(fragment_id))
            .count();
        if stored >= engine.sharing.threshold() {
            tracing::debug!(
                "stored {stored} fragments of {}",
                hex::encode(&fragment_id[..6])
            );
            true
        } else {
            false
        }
    }

    async fn handle_store_op(&self, message: &PrismMessage) {
        let engine = self.engine();
        let Some(fragment_id) = message
            .mpc_map
            .as_ref()
            .and_then(|mpc| mpc.request_id.clone())
        else {
            return;
        };
        let Some(encrypted) = message.sub_msg.as_deref() else {
            return;
        };
        let Some(decrypted) = envelope::decrypt(encrypted, &self.ctx.keys.private_key, None)
        else {
            tracing::debug!("error decrypting stored fragment");
            return;
        };
        let (Some(pseudonym_share), Some(ciphertext)) =
            (decrypted.pseudonym_share, decrypted.ciphertext)
        else {
            return;
        };

        let share = Share::new(pseudonym_share, engine.party_id as i64);
        let fragment = Fragment::new(fragment_id.clone(), share, ciphertext);
        self.stored.lock().insert(fragment_id.clone(), fragment);
        engine.peers.update(engine.party_id, |peer| {
            peer.stored_fragments.insert(fragment_id.clone());
        });
        ::metrics::gauge!(METRICS_ID_DROPBOX_STORED_FRAGMENTS)
            .set(self.stored.lock().len() as f64);
        tracing::debug!("stored fragment {}", hex::encode(&fragment_id[..6]));

        if let Some(reply) = engine.reply_message(
            message,
            MpcMap {
                op_success: Some(true),
                ..MpcMap::default()
            },
        ) {
            engine.respond_to(message, reply).await;
        }
    }

    // --- Poll / find --------------------------------------------------------

    /// Serve one poll: keep checking unchecked fragments until the poll
    /// expires (or once, when it carries no expiration).
    async fn poll_task(self: Arc<Self>, message: PrismMessage) {
        let Some(poll) = Poll::from_message(&message) else {
            return;
        };
        let poll = Arc::new(poll);
        let engine = self.engine().clone();
        self.active_polls.fetch_add(1, Ordering::Relaxed);
        ::metrics::gauge!(METRICS_ID_DROPBOX_ACTIVE_POLLS)
            .set(self.active_polls.load(Ordering::Relaxed) as f64);
        tracing::debug!(
            "poll {} started with {} shares (expiration {:?})",
            hex::encode(&poll.nonce[..6.min(poll.nonce.len())]),
            poll.peer_fragments.len(),
            poll.expiration,
        );

        let mut retrievals = JoinSet::new();
        while poll.live() {
            let threshold = engine.sharing.threshold();
            let limit = self.ctx.config.mpc_lf_find_limit;
            let mut fragments =
                poll.fragments_to_check(&engine.online_peers(), threshold, limit);
            while !fragments.is_empty() && poll.live() {
                let checked_before = poll.checked.lock().len();
                {
                    let _permit = self
                        .find_sem
                        .acquire()
                        .await
                        .expect("semaphore never closed");
                    self.attempt_poll(&poll, &fragments, &mut retrievals).await;
                }
                if poll.checked.lock().len() == checked_before {
                    // A failed op leaves its fragments unchecked; pace the
                    // retry instead of spinning on them.
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                fragments = poll.fragments_to_check(&engine.online_peers(), threshold, limit);
            }
            if poll.expiration.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        while retrievals.join_next().await.is_some() {}
        tracing::debug!(
            "poll {} ended",
            hex::encode(&poll.nonce[..6.min(poll.nonce.len())])
        );
        self.active_polls.fetch_sub(1, Ordering::Relaxed);
        ::metrics::gauge!(METRICS_ID_DROPBOX_ACTIVE_POLLS)
            .set(self.active_polls.load(Ordering::Relaxed) as f64);
        poll.close_links().await;
    }

    async fn attempt_poll(
        self: &Arc<Self>,
        poll: &Arc<Poll>,
        fragments: &HashSet<Vec<u8>>,
        retrievals: &mut JoinSet<()>,
    ) {
        let to_retrieve = self.check_task(poll, fragments).await;
        if to_retrieve.is_empty() {
            return;
        }
        tracing::debug!(
            "poll {} matched {} fragments",
            hex::encode(&poll.nonce[..6.min(poll.nonce.len())]),
            to_retrieve.len()
        );

        // Load the client's return links on first need.
        if !poll.link_addresses.is_empty() && poll.links.lock().is_empty() {
            for address in &poll.link_addresses {
                match self
                    .ctx
                    .transport
                    .load_address(address, &[hex::encode(&poll.nonce)])
                    .await
                {
                    Some(link) => poll.links.lock().push(link),
                    None => tracing::warn!("failed to load poll return address {address:?}"),
                }
            }
            if poll.links.lock().is_empty() {
                tracing::warn!("could not load any return links for poll");
                tokio::time::sleep(Duration::from_secs(5)).await;
                return;
            }
        }

        let this = self.clone();
        let poll = poll.clone();
        retrievals.spawn(async move {
            this.retrieve_and_delete(&poll, to_retrieve).await;
        });
    }

    /// Pick a threshold subset holding the fragments; prefer threshold+1
    /// so one straggler does not sink the op.
    fn peers_for_fragments(&self, poll: &Poll, fragments: &HashSet<Vec<u8>>) -> Vec<PeerState> {
        let engine = self.engine();
        let mut buddies: Vec<PeerState> = engine
            .online_peers()
            .into_iter()
            .filter(|peer| {
                !peer.local
                    && poll.peer_fragments.contains_key(&(peer.party_id as u64))
                    && fragments
                        .iter()
                        .all(|f| peer.stored_fragments.contains(f))
            })
            .collect();
        buddies.shuffle(&mut rand::thread_rng());
        buddies.truncate(engine.sharing.threshold());
        let mut op_peers = vec![engine.local_peer()];
        op_peers.extend(buddies);
        op_peers
    }

    /// One oblivious-equality round over `fragments`. Returns the matched
    /// fragment ids; everything that opened is marked checked.
    async fn check_task(&self, poll: &Arc<Poll>, fragments: &HashSet<Vec<u8>>) -> HashSet<Vec<u8>> {
        let engine = self.engine();
        let op_id = random_id();
        let op_peers = self.peers_for_fragments(poll, fragments);
        if op_peers.len() < engine.sharing.threshold() {
            tracing::warn!("not enough peers to run a find op");
            return HashSet::new();
        }

        let op_ids: Vec<usize> = op_peers.iter().map(|p| p.party_id).collect();
        let peers_table = &engine.peers;
        let info = engine
            .preproducts
            .claim_chunk(fragments.len(), || {
                op_ids
                    .iter()
                    .filter_map(|id| peers_table.get(*id))
                    .collect()
            })
            .await;
        let targets: Vec<Vec<u8>> = fragments
            .iter()
            .take(info.size() as usize)
            .cloned()
            .collect();

        let requests: Vec<PrismMessage> = op_peers
            .iter()
            .map(|peer| {
                let sub = poll.peer_fragments.get(&(peer.party_id as u64)).cloned();
                PrismMessage {
                    sub_msg: sub.map(Box::new),
                    ..engine.request(
                        Action::FindHandler,
                        &op_id,
                        MpcMap {
                            participants: Some(
                                op_peers.iter().map(|p| p.party_id as u64).collect(),
                            ),
                            target_fragments: Some(targets.clone()),
                            preproduct_info: Some(info.clone()),
                            ..MpcMap::default()
                        },
                    )
                }
            })
            .collect();

        let timeout = self.ctx.config.mpc_lf_check_timeout
            + engine.timeout_padding(4, 1000 * targets.len(), op_peers.len());
        let responses = engine
            .send_and_gather(&op_peers, requests, None, timeout)
            .await;
        let successes: Vec<&PrismMessage> = responses
            .iter()
            .filter(|m| {
                m.mpc_map
                    .as_ref()
                    .and_then(|mpc| mpc.op_success)
                    .unwrap_or(false)
            })
            .collect();
        if successes.len() < engine.sharing.threshold() {
            tracing::warn!(
                "not enough successful find responses ({}/{})",
                successes.len(),
                engine.sharing.threshold()
            );
            return HashSet::new();
        }

        let rows: Vec<Vec<Share>> = successes
            .iter()
            .filter_map(|m| m.mpc_map.as_ref().and_then(|mpc| mpc.shares.clone()))
            .filter(|row| row.len() == targets.len())
            .collect();
        let mut matched = HashSet::new();
        let mut checked = poll.checked.lock();
        for (i, target) in targets.iter().enumerate() {
            let column: Vec<Share> = rows.iter().map(|row| row[i].clone()).collect();
            match engine.sharing.open(&column) {
                Ok(value) => {
                    checked.insert(target.clone());
                    if value == num_bigint::BigUint::default() {
                        matched.insert(target.clone());
                    }
                }
                Err(_) => {
                    // Unopenable column (dummies); leave it unchecked for a
                    // later round with different peers.
                }
            }
        }
        matched
    }

    /// Peer side of the find op: compute `r·(stored − polled)` shares.
    async fn handle_find_op(&self, message: &PrismMessage) {
        let engine = self.engine();
        let Some(mpc) = &message.mpc_map else { return };
        let (Some(op_id), Some(targets), Some(participants), Some(info)) = (
            &mpc.request_id,
            &mpc.target_fragments,
            &mpc.participants,
            &mpc.preproduct_info,
        ) else {
            return;
        };
        let mut sorted_participants = participants.clone();
        sorted_participants.sort_unstable();
        let op_peers: Vec<PeerState> = sorted_participants
            .iter()
            .filter_map(|id| engine.peers.get(*id as usize))
            .filter(|peer| engine.online(peer))
            .collect();

        let Some(chunk) = engine.preproducts.get_chunk(info) else {
            tracing::debug!("find op failed to acquire preproducts");
            return;
        };
        let Some(sub) = message.sub_msg.as_deref() else {
            return;
        };
        let Some(read_peer) = envelope::decrypt(sub, &self.ctx.keys.private_key, None) else {
            tracing::debug!("find op failed to decrypt poll share");
            return;
        };
        let Some(pseudonym_share) = read_peer.pseudonym_share else {
            return;
        };
        let pseudo_share = Share::new(pseudonym_share, engine.party_id as i64);

        let diffs: Vec<Share> = {
            let stored = self.stored.lock();
            targets
                .iter()
                .map(|id| {
                    let fragment = stored.get(id).cloned().unwrap_or_else(Fragment::dummy);
                    engine.sharing.sub(&fragment.pseudonym_share, &pseudo_share)
                })
                .collect()
        };

        let rand_diffs = engine
            .mulm(&diffs, &chunk.random_numbers, &chunk.triples, &op_peers, op_id)
            .await;
        if rand_diffs.is_empty() {
            return;
        }
        if let Some(reply) = engine.reply_message(
            message,
            MpcMap {
                op_success: Some(true),
                shares: Some(rand_diffs),
                ..MpcMap::default()
            },
        ) {
            engine.respond_to(message, reply).await;
        }
    }

    // --- Retrieve / reply / delete ------------------------------------------

    async fn retrieve_and_delete(self: &Arc<Self>, poll: &Arc<Poll>, fragments: HashSet<Vec<u8>>) {
        let results = self.retrieve_task(poll, &fragments).await;
        let mut set = JoinSet::new();
        for result in results {
            let this = self.clone();
            let poll = poll.clone();
            set.spawn(async move { this.reply_and_delete(&poll, result).await });
        }
        while set.join_next().await.is_some() {}
    }

    async fn retrieve_task(
        &self,
        poll: &Arc<Poll>,
        fragments: &HashSet<Vec<u8>>,
    ) -> Vec<RetrievedMessage> {
        let engine = self.engine();
        let op_id = random_id();
        let peers: Vec<PeerState> = engine
            .online_peers()
            .into_iter()
            .filter(|peer| {
                poll.peer_fragments.contains_key(&(peer.party_id as u64))
                    && fragments
                        .iter()
                        .any(|f| peer.stored_fragments.contains(f))
            })
            .collect();
        let requests: Vec<PrismMessage> = peers
            .iter()
            .map(|peer| {
                let sub = poll.peer_fragments.get(&(peer.party_id as u64)).cloned();
                PrismMessage {
                    sub_msg: sub.map(Box::new),
                    ..engine.request(
                        Action::Retrieve,
                        &op_id,
                        MpcMap {
                            target_fragments: Some(fragments.iter().cloned().collect()),
                            ..MpcMap::default()
                        },
                    )
                }
            })
            .collect();

        let responses = engine
            .send_and_gather(&peers, requests, None, self.ctx.config.mpc_lf_retrieve_timeout)
            .await;
        tracing::debug!("retrieve got {} responses", responses.len());

        let mut per_fragment: HashMap<Vec<u8>, Vec<PrismMessage>> = fragments
            .iter()
            .map(|f| (f.clone(), Vec::new()))
            .collect();
        for response in &responses {
            let (Some(mpc), Some(subs)) = (&response.mpc_map, &response.submessages) else {
                continue;
            };
            let Some(found) = &mpc.target_fragments else {
                continue;
            };
            for (fragment_id, sub) in found.iter().zip(subs) {
                if let Some(bucket) = per_fragment.get_mut(fragment_id) {
                    bucket.push(sub.clone());
                }
            }
        }

        per_fragment
            .into_iter()
            .filter(|(_, subs)| subs.len() >= engine.sharing.threshold())
            .map(|(fragment_id, submessages)| RetrievedMessage {
                fragment_id,
                submessages,
            })
            .collect()
    }

    async fn reply_and_delete(&self, poll: &Arc<Poll>, retrieved: RetrievedMessage) {
        let Some(reply) = poll.reply(retrieved.submessages) else {
            return;
        };
        while !self.reply_to_client(poll, &reply).await {
            let retry = self.ctx.config.mpc_lf_reply_retry;
            tracing::debug!("reply attempt failed; retrying in {retry:?}");
            tokio::time::sleep(retry).await;
        }
        tracing::debug!(
            "sent retrieved fragment {} to client",
            hex::encode(&retrieved.fragment_id[..6])
        );
        self.delete_task(retrieved.fragment_id).await;
    }

    /// Race the reply over the poll's return links; fall back to broadcast
    /// links when the client supplied none.
    async fn reply_to_client(&self, poll: &Arc<Poll>, reply: &PrismMessage) -> bool {
        let links: Vec<Arc<dyn Link>> = poll.links.lock().clone();
        if !links.is_empty() {
            let mut set = JoinSet::new();
            for link in links {
                let reply = reply.clone();
                set.spawn(async move { link.send(reply, None).await });
            }
            let race = async {
                while let Some(result) = set.join_next().await {
                    if matches!(result, Ok(true)) {
                        set.abort_all();
                        return true;
                    }
                }
                false
            };
            return tokio::time::timeout(self.ctx.config.db_reply_timeout, race)
                .await
                .unwrap_or(false);
        }

        let outgoing: Vec<Arc<dyn Link>> = self.announcer.outgoing_links.lock().clone();
        if !outgoing.is_empty() {
            let mut success = false;
            for link in outgoing {
                success |= link.send(reply.clone(), None).await;
            }
            return success;
        }

        self.ctx
            .transport
            .emit_on_links(
                "*client",
                reply,
                Some(self.ctx.config.db_reply_timeout),
                None,
            )
            .await
    }

    /// Peer side of retrieve: re-encrypt each held fragment's ciphertext
    /// under a fresh half-key against the client's poll key.
    async fn handle_retrieve_op(&self, message: &PrismMessage) {
        let engine = self.engine();
        let Some(mpc) = &message.mpc_map else { return };
        let Some(targets) = &mpc.target_fragments else {
            return;
        };
        let Some(sub) = message.sub_msg.as_deref() else {
            return;
        };
        let Some(req_info) = envelope::decrypt(sub, &self.ctx.keys.private_key, None) else {
            return;
        };
        let Some(client_key) = req_info.half_key else {
            return;
        };

        tracing::debug!("asked to retrieve {} fragments", targets.len());
        let mut found = Vec::new();
        let mut submessages = Vec::new();
        {
            let stored = self.stored.lock();
            for target in targets {
                let Some(fragment) = stored.get(target) else {
                    continue;
                };
                let key = PrivateHalfKey::generate();
                let nonce = make_nonce();
                let Some(ciphertext) =
                    envelope::encrypt_data(&fragment.ciphertext, &key, &client_key, &nonce)
                else {
                    continue;
                };
                found.push(target.clone());
                submessages.push(PrismMessage {
                    party_id: Some(engine.party_id as u64),
                    nonce: Some(nonce),
                    half_key: Some(key.public()),
                    ciphertext: Some(ciphertext),
                    ..PrismMessage::new(MsgType::EncryptedMessageFragment)
                });
            }
        }

        if let Some(reply) = engine.reply_message(
            message,
            MpcMap {
                op_success: Some(true),
                target_fragments: Some(found),
                ..MpcMap::default()
            },
        ) {
            let reply = PrismMessage {
                submessages: Some(submessages),
                ..reply
            };
            engine.respond_to(message, reply).await;
        }
    }

    /// Fire-and-forget deletion across the peers believed to hold the
    /// fragment. A missed delete costs storage until the TTL sweep, never
    /// correctness.
    async fn delete_task(&self, fragment_id: Vec<u8>) {
        let engine = self.engine();
        let op_id = random_id();
        let request = engine.request(
            Action::Delete,
            &op_id,
            MpcMap {
                target_fragments: Some(vec![fragment_id.clone()]),
                ..MpcMap::default()
            },
        );
        let peers: Vec<PeerState> = engine
            .online_peers()
            .into_iter()
            .filter(|peer| peer.stored_fragments.contains(&fragment_id))
            .collect();
        for peer in &peers {
            engine.peers.update(peer.party_id, |p| {
                p.stored_fragments.remove(&fragment_id);
            });
        }
        let requests = vec![request; peers.len()];
        engine.send_to_peers(&peers, requests).await;
    }

    async fn handle_delete_op(&self, message: &PrismMessage) {
        let Some(targets) = message
            .mpc_map
            .as_ref()
            .and_then(|mpc| mpc.target_fragments.clone())
        else {
            return;
        };
        let engine = self.engine();
        let mut stored = self.stored.lock();
        for fragment_id in targets {
            if stored.remove(&fragment_id).is_some() {
                tracing::debug!("deleted fragment {}", hex::encode(&fragment_id[..6]));
                self.retrieved.lock().insert(fragment_id.clone());
            }
            engine.peers.update(engine.party_id, |peer| {
                peer.stored_fragments.remove(&fragment_id);
            });
        }
        ::metrics::gauge!(METRICS_ID_DROPBOX_STORED_FRAGMENTS).set(stored.len() as f64);
    }

    /// Drop fragments past their TTL; handles fragments orphaned by store
    /// retries whose delete never arrived.
    async fn fragment_janitor(self: Arc<Self>, cancel: CancellationToken) {
        let Some(ttl) = self.ctx.config.mpc_lf_fragment_ttl else {
            return;
        };
        let engine = self.engine().clone();
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let mut dropped = Vec::new();
                    self.stored.lock().retain(|id, fragment| {
                        if fragment.stored_at.elapsed() < ttl {
                            true
                        } else {
                            dropped.push(id.clone());
                            false
                        }
                    });
                    for id in dropped {
                        tracing::debug!("expired fragment {}", hex::encode(&id[..6]));
                        engine.peers.update(engine.party_id, |peer| {
                            peer.stored_fragments.remove(&id);
                        });
                    }
                }
                _ = cancel.cancelled() => return,
            }
        }
    }
}

impl ArkBehavior for LockFreeDropbox {
    fn ark_ready(&self) -> bool {
        match &self.engine {
            Some(engine) => {
                engine.is_leader() && engine.preproducts.total_remaining(&[], false) > 0
            }
            None => false,
        }
    }

    fn ark_broadcasting(&self) -> bool {
        self.engine
            .as_ref()
            .is_some_and(|engine| engine.is_leader() && !self.ctx.config.ls_routing)
    }

    fn ark_data(&self, base: PrismMessage) -> Option<PrismMessage> {
        let engine = self.engine.as_ref()?;
        let worker_keys: Vec<Option<prism_types::message::HalfKeyMap>> = engine
            .peers
            .snapshot()
            .iter()
            .map(PeerState::ark_key)
            .collect();
        // Announcing a committee before every worker key is known would
        // hand clients an unusable sharing target.
        if worker_keys.iter().any(Option::is_none) {
            return None;
        }
        Some(PrismMessage {
            secret_sharing: Some(engine.sharing.parameters().clone()),
            worker_keys: Some(worker_keys),
            ..base
        })
    }
}
