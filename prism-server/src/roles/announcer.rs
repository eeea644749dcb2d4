//! The announcing machinery shared by every serving role: minting and
//! re-minting the server's own ARK, broadcasting known ARKs to clients,
//! verifying and recording ARKs heard from the network, two-phase NARK
//! death notices, and link maintenance.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use prism_core::cert::{sign_ark, verify_ark};
use prism_core::make_nonce;
use prism_core::vrf::VrfSortition;
use prism_transport::Link;
use prism_transport::hooks::HookFilter;
use prism_types::message::{MsgType, PrismMessage, create_ark};

use crate::ark_store::ArkStore;
use crate::metrics::METRICS_ID_NARKS_SENT;
use crate::roles::context::RoleContext;

/// Role-specific hooks into the announcing machinery.
pub trait ArkBehavior: Send + Sync {
    /// Whether the role has enough state to announce at all.
    fn ark_ready(&self) -> bool {
        true
    }

    /// Whether this role broadcasts ARKs towards clients.
    fn ark_broadcasting(&self) -> bool {
        true
    }

    /// Augment the base ARK with role-specific fields; `None` postpones
    /// announcing (e.g. a committee still collecting worker keys).
    fn ark_data(&self, base: PrismMessage) -> Option<PrismMessage> {
        Some(base)
    }
}

struct DefaultBehavior;

impl ArkBehavior for DefaultBehavior {}

/// The announcing state of one role.
pub struct Announcer {
    ctx: Arc<RoleContext>,
    /// ARKs heard and verified this epoch.
    pub ark_store: Arc<Mutex<ArkStore>>,
    handoff_store: Mutex<Option<Arc<Mutex<ArkStore>>>>,
    /// The sortition in force, for proof verification; `None` in genesis.
    pub vrf_sortition: Option<VrfSortition>,
    /// Links this role receives client traffic on.
    pub incoming_links: Mutex<Vec<Arc<dyn Link>>>,
    /// Broadcast links towards clients.
    pub outgoing_links: Mutex<Vec<Arc<dyn Link>>>,
    behavior: Mutex<Weak<dyn ArkBehavior>>,
    ark_rx: Mutex<Option<mpsc::UnboundedReceiver<PrismMessage>>>,
}

impl Announcer {
    /// Build the announcer for a role; the role installs its behavior
    /// afterwards via [`Self::set_behavior`].
    pub fn new(ctx: Arc<RoleContext>, vrf_sortition: Option<VrfSortition>) -> Arc<Self> {
        let ark_store = Arc::new(Mutex::new(ArkStore::new(
            ctx.state_store.clone(),
            ctx.epoch(),
        )));
        let (ark_tx, ark_rx) = mpsc::unbounded_channel();
        // ARKs embedded in accepted LSPs flow into the same intake.
        ctx.ls_routing.set_ark_sink(ark_tx);
        let unset: Weak<dyn ArkBehavior> = Weak::<DefaultBehavior>::new();
        Arc::new(Self {
            ctx,
            ark_store,
            handoff_store: Mutex::new(None),
            vrf_sortition,
            incoming_links: Mutex::new(Vec::new()),
            outgoing_links: Mutex::new(Vec::new()),
            behavior: Mutex::new(unset),
            ark_rx: Mutex::new(Some(ark_rx)),
        })
    }

    /// Install the role's behavior (held weakly to avoid a cycle).
    pub fn set_behavior(&self, behavior: Arc<dyn ArkBehavior>) {
        *self.behavior.lock() = Arc::downgrade(&behavior);
    }

    fn with_behavior<R>(&self, f: impl FnOnce(&dyn ArkBehavior) -> R, default: R) -> R {
        match self.behavior.lock().upgrade() {
            Some(behavior) => f(behavior.as_ref()),
            None => default,
        }
    }

    /// During handoff, broadcast from the successor epoch's store instead
    /// of our own.
    pub fn set_handoff_store(&self, store: Arc<Mutex<ArkStore>>) {
        *self.handoff_store.lock() = Some(store);
    }

    /// The unsigned, untimestamped ARK content for this role.
    fn ark_content(&self) -> Option<PrismMessage> {
        let ctx = &self.ctx;
        let mut base = create_ark(
            ctx.keys.identity.certificate.clone(),
            ctx.server_data.pseudonym.clone(),
            ctx.server_data.id.clone(),
            ctx.server_data.role_name.clone(),
            ctx.server_data.epoch.clone(),
        );
        base.half_key = Some(ctx.keys.private_key.public());
        base.committee = ctx.server_data.committee.clone();
        base.proof = ctx.server_data.proof.clone();
        base.dropbox_index = ctx.server_data.dropbox_index;
        base.nonce = Some(make_nonce());
        base.origination_timestamp = None;

        let incoming: Vec<_> = self
            .incoming_links
            .lock()
            .iter()
            .map(|link| link.profile().address())
            .collect();
        if !incoming.is_empty() {
            base.link_addresses = Some(incoming);
        }
        let outgoing: Vec<_> = self
            .outgoing_links
            .lock()
            .iter()
            .map(|link| link.profile().address())
            .collect();
        if !outgoing.is_empty() {
            base.broadcast_addresses = Some(outgoing);
        }
        let fallback = Some(base.clone());
        self.with_behavior(move |b| b.ark_data(base), fallback)
    }

    /// Mint, sign, store, and publish our own ARK whenever its content
    /// changes or the re-mint interval passes.
    async fn ark_update_loop(self: Arc<Self>, cancel: CancellationToken) {
        tracing::debug!("starting ARK update loop");
        if self.ctx.config.ls_routing {
            self.ctx.ls_routing.start();
        }

        let interval = self.ctx.config.cs2_ark_timeout;
        let mut last_content: Option<Vec<u8>> = None;
        let mut last_update: Option<Instant> = None;
        loop {
            if cancel.is_cancelled() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;

            if !self.with_behavior(|b| b.ark_ready(), false) {
                continue;
            }
            let Some(content) = self.ark_content() else {
                continue;
            };
            // Nonce aside, unchanged content within the interval is a no-op.
            let mut comparable = content.clone();
            comparable.nonce = None;
            let encoded = comparable.encode();
            if last_content.as_deref() == Some(encoded.as_slice())
                && last_update.is_some_and(|t| t.elapsed() < interval)
            {
                continue;
            }
            last_content = Some(encoded);
            last_update = Some(Instant::now());

            let expiration = SystemTime::now()
                + interval.mul_f64(self.ctx.config.cs2_ark_expiration_factor.max(1.0));
            let micros = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_micros() as u64;
            let unsigned = PrismMessage {
                expiration: Some(
                    expiration
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_secs(),
                ),
                micro_timestamp: Some(micros),
                ..content
            };
            let signed = sign_ark(unsigned, &self.ctx.keys.identity.signing_key);
            tracing::debug!("updated own ARK");
            self.ark_store.lock().record(signed.clone(), true);

            if self.ctx.ls_routing.is_started() {
                // Ride inside our LSPs.
                self.ctx.ls_routing.set_own_ark(signed);
            } else {
                self.ctx.emit(signed, Some("*".into())).await;
            }
        }
    }

    fn broadcast_links(&self) -> Vec<Arc<dyn Link>> {
        let mut links = self.ctx.transport.links_for_address("*client");
        links.extend(self.outgoing_links.lock().iter().cloned());
        links
    }

    fn ark_mtu(&self, links: &[Arc<dyn Link>]) -> usize {
        let mut mtu = self.ctx.config.cs2_arks_max_mtu;
        for link in links {
            if let Some(link_mtu) = link.profile().channel.mtu
                && link_mtu > 0
            {
                mtu = mtu.min(link_mtu);
            }
        }
        mtu
    }

    /// Broadcast a message on every client-facing link, pacing between
    /// links.
    pub async fn broadcast(&self, message: &PrismMessage) {
        let links = self.broadcast_links();
        let count = links.len();
        for (i, link) in links.into_iter().enumerate() {
            link.send(message.clone(), None).await;
            if i + 1 != count {
                tokio::time::sleep(self.ctx.config.cs2_ark_sleep_time).await;
            }
        }
    }

    /// Periodically pack the least-recently-broadcast ARKs into an `ARKS`
    /// batch bounded by the channel MTU and send it to clients. During
    /// handoff, the successor epoch's store is broadcast instead.
    async fn ark_broadcast_loop(self: Arc<Self>, cancel: CancellationToken) {
        tracing::debug!("starting ARK broadcast loop");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.ctx.config.cs2_ark_sleep_time) => {}
                _ = cancel.cancelled() => return,
            }
            let ready = self.with_behavior(|b| b.ark_ready() && b.ark_broadcasting(), false);
            if !ready {
                continue;
            }

            let links = self.broadcast_links();
            if links.is_empty() {
                tracing::debug!("no links to broadcast ARKs on");
                continue;
            }
            let mtu = self.ark_mtu(&links);

            let store = self
                .handoff_store
                .lock()
                .clone()
                .unwrap_or_else(|| self.ark_store.clone());
            let message = store
                .lock()
                .broadcast_message(&self.ctx.server_data, mtu);
            let Some(message) = message else {
                tracing::debug!("no ARKs to broadcast");
                continue;
            };
            let count = message.submessages.as_deref().map_or(0, <[_]>::len);
            tracing::debug!("broadcasting {count} ARKs");
            self.broadcast(&message).await;
        }
    }

    /// Verify and record every ARK heard, whether broadcast directly or
    /// carried inside an accepted LSP.
    async fn ark_listen_loop(self: Arc<Self>, cancel: CancellationToken) {
        let own_pseudonym = self.ctx.server_data.pseudonym.clone();
        let mut hook = self
            .ctx
            .transport
            .register_hook(HookFilter::TypeIn(vec![MsgType::AnnounceRoleKey]));
        let Some(mut lsp_arks) = self.ark_rx.lock().take() else {
            return;
        };
        loop {
            let ark = tokio::select! {
                package = hook.recv() => package.map(|p| p.message),
                ark = lsp_arks.recv() => ark,
                _ = cancel.cancelled() => return,
            };
            let Some(ark) = ark else { return };
            if ark.pseudonym.as_deref() == Some(own_pseudonym.as_slice()) {
                continue;
            }
            if verify_ark(
                &ark,
                self.vrf_sortition.as_ref(),
                &self.ctx.keys.identity.root_key,
            ) {
                self.ark_store.lock().record(ark, false);
            } else {
                tracing::warn!("could not verify ARK from {:?}", ark.name);
            }
        }
    }

    async fn reachable_now(&self) -> HashSet<String> {
        self.ctx.ls_routing.db.reachable_destinations()
    }

    /// Two-phase NARK loop: only pseudonyms unreachable in two samples
    /// separated by the confirmation window are published as dead; servers
    /// reachable again in both samples are promoted back up the broadcast
    /// queue.
    async fn nark_broadcast_loop(self: Arc<Self>, cancel: CancellationToken) {
        tracing::debug!("starting NARK broadcast loop");
        let mut previously_reachable: HashSet<String> = HashSet::new();
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let active = self.ctx.config.nark
                && self.with_behavior(|b| b.ark_broadcasting(), false);
            if !active {
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }

            let current1 = self.reachable_now().await;
            let newly1: HashSet<&String> = current1.difference(&previously_reachable).collect();
            let lost1: HashSet<String> = previously_reachable
                .difference(&current1)
                .cloned()
                .collect();
            if !newly1.is_empty() || !lost1.is_empty() {
                tokio::time::sleep(self.ctx.config.nark_confirmation).await;
                let current2 = self.reachable_now().await;
                let newly2: HashSet<&String> =
                    current2.difference(&previously_reachable).collect();
                for recovered in newly1.intersection(&newly2) {
                    if let Ok(pseudonym) = hex::decode(recovered) {
                        self.ark_store.lock().promote(&pseudonym);
                    }
                }
                let confirmed_lost: Vec<Vec<u8>> = lost1
                    .iter()
                    .filter(|p| !current2.contains(*p))
                    .filter_map(|p| hex::decode(p).ok())
                    .collect();
                if !confirmed_lost.is_empty() {
                    {
                        let mut store = self.ark_store.lock();
                        for pseudonym in &confirmed_lost {
                            store.remove(pseudonym);
                        }
                    }
                    let micros = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_micros() as u64;
                    let nark = PrismMessage {
                        pseudonym: Some(self.ctx.server_data.pseudonym.clone()),
                        micro_timestamp: Some(micros),
                        dead_servers: Some(confirmed_lost.clone()),
                        ..PrismMessage::new(MsgType::Nark)
                    };
                    tracing::debug!(
                        "sending NARK for {} unreachable servers",
                        confirmed_lost.len()
                    );
                    ::metrics::counter!(METRICS_ID_NARKS_SENT).increment(1);
                    self.broadcast(&nark).await;
                }
            }
            previously_reachable = current1;

            // Cooldown, cut short when routing reports a change.
            tokio::select! {
                _ = tokio::time::sleep(self.ctx.config.nark_timeout) => {}
                _ = self.ctx.ls_routing.db.nark_trigger.notified() => {}
                _ = cancel.cancelled() => return,
            }
        }
    }

    /// Keep an incoming link with the given tags alive for this epoch.
    pub async fn maintain_incoming_link(&self, tag: &str, return_id: &str) {
        let epoch = self.ctx.transport.epoch.clone();
        let have = self
            .incoming_links
            .lock()
            .iter()
            .any(|link| link.profile().epoch == epoch);
        if have {
            return;
        }
        let channel = self.ctx.transport.channels().into_iter().find(|c| {
            let desc = c.descriptor();
            desc.link_direction.sender_loaded()
                && desc.status.usable()
                && desc.tags.iter().any(|t| t == tag)
        });
        let Some(channel) = channel else { return };
        if let Some(link) = self
            .ctx
            .transport
            .create_link(&channel, &[return_id.to_owned()])
            .await
        {
            tracing::debug!("created incoming {tag} link {}", link.profile().link_id);
            self.incoming_links.lock().push(link);
        }
    }

    /// Keep an outgoing broadcast link with the given tag alive.
    pub async fn maintain_outgoing_link(&self, tag: &str) {
        if !self.outgoing_links.lock().is_empty() {
            return;
        }
        let channel = self.ctx.transport.channels().into_iter().find(|c| {
            let desc = c.descriptor();
            desc.link_direction.receiver_loaded()
                && desc.connection_type.client_ok()
                && desc.status.usable()
                && desc.tags.iter().any(|t| t == tag)
        });
        let Some(channel) = channel else { return };
        if let Some(link) = self
            .ctx
            .transport
            .create_link(&channel, &["*downlink".to_owned()])
            .await
        {
            tracing::debug!("created outgoing {tag} link {}", link.profile().link_id);
            self.outgoing_links.lock().push(link);
        }
    }

    /// Run every announcing loop until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if !self.ctx.config.control_traffic {
            self.ctx.ls_routing.db.update_routing_table();
            self.ctx.ls_routing.start();
            return;
        }
        let mut tasks = tokio::task::JoinSet::new();
        tasks.spawn(self.clone().ark_update_loop(cancel.clone()));
        tasks.spawn(self.clone().ark_listen_loop(cancel.clone()));
        tasks.spawn(self.clone().ark_broadcast_loop(cancel.clone()));
        tasks.spawn(self.clone().nark_broadcast_loop(cancel.clone()));
        cancel.cancelled().await;
        tasks.abort_all();
    }
}
