//! The link-state router: accepts and refloods LSPs, maintains the routing
//! table, and forwards pseudonym-addressed traffic hop by hop.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc, watch};
use tokio_util::sync::CancellationToken;

use prism_transport::hooks::HookFilter;
use prism_transport::{EpochTransport, LinkProfile};
use prism_types::message::{MsgType, NeighborInfo, PrismMessage};
use prism_types::state::StateStore;

use crate::config::ServerConfig;
use crate::data::ServerData;
use crate::lsp::database::LsDatabase;
use crate::lsp::neighborhood::Neighborhood;
use crate::lsp::queue::{LsQueue, QItem, QKind};

/// One node's link-state routing instance, scoped to an epoch.
pub struct LsRouting {
    /// Our own pseudonym.
    pub own_pseudonym: Vec<u8>,
    own_name: String,
    own_cost: u64,
    transport: EpochTransport,
    config: Arc<ServerConfig>,
    /// The LSP database and routing table.
    pub db: Arc<LsDatabase>,
    /// Neighborhood liveness.
    pub neighborhood: Arc<Neighborhood>,
    dead_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    send_q: Arc<LsQueue>,
    ack_q: Arc<LsQueue>,
    own_ark: Mutex<Option<PrismMessage>>,
    started_tx: watch::Sender<bool>,
    fwd_tx: mpsc::Sender<PrismMessage>,
    fwd_rx: Mutex<Option<mpsc::Receiver<PrismMessage>>>,
    /// ARKs embedded in accepted LSPs are handed to the announcing role
    /// through this sink (set after construction to break the role ↔
    /// router cycle).
    ark_sink: Mutex<Option<mpsc::UnboundedSender<PrismMessage>>>,
    aliveness: Arc<Notify>,
}

impl LsRouting {
    /// Build a routing instance for this server.
    pub fn new(
        server_data: &ServerData,
        own_cost: u64,
        transport: EpochTransport,
        state_store: StateStore,
        config: Arc<ServerConfig>,
    ) -> Arc<Self> {
        let (neighborhood, dead_rx) = Neighborhood::new(
            server_data.id.clone(),
            server_data.pseudonym.clone(),
            transport.clone(),
            config.clone(),
        );
        let db = LsDatabase::new(
            server_data.pseudonym.clone(),
            config.ls_hops_max,
            state_store,
            config.nark_allow_cancel,
        );
        let (started_tx, _) = watch::channel(false);
        // Rendezvous-depth channel between routing decisions and sends.
        let (fwd_tx, fwd_rx) = mpsc::channel(1);
        let aliveness = neighborhood.aliveness_trigger.clone();
        Arc::new(Self {
            own_pseudonym: server_data.pseudonym.clone(),
            own_name: server_data.id.clone(),
            own_cost,
            transport,
            config,
            db,
            neighborhood,
            dead_rx: Mutex::new(Some(dead_rx)),
            send_q: LsQueue::new(QKind::Send),
            ack_q: LsQueue::new(QKind::Ack),
            own_ark: Mutex::new(None),
            started_tx,
            fwd_tx,
            fwd_rx: Mutex::new(Some(fwd_rx)),
            ark_sink: Mutex::new(None),
            aliveness,
        })
    }

    /// Allow routing to commence.
    pub fn start(&self) {
        // send_replace updates the value even with no live receivers.
        self.started_tx.send_replace(true);
    }

    /// Whether routing has been started.
    pub fn is_started(&self) -> bool {
        *self.started_tx.borrow()
    }

    async fn wait_started(&self) {
        let mut rx = self.started_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Install the sink receiving ARKs embedded in accepted LSPs.
    pub fn set_ark_sink(&self, sink: mpsc::UnboundedSender<PrismMessage>) {
        *self.ark_sink.lock() = Some(sink);
    }

    /// Update our own ARK; it rides inside our LSPs from now on.
    pub fn set_own_ark(&self, ark: PrismMessage) {
        *self.own_ark.lock() = Some(ark);
        self.aliveness.notify_one();
    }

    /// Force an immediate LSP refresh.
    pub fn trigger_aliveness(&self) {
        self.aliveness.notify_one();
    }

    fn create_own_lsp(&self) -> PrismMessage {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;
        PrismMessage {
            originator: Some(self.own_pseudonym.clone()),
            sender: Some(self.own_pseudonym.clone()),
            micro_timestamp: Some(micros),
            ttl: Some(self.config.ls_time_to_live),
            hop_count: Some(0),
            neighbors: Some(
                self.neighborhood
                    .other_neighbors()
                    .into_iter()
                    .map(|pseudonym| NeighborInfo {
                        pseudonym,
                        cost: self.own_cost,
                    })
                    .collect(),
            ),
            name: Some(self.own_name.clone()),
            sub_msg: self.own_ark.lock().clone().map(Box::new),
            ..PrismMessage::new(MsgType::Lsp)
        }
    }

    /// Resolve a pseudonym-addressed message to a concrete next-hop
    /// address, wrapping it in an LSP_FWD envelope when the destination is
    /// not a direct neighbor. Returns `("*", message)` when nothing better
    /// is known.
    pub async fn resolve_address(&self, message: PrismMessage) -> (String, PrismMessage) {
        let Some(pseudonym) = message.pseudonym.clone() else {
            tracing::error!("asked to resolve address for message without pseudonym");
            return ("*".into(), message);
        };
        if pseudonym == self.own_pseudonym {
            return (self.own_name.clone(), message);
        }

        let destination = hex::encode(&pseudonym);
        if let Some(next_hop) = self.next_hop_for(&destination) {
            let next_bytes = hex::decode(&next_hop).unwrap_or_default();
            match self.neighborhood.address_for(&next_bytes) {
                Some(address) => {
                    let wrapped = PrismMessage {
                        pseudonym: Some(next_bytes),
                        from_neighbor: Some(self.own_pseudonym.clone()),
                        sub_msg: Some(Box::new(message)),
                        ..PrismMessage::new(MsgType::LspFwd)
                    };
                    return (address, wrapped);
                }
                None => {
                    tracing::warn!(
                        "cannot resolve address for next hop {} - falling back to broadcast",
                        &next_hop[..6.min(next_hop.len())]
                    );
                    return ("*".into(), message);
                }
            }
        }

        match self.neighborhood.address_for(&pseudonym) {
            Some(address) => (address, message),
            None => ("*".into(), message),
        }
    }

    /// Next hop towards a destination, unless the destination is its own
    /// next hop (direct neighbor).
    pub fn next_hop_for(&self, destination: &str) -> Option<String> {
        self.db
            .next_hop(destination)
            .filter(|hop| hop != destination)
    }

    async fn emit_ls_msg(&self, address: &str, message: &PrismMessage) -> bool {
        let ok = self
            .transport
            .emit_on_links(
                address,
                message,
                Some(self.config.ls_neighbor_timeout),
                Some(&|profile: &LinkProfile| {
                    profile.can_send()
                        && profile.channel.connection_type
                            != prism_transport::enums::ConnectionType::Indirect
                }),
            )
            .await;
        if !ok {
            self.neighborhood.presume_dead(address);
        }
        ok
    }

    /// Emit a message, resolving its destination from its pseudonym unless
    /// `address` overrides it. Retries with backoff per configuration.
    pub async fn emit(&self, message: PrismMessage, address: Option<String>) -> bool {
        for attempt in 0..self.config.emit_retries.max(1) {
            let (target, outgoing) = match &address {
                Some(address) => (address.clone(), message.clone()),
                None => {
                    let (target, outgoing) = self.resolve_address(message.clone()).await;
                    if target == "*" && self.config.ls_routing && self.is_started() {
                        tracing::debug!("failed to resolve address; retrying");
                        tokio::time::sleep(self.config.sleep_try_emitting).await;
                        continue;
                    }
                    (target, outgoing)
                }
            };
            if self
                .transport
                .emit_on_links(&target, &outgoing, None, None)
                .await
            {
                return true;
            }
            tracing::debug!("emit to {target} failed (attempt {})", attempt + 1);
            tokio::time::sleep(self.config.sleep_try_emitting).await;
        }
        false
    }

    async fn handle_msg(self: &Arc<Self>, message: PrismMessage) {
        match message.msg_type {
            MsgType::Lsp => self.handle_lsp(message).await,
            MsgType::LspAck => {
                if let Some(from) = &message.from_neighbor {
                    self.neighborhood.set_alive(from);
                }
            }
            MsgType::LspFwd => {
                if let Some(from) = &message.from_neighbor {
                    self.neighborhood.set_alive(from);
                }
                let Some(inner) = message.sub_msg.map(|m| *m) else {
                    return;
                };
                if inner.pseudonym.as_deref() == Some(self.own_pseudonym.as_slice()) {
                    self.transport.deliver_local(inner);
                } else if self.fwd_tx.send(inner).await.is_err() {
                    tracing::warn!("forwarding loop is gone");
                }
            }
            _ => {}
        }
    }

    async fn handle_lsp(self: &Arc<Self>, message: PrismMessage) {
        let Some(originator) = message.originator.clone() else {
            return;
        };
        // Reject our own echoes and timestamps from the future.
        let micros_30s_ahead = (SystemTime::now() + Duration::from_secs(30))
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;
        if originator == self.own_pseudonym
            || message.micro_timestamp.unwrap_or(0) > micros_30s_ahead
        {
            return;
        }
        let sender = message.sender.clone().unwrap_or_default();
        let validated = PrismMessage {
            ttl: Some(message.ttl.unwrap_or(0).min(self.config.ls_ttl_max)),
            sender: Some(self.own_pseudonym.clone()),
            hop_count: Some(message.hop_count.unwrap_or(0) + 1),
            ..message
        };
        let hop_count = validated.hop_count.unwrap_or(0) as u64;
        let (updated, new_arks) = self.db.update_if(validated);

        if updated && hop_count < self.config.ls_hops_max {
            for neighbor in self.neighborhood.other_neighbors() {
                if neighbor != sender {
                    self.send_q.insert(QItem {
                        neighbor,
                        originator: originator.clone(),
                    });
                }
            }
        }
        if updated {
            self.db.update_routing_table();
        }

        self.ack_q.insert(QItem {
            neighbor: sender,
            originator: originator.clone(),
        });

        if let Some(sink) = self.ark_sink.lock().as_ref() {
            for ark in new_arks {
                let _ = sink.send(ark);
            }
        }
        self.neighborhood.set_alive(&originator);
    }

    async fn aliveness_loop(self: Arc<Self>, cancel: CancellationToken) {
        self.wait_started().await;
        tracing::debug!("starting LSP aliveness loop");
        loop {
            let own_lsp = self.create_own_lsp();
            let ttl = own_lsp.ttl.unwrap_or(0);
            let neighbors: Vec<Vec<u8>> = own_lsp
                .neighbors
                .as_deref()
                .unwrap_or_default()
                .iter()
                .map(|n| n.pseudonym.clone())
                .collect();
            let (updated, _) = self.db.update_if(own_lsp);
            debug_assert!(updated, "a fresh LSP always updates");
            for neighbor in neighbors {
                self.send_q.insert(QItem {
                    neighbor,
                    originator: self.own_pseudonym.clone(),
                });
            }
            self.db.update_routing_table();

            let refresh =
                Duration::from_secs_f64(self.config.ls_own_refresh * ttl as f64);
            tokio::select! {
                _ = tokio::time::sleep(refresh) => {}
                _ = self.aliveness.notified() => {
                    tracing::debug!("refreshing own LSP early (new ARK or changed neighbors)");
                }
                _ = cancel.cancelled() => return,
            }
        }
    }

    async fn listen_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut hook = self.transport.register_hook(HookFilter::TypeIn(vec![
            MsgType::Lsp,
            MsgType::LspAck,
            MsgType::LspFwd,
        ]));
        loop {
            tokio::select! {
                package = hook.recv() => {
                    let Some(package) = package else { return };
                    self.handle_msg(package.message).await;
                }
                _ = cancel.cancelled() => return,
            }
        }
    }

    async fn forwarding_loop(self: Arc<Self>, cancel: CancellationToken) {
        let Some(mut rx) = self.fwd_rx.lock().take() else {
            return;
        };
        loop {
            let message = tokio::select! {
                message = rx.recv() => message,
                _ = cancel.cancelled() => return,
            };
            let Some(message) = message else { return };
            let this = self.clone();
            tokio::spawn(async move {
                for attempt in 1..=this.config.ls_n_tries_forwarding.max(1) {
                    let (address, outgoing) = this.resolve_address(message.clone()).await;
                    if address != "*" && this.emit_ls_msg(&address, &outgoing).await {
                        return;
                    }
                    tracing::debug!("LSP forwarding attempt {attempt} failed");
                    tokio::time::sleep(this.config.ls_sleep_try_forwarding).await;
                }
            });
        }
    }

    async fn emitting_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<(QKind, QItem)>,
        cancel: CancellationToken,
    ) {
        loop {
            let item = tokio::select! {
                item = rx.recv() => item,
                _ = cancel.cancelled() => return,
            };
            let Some((kind, item)) = item else { return };
            let Some(address) = self.neighborhood.address_for(&item.neighbor) else {
                tracing::debug!("queue item for unknown neighbor - skipping");
                continue;
            };
            let Some(lsp) = self.db.lookup(&item.originator) else {
                tracing::warn!("no LSP known for queued originator");
                continue;
            };
            match kind {
                QKind::Send => {
                    self.emit_ls_msg(&address, &lsp).await;
                }
                QKind::Ack => {
                    let ack = PrismMessage {
                        from_neighbor: Some(self.own_pseudonym.clone()),
                        sender: lsp.sender.clone(),
                        originator: lsp.originator.clone(),
                        micro_timestamp: lsp.micro_timestamp,
                        ..PrismMessage::new(MsgType::LspAck)
                    };
                    self.emit_ls_msg(&address, &ack).await;
                }
            }
        }
    }

    async fn dead_neighbor_loop(self: Arc<Self>, cancel: CancellationToken) {
        let Some(mut rx) = self.dead_rx.lock().take() else {
            return;
        };
        loop {
            let pseudonym = tokio::select! {
                pseudonym = rx.recv() => pseudonym,
                _ = cancel.cancelled() => return,
            };
            let Some(pseudonym) = pseudonym else { return };
            self.db.remove(&pseudonym);
            self.send_q.remove_neighbor(&pseudonym);
            self.ack_q.remove_neighbor(&pseudonym);
            self.db.update_routing_table();
        }
    }

    /// Run the router until cancelled.
    pub async fn main_task(self: Arc<Self>, cancel: CancellationToken) {
        self.wait_started().await;
        tracing::info!("link-state routing started");

        let mut tasks = tokio::task::JoinSet::new();
        tasks.spawn(self.clone().forwarding_loop(cancel.clone()));
        tasks.spawn(self.clone().listen_loop(cancel.clone()));

        if self.config.control_traffic {
            tasks.spawn(self.clone().aliveness_loop(cancel.clone()));
            tasks.spawn(self.db.clone().expiry_task(cancel.clone()));
            tasks.spawn(self.neighborhood.clone().main_task(cancel.clone()));
            tasks.spawn(self.clone().dead_neighbor_loop(cancel.clone()));

            let (tx, rx) = mpsc::channel(64);
            tasks.spawn(self.send_q.clone().rate_limited_drain(
                tx.clone(),
                self.config.ls_q_rate_limit,
                cancel.clone(),
            ));
            tasks.spawn(self.ack_q.clone().rate_limited_drain(
                tx,
                self.config.ls_q_rate_limit,
                cancel.clone(),
            ));
            tasks.spawn(self.clone().emitting_loop(rx, cancel.clone()));
        } else {
            self.db.update_routing_table();
        }

        cancel.cancelled().await;
        tasks.abort_all();
    }
}
