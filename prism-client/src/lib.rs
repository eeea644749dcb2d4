#![deny(missing_docs)]
//! The PRISM client pipeline.
//!
//! A [`PrismClient`] runs a set of cooperative tasks over a shared
//! transport: ARK intake (verify, merge, track reachability), the send log
//! drainer (route selection, onion wrapping, redundant dropbox posts), the
//! poll scheduler, receive-side dedupe and reassembly, link maintenance,
//! and IBE bootstrap against the registration committee.
//!
//! Received cleartexts land in the [`message_store::MessageStore`] and are
//! forwarded to an optional delegate channel.

pub mod config;
pub mod dedupe;
pub mod dropbox;
pub mod message_store;
pub mod routing;
pub mod send_log;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use ed25519_dalek::VerifyingKey;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use prism_core::cert::verify_ark;
use prism_core::envelope;
use prism_core::halfkey::PrivateHalfKey;
use prism_core::ibe::{EncryptedPayload, IbeCipher};
use prism_core::make_nonce;
use prism_core::pseudonym::Pseudonym;
use prism_transport::hooks::HookFilter;
use prism_transport::{EpochTransport, Link, Transport};
use prism_types::cleartext::ClearText;
use prism_types::epoch::EpochCommand;
use prism_types::message::{CipherKind, LinkAddress, MsgType, PrismMessage};
use prism_types::server_db::{ServerDb, ServerRecord};
use prism_types::state::StateStore;

use crate::config::ClientConfig;
use crate::dedupe::Deduplicator;
use crate::dropbox::Dropboxes;
use crate::message_store::MessageStore;
use crate::routing::find_route;
use crate::send_log::SendLog;

struct EpochsState {
    current: String,
    incoming: Option<String>,
    outgoing: Option<String>,
    transport: EpochTransport,
}

#[derive(Default)]
struct LinkSets {
    ark: Vec<Arc<dyn Link>>,
    return_links: Vec<Arc<dyn Link>>,
    broadcast: Vec<Arc<dyn Link>>,
}

struct RegistrationState {
    half_key: PrivateHalfKey,
    nonces: std::collections::HashMap<String, Vec<u8>>,
    shards: std::collections::HashMap<String, Vec<u8>>,
}

/// One client endpoint of the messaging network.
pub struct PrismClient {
    /// Client tunables.
    pub config: Arc<ClientConfig>,
    /// This client's pseudonym under the configured salt.
    pub pseudonym: Pseudonym,
    /// Log of sent and received cleartexts.
    pub message_store: MessageStore,
    base_transport: Arc<Transport>,
    root_key: Option<VerifyingKey>,
    ibe: Mutex<IbeCipher>,
    servers: Mutex<ServerDb>,
    dropboxes: Dropboxes,
    send_log: SendLog,
    incoming_dedupe: Deduplicator,
    outgoing_dedupe: Deduplicator,
    epochs: Mutex<EpochsState>,
    links: Mutex<LinkSets>,
    registration: Mutex<RegistrationState>,
    queued_encrypted: Mutex<Vec<PrismMessage>>,
    epoch_tx: mpsc::UnboundedSender<EpochCommand>,
    epoch_rx: Mutex<Option<mpsc::UnboundedReceiver<EpochCommand>>>,
    delegate: Mutex<Option<mpsc::UnboundedSender<ClearText>>>,
    cancel: CancellationToken,
}

impl PrismClient {
    /// Build a client over `transport`. `root_key` anchors ARK
    /// verification; without it every ARK is rejected, so only tests that
    /// feed records directly run without one.
    pub fn new(
        config: ClientConfig,
        transport: Arc<Transport>,
        root_key: Option<VerifyingKey>,
    ) -> Arc<Self> {
        let state_store = config
            .state_dir
            .as_ref()
            .map(StateStore::new)
            .unwrap_or_else(StateStore::ephemeral);

        let public_params = base64::engine::general_purpose::STANDARD
            .decode(&config.ibe_public_params)
            .unwrap_or_default();
        let private_key = config.ibe_private_key.as_ref().and_then(|b64| {
            base64::engine::general_purpose::STANDARD.decode(b64).ok()
        });
        let ibe = IbeCipher::load(config.name.clone(), private_key, public_params);

        let pseudonym = Pseudonym::from_address(&config.name, &config.pseudonym_salt);
        let mut servers = ServerDb::new(state_store, &config.bootstrap_epoch);
        for b64 in &config.bootstrap_arks {
            match PrismMessage::from_b64(b64) {
                Ok(ark) => {
                    servers.record(ark);
                }
                Err(err) => tracing::warn!("ignoring malformed bootstrap ARK: {err}"),
            }
        }

        let (epoch_tx, epoch_rx) = mpsc::unbounded_channel();
        let epoch = config.bootstrap_epoch.clone();
        let send_log = SendLog::new(config.dropbox_send_redundancy, config.poll_timing());
        let incoming_dedupe = Deduplicator::new(config.msg_seen_ttl, config.msg_seen_sleep);
        let outgoing_dedupe = Deduplicator::new(config.msg_seen_ttl, config.msg_seen_sleep);

        Arc::new(Self {
            pseudonym,
            message_store: MessageStore::new(),
            root_key,
            ibe: Mutex::new(ibe),
            servers: Mutex::new(servers),
            dropboxes: Dropboxes::new(),
            send_log,
            incoming_dedupe,
            outgoing_dedupe,
            epochs: Mutex::new(EpochsState {
                current: epoch.clone(),
                incoming: None,
                outgoing: None,
                transport: EpochTransport::new(transport.clone(), epoch),
            }),
            links: Mutex::new(LinkSets::default()),
            registration: Mutex::new(RegistrationState {
                half_key: PrivateHalfKey::generate(),
                nonces: std::collections::HashMap::new(),
                shards: std::collections::HashMap::new(),
            }),
            queued_encrypted: Mutex::new(Vec::new()),
            epoch_tx,
            epoch_rx: Mutex::new(Some(epoch_rx)),
            delegate: Mutex::new(None),
            base_transport: transport,
            config: Arc::new(config),
            cancel: CancellationToken::new(),
        })
    }

    /// Receive every cleartext this client delivers.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ClearText> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.delegate.lock() = Some(tx);
        rx
    }

    /// The cancellation token ending [`Self::run`].
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Enqueue an epoch command.
    pub fn epoch_command(&self, command: EpochCommand) {
        let _ = self.epoch_tx.send(command);
    }

    /// The epoch this client currently sends and polls in.
    pub fn current_epoch(&self) -> String {
        self.epochs.lock().current.clone()
    }

    fn current_transport(&self) -> EpochTransport {
        self.epochs.lock().transport.clone()
    }

    /// Feed an already-verified server record (bootstrap/test path).
    pub fn record_server(&self, ark: PrismMessage) {
        self.servers.lock().record(ark);
    }

    /// Names of currently valid servers known for `epoch`.
    pub fn known_servers(&self, epoch: &str) -> Vec<String> {
        self.servers
            .lock()
            .valid_servers()
            .into_iter()
            .filter(|rec| rec.epoch() == epoch)
            .map(|rec| rec.name().to_owned())
            .collect()
    }

    /// Outgoing messages still awaiting their redundancy target.
    pub fn backlog_len(&self) -> usize {
        self.send_log.len()
    }

    /// Whether the IBE private key has been bootstrapped.
    pub fn can_decrypt(&self) -> bool {
        self.ibe.lock().can_decrypt()
    }

    /// Queue a message for delivery.
    pub fn send_message(&self, clear: ClearText) {
        if clear.len() > self.config.max_plaintext_size {
            tracing::error!(
                "message size {} exceeds maximum {}",
                clear.len(),
                self.config.max_plaintext_size
            );
            return;
        }
        tracing::debug!("queueing message {} -> {}", clear.sender, clear.receiver);
        self.message_store.record(clear.clone());
        self.send_log.add(clear);
    }

    /// Run every client task until the cancellation token fires.
    pub async fn run(self: Arc<Self>) {
        let cancel = self.cancel.clone();
        let mut tasks = tokio::task::JoinSet::new();

        tasks.spawn({
            let client = self.clone();
            async move { client.send_task().await }
        });
        tasks.spawn({
            let client = self.clone();
            async move { client.receive_task().await }
        });
        tasks.spawn({
            let client = self.clone();
            async move { client.poll_task().await }
        });
        tasks.spawn({
            let client = self.clone();
            async move { client.epoch_command_task().await }
        });
        tasks.spawn({
            let client = self.clone();
            let cancel = cancel.clone();
            async move { client.incoming_dedupe.purge_task(cancel).await }
        });
        tasks.spawn({
            let client = self.clone();
            let cancel = cancel.clone();
            async move { client.outgoing_dedupe.purge_task(cancel).await }
        });
        tasks.spawn({
            let client = self.clone();
            async move { client.link_maintenance_task().await }
        });
        if !self.can_decrypt() {
            tasks.spawn({
                let client = self.clone();
                async move { client.bootstrap_task().await }
            });
        }

        cancel.cancelled().await;
        tasks.abort_all();
    }

    async fn send_task(&self) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let transitioning = self.epochs.lock().incoming.is_some();
            if transitioning {
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }
            let entry = {
                let servers = self.servers.lock();
                self.send_log.take(&servers)
            };
            if let Some(mut entry) = entry {
                self.attempt_send(&mut entry).await;
                self.send_log.put_back(entry);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn attempt_send(&self, entry: &mut send_log::SendLogEntry) {
        let epoch = self.current_epoch();
        let target_pseudonym =
            Pseudonym::from_address(&entry.message.receiver, &self.config.pseudonym_salt);
        let indices = target_pseudonym
            .dropbox_indices(self.config.dropbox_count, self.config.dropboxes_per_client);

        let remaining = entry.sends_remaining(self.config.dropbox_send_redundancy);
        let attempts: Vec<(ServerRecord, routing::MessageRoute)> = {
            let servers = self.servers.lock();
            let used = entry.dropboxes_sent();
            let mut candidates: Vec<ServerRecord> = servers
                .dropboxes_for_indices(&indices, &epoch)
                .into_iter()
                .filter(|rec| !used.contains(&rec.pseudonym.as_slice()))
                .cloned()
                .collect();
            {
                use rand::seq::SliceRandom as _;
                candidates.shuffle(&mut rand::thread_rng());
            }
            let first_hops = self.first_hops_locked(&servers, &epoch);
            candidates
                .into_iter()
                .take(remaining)
                .filter_map(|dropbox| {
                    find_route(
                        &servers,
                        &first_hops,
                        &dropbox,
                        self.config.onion_layers,
                        &epoch,
                    )
                    .map(|route| (dropbox, route))
                })
                .collect()
        };

        for (_dropbox, route) in attempts {
            let Some(wrapped) = self.wrap_message(&entry.message, &route) else {
                continue;
            };
            let head = route.head().name().to_owned();
            if self.post_message(&head, &wrapped).await {
                entry.sent(route);
            }
        }
    }

    fn wrap_message(
        &self,
        clear: &ClearText,
        route: &routing::MessageRoute,
    ) -> Option<PrismMessage> {
        let pseudonym = Pseudonym::from_address(&clear.receiver, &self.config.pseudonym_salt);
        let payload = if clear.use_ibe {
            let encrypted = self
                .ibe
                .lock()
                .encrypt(&clear.receiver, &clear.to_wire().encode());
            PrismMessage {
                cipher: Some(CipherKind::AesGcm),
                ciphertext: Some(encrypted.ciphertext),
                encrypted_msg_key: Some(encrypted.wrapped_key),
                nonce: Some(encrypted.nonce),
                ..PrismMessage::new(MsgType::EncryptUserMessage)
            }
        } else {
            PrismMessage::decode(clear.message_bytes.as_deref()?).ok()?
        };

        let request = self
            .dropboxes
            .write_request(&route.target, &pseudonym, &payload)?;
        route.wrap(request)
    }

    async fn post_message(&self, address: &str, message: &PrismMessage) -> bool {
        let transport = self.current_transport();
        for attempt in 0..self.config.emit_retries.max(1) {
            if transport.emit_on_links(address, message, None, None).await {
                return true;
            }
            tracing::debug!("post to {address} failed (attempt {})", attempt + 1);
            tokio::time::sleep(self.config.sleep_try_emitting).await;
        }
        false
    }

    fn first_hops_locked(&self, servers: &ServerDb, epoch: &str) -> Vec<ServerRecord> {
        let transport = self.epochs.lock().transport.clone();
        servers
            .valid_emixes()
            .into_iter()
            .filter(|rec| {
                rec.epoch() == epoch && !transport.links_for_address(rec.name()).is_empty()
            })
            .cloned()
            .collect()
    }

    async fn poll_task(&self) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            if self.config.polling {
                self.make_poll_requests().await;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// The dropbox shards serving this client's own pseudonym.
    fn my_dropboxes(&self) -> Vec<ServerRecord> {
        let epoch = self.current_epoch();
        let indices = self
            .pseudonym
            .dropbox_indices(self.config.dropbox_count, self.config.dropboxes_per_client);
        self.servers
            .lock()
            .dropboxes_for_indices(&indices, &epoch)
            .into_iter()
            .cloned()
            .collect()
    }

    async fn make_poll_requests(&self) {
        for dropbox in self.my_dropboxes() {
            if self.dropboxes.should_poll(&dropbox, self.config.poll_timing()) {
                self.poll_dropbox(&dropbox).await;
            }
        }
    }

    async fn poll_dropbox(&self, dropbox: &ServerRecord) {
        let epoch = self.current_epoch();
        let request_id = make_nonce();
        let route = {
            let servers = self.servers.lock();
            let first_hops = self.first_hops_locked(&servers, &epoch);
            find_route(
                &servers,
                &first_hops,
                dropbox,
                self.config.onion_layers,
                &epoch,
            )
        };
        let Some(route) = route else {
            tracing::debug!("no poll route to {}", dropbox.name());
            return;
        };

        let return_links: Vec<LinkAddress> = self
            .links
            .lock()
            .return_links
            .iter()
            .map(|link| link.profile().address())
            .collect();
        let expiration = self.config.dropbox_poll_with_duration.then(|| {
            (SystemTime::now() + self.config.poll_timing())
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
        });

        let Some(request) = self.dropboxes.read_request(
            dropbox,
            &self.pseudonym,
            request_id,
            return_links,
            expiration,
        ) else {
            tracing::debug!("could not build poll request for {}", dropbox.name());
            return;
        };
        let Some(onion) = route.wrap(request) else {
            return;
        };
        let head = route.head().name().to_owned();
        if self.post_message(&head, &onion).await {
            self.dropboxes.did_poll(dropbox);
        }
    }

    async fn receive_task(&self) {
        let mut hook = self.base_transport.register_hook(HookFilter::Any);
        loop {
            tokio::select! {
                package = hook.recv() => {
                    let Some(package) = package else { return };
                    self.process_message(&package.message);
                }
                _ = self.cancel.cancelled() => return,
            }
        }
    }

    fn process_message(&self, message: &PrismMessage) {
        if !self.incoming_dedupe.is_new(&message.encode()) {
            return;
        }
        match message.msg_type {
            MsgType::Arks => {
                let source = message.pseudonym.clone();
                let timestamp = message
                    .micro_timestamp
                    .map(|micros| UNIX_EPOCH + Duration::from_micros(micros));
                for ark in message.submessages.as_deref().unwrap_or_default() {
                    self.process_ark(ark, source.as_deref(), timestamp);
                }
            }
            MsgType::AnnounceRoleKey => self.process_ark(message, None, None),
            MsgType::Nark => self.process_nark(message),
            MsgType::EncryptUserMessage => {
                if self.can_decrypt() {
                    self.process_encrypted_user_message(message);
                } else {
                    tracing::debug!("queueing user message until IBE bootstrap finishes");
                    self.queued_encrypted.lock().push(message.clone());
                }
            }
            MsgType::EncryptRegistrationMessage => self.process_registration_message(message),
            MsgType::EncryptedReadObliviousDropboxResponse => {
                if self.dropboxes.registry.is_mine(message) {
                    match self.dropboxes.registry.reassemble(message) {
                        Some(inner) => self.process_message(&inner),
                        None => tracing::warn!("could not reassemble dropbox response"),
                    }
                }
            }
            _ => {}
        }
    }

    fn process_ark(
        &self,
        ark: &PrismMessage,
        source: Option<&[u8]>,
        timestamp: Option<SystemTime>,
    ) {
        let Some(root) = &self.root_key else {
            tracing::debug!("dropping ARK: no root certificate configured");
            return;
        };
        if !verify_ark(ark, None, root) {
            tracing::warn!("could not verify ARK from {:?}", ark.name);
            return;
        }
        let mut servers = self.servers.lock();
        if let Some(pseudonym) = servers.record(ark.clone())
            && let (Some(source), Some(timestamp)) = (source, timestamp)
        {
            servers.update_status(source, &pseudonym, timestamp, true);
        }
    }

    fn process_nark(&self, nark: &PrismMessage) {
        let Some(source) = &nark.pseudonym else {
            return;
        };
        let timestamp = nark
            .micro_timestamp
            .map(|micros| UNIX_EPOCH + Duration::from_micros(micros))
            .unwrap_or_else(SystemTime::now);
        let mut servers = self.servers.lock();
        for dead in nark.dead_servers.as_deref().unwrap_or_default() {
            servers.update_status(source, dead, timestamp, false);
        }
        servers.save();
    }

    fn process_encrypted_user_message(&self, message: &PrismMessage) {
        let payload = EncryptedPayload {
            ciphertext: message.ciphertext.clone().unwrap_or_default(),
            wrapped_key: message.encrypted_msg_key.clone().unwrap_or_default(),
            nonce: message.nonce.clone().unwrap_or_default(),
        };
        let plaintext = match self.ibe.lock().decrypt(&payload) {
            Ok(plaintext) => plaintext,
            Err(_) => {
                tracing::debug!("user message was not addressed to us");
                return;
            }
        };
        let Ok(inner) = PrismMessage::decode(&plaintext) else {
            return;
        };
        let Some(mut clear) = ClearText::from_wire(&inner, &self.config.name) else {
            return;
        };
        if !self.outgoing_dedupe.is_new(&clear.nonce) {
            return;
        }
        clear.receive_time = Some(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        );
        tracing::debug!("received message from {}", clear.sender);
        self.message_store.record(clear.clone());
        if let Some(delegate) = self.delegate.lock().as_ref() {
            let _ = delegate.send(clear);
        }
    }

    fn process_registration_message(&self, message: &PrismMessage) {
        let mut registration = self.registration.lock();
        let Some(inner) = envelope::decrypt(message, &registration.half_key, None) else {
            tracing::warn!("could not decrypt registration response");
            return;
        };
        if inner.msg_type != MsgType::ClientRegistrationResponse {
            return;
        }
        let (Some(name), Some(shard)) = (&inner.name, &inner.ciphertext) else {
            return;
        };
        if registration.nonces.get(name) != inner.nonce.as_ref() {
            tracing::warn!("registration response nonce mismatch from {name}");
            return;
        }
        registration.shards.insert(name.clone(), shard.clone());
        tracing::debug!(
            "received IBE key shard {}/{}",
            registration.shards.len(),
            registration.nonces.len()
        );
        if registration.shards.len() == registration.nonces.len() {
            let shards: Vec<Vec<u8>> = registration.shards.values().cloned().collect();
            self.ibe.lock().load_private_shards(shards);
            drop(registration);
            for queued in self.queued_encrypted.lock().drain(..) {
                self.process_encrypted_user_message(&queued);
            }
        }
    }

    async fn bootstrap_task(&self) {
        let committee: Vec<String> = (1..=self.config.ibe_shards)
            .map(|i| format!("{}-{}", self.config.ibe_committee_name, i))
            .collect();
        {
            let mut registration = self.registration.lock();
            registration.nonces = committee
                .iter()
                .map(|name| (name.clone(), make_nonce()))
                .collect();
        }

        let mut last_round: Option<tokio::time::Instant> = None;
        while !self.can_decrypt() {
            if self.cancel.is_cancelled() {
                return;
            }
            let due = last_round
                .is_none_or(|t| t.elapsed() >= self.config.bootstrap_request_interval);
            if due {
                last_round = Some(tokio::time::Instant::now());
                for server in &committee {
                    let missing = {
                        let registration = self.registration.lock();
                        !registration.shards.contains_key(server)
                    };
                    if missing {
                        self.send_bootstrap_request(server);
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    fn send_bootstrap_request(&self, server: &str) {
        let registration = self.registration.lock();
        let Some(nonce) = registration.nonces.get(server).cloned() else {
            return;
        };
        let request = PrismMessage {
            name: Some(self.config.name.clone()),
            nonce: Some(nonce),
            half_key: Some(registration.half_key.public()),
            ..PrismMessage::new(MsgType::ClientRegistrationRequest)
        };
        drop(registration);

        tracing::debug!("requesting IBE key shard from {server}");
        let clear = ClearText {
            receiver: server.to_owned(),
            sender: self.config.name.clone(),
            message: None,
            message_bytes: Some(request.encode()),
            nonce: make_nonce(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            receive_time: None,
            use_ibe: true,
        };
        self.send_log.add(clear);
    }

    async fn epoch_command_task(&self) {
        let Some(mut rx) = self.epoch_rx.lock().take() else {
            return;
        };
        loop {
            let command = tokio::select! {
                command = rx.recv() => command,
                _ = self.cancel.cancelled() => return,
            };
            let Some(command) = command else { return };
            match command {
                EpochCommand::New { seed } => {
                    let name = String::from_utf8_lossy(&seed).into_owned();
                    tracing::debug!("preparing for incoming epoch {name}");
                    self.epochs.lock().incoming = Some(name);
                }
                EpochCommand::Next { .. } => {
                    let (old_outgoing, next) = {
                        let mut epochs = self.epochs.lock();
                        let Some(incoming) = epochs.incoming.take() else {
                            continue;
                        };
                        let current = epochs.current.clone();
                        let old_outgoing = epochs.outgoing.replace(current);
                        epochs.current = incoming.clone();
                        epochs.transport =
                            EpochTransport::new(self.base_transport.clone(), incoming.clone());
                        (old_outgoing, incoming)
                    };
                    if let Some(epoch) = old_outgoing {
                        self.shutdown_epoch_links(&epoch).await;
                    }
                    self.servers.lock().current_epoch = next.clone();
                    self.dropboxes.reset_poll_timers();
                    tracing::debug!("switched to epoch {next}");
                }
                EpochCommand::Off { .. } => {
                    let outgoing = self.epochs.lock().outgoing.take();
                    if let Some(epoch) = outgoing {
                        self.shutdown_epoch_links(&epoch).await;
                    }
                }
                EpochCommand::FloodEpoch { .. } | EpochCommand::FloodLsp { .. } => {}
            }
        }
    }

    async fn shutdown_epoch_links(&self, epoch: &str) {
        tracing::debug!("closing links from epoch {epoch}");
        for channel in self.base_transport.channels() {
            for link in channel.links() {
                if link.profile().epoch == epoch {
                    link.close().await;
                }
            }
        }
    }

    async fn link_maintenance_task(&self) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            if self.config.dynamic_links {
                self.maintain_incoming_links().await;
                self.maintain_broadcast_links().await;
            }
            tokio::time::sleep(self.config.link_maintenance_interval).await;
        }
    }

    /// Make sure we own a return ("downlink") and an ARK intake link for
    /// the current epoch, so servers can reach back to us.
    async fn maintain_incoming_links(&self) {
        let transport = self.current_transport();
        let epoch = transport.epoch.clone();
        for tag in ["downlink", "ark"] {
            let have = {
                let links = self.links.lock();
                let set = if tag == "downlink" {
                    &links.return_links
                } else {
                    &links.ark
                };
                set.iter().any(|link| link.profile().epoch == epoch)
            };
            if have {
                continue;
            }
            let channel = transport.channels().into_iter().find(|c| {
                let desc = c.descriptor();
                desc.link_direction.sender_loaded()
                    && desc.status.usable()
                    && desc.tags.iter().any(|t| t == tag)
            });
            let Some(channel) = channel else { continue };
            let return_id = hex::encode(make_nonce());
            if let Some(link) = transport.create_link(&channel, &[return_id]).await {
                tracing::debug!("created incoming {tag} link {}", link.profile().link_id);
                let mut links = self.links.lock();
                if tag == "downlink" {
                    links.return_links.push(link);
                } else {
                    links.ark.push(link);
                }
            }
        }
    }

    /// Load broadcast addresses advertised by our dropboxes and connected
    /// EMIXes so we hear their ARKs and replies.
    async fn maintain_broadcast_links(&self) {
        let epoch = self.current_epoch();
        let transport = self.current_transport();
        let mut wanted: Vec<(String, LinkAddress)> = Vec::new();
        {
            let servers = self.servers.lock();
            for rec in servers.valid_servers() {
                if rec.epoch() != epoch {
                    continue;
                }
                for address in rec.ark.broadcast_addresses.as_deref().unwrap_or_default() {
                    wanted.push((rec.name().to_owned(), address.clone()));
                }
            }
        }
        for (name, address) in wanted {
            let loaded = {
                let links = self.links.lock();
                links
                    .broadcast
                    .iter()
                    .any(|link| link.profile().link_address == address.link_address)
            };
            if loaded {
                continue;
            }
            if let Some(link) = transport
                .load_address(&address, &[format!("{name}-broadcast")])
                .await
            {
                self.links.lock().broadcast.push(link);
            }
        }
    }
}
