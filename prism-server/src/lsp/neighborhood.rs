//! Neighborhood liveness: the HELLO handshake that discovers direct
//! neighbors, and the ALIVE / PRESUMED_DEAD timers that retire silent ones.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use prism_transport::enums::{ConnectionType, TransmissionType};
use prism_transport::hooks::HookFilter;
use prism_transport::{EpochTransport, LinkProfile};
use prism_types::message::{MsgType, PrismMessage};

use crate::config::ServerConfig;

/// An established neighbor.
#[derive(Debug, Clone)]
pub struct Neighbor {
    /// The neighbor's node address (its name).
    pub address: String,
    /// Its pseudonym.
    pub pseudonym: Vec<u8>,
    /// The channel the handshake completed on.
    pub channel_id: Option<String>,
}

struct Timers {
    /// Per-pseudonym cancellation for whichever timer is armed.
    tokens: HashMap<Vec<u8>, CancellationToken>,
}

/// The neighborhood of one routing instance.
pub struct Neighborhood {
    myself: Neighbor,
    transport: EpochTransport,
    config: Arc<ServerConfig>,
    neighbors: Mutex<HashMap<Vec<u8>, Neighbor>>,
    timers: Mutex<Timers>,
    attempts_remaining: Mutex<HashMap<(String, String), u32>>,
    /// Fired whenever the neighbor set changes, so our own LSP refreshes.
    pub aliveness_trigger: Arc<Notify>,
    /// Pseudonyms of neighbors declared dead, drained by the router.
    dead_tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl Neighborhood {
    /// A neighborhood for `own` on `transport`. Dead-neighbor pseudonyms
    /// are reported through the returned receiver.
    pub fn new(
        own_address: String,
        own_pseudonym: Vec<u8>,
        transport: EpochTransport,
        config: Arc<ServerConfig>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (dead_tx, dead_rx) = mpsc::unbounded_channel();
        let nh = Arc::new(Self {
            myself: Neighbor {
                address: own_address,
                pseudonym: own_pseudonym,
                channel_id: None,
            },
            transport,
            config,
            neighbors: Mutex::new(HashMap::new()),
            timers: Mutex::new(Timers {
                tokens: HashMap::new(),
            }),
            attempts_remaining: Mutex::new(HashMap::new()),
            aliveness_trigger: Arc::new(Notify::new()),
            dead_tx,
        });
        (nh, dead_rx)
    }

    /// Address of a neighbor by pseudonym.
    pub fn address_for(&self, pseudonym: &[u8]) -> Option<String> {
        if pseudonym == self.myself.pseudonym {
            return Some(self.myself.address.clone());
        }
        self.neighbors
            .lock()
            .get(pseudonym)
            .map(|n| n.address.clone())
    }

    /// Whether a pseudonym belongs to a live neighbor (or ourselves).
    pub fn is_alive(&self, pseudonym: &[u8]) -> bool {
        pseudonym == self.myself.pseudonym || self.neighbors.lock().contains_key(pseudonym)
    }

    /// Whether an address belongs to a live neighbor.
    pub fn is_alive_address(&self, address: &str) -> bool {
        self.neighbors
            .lock()
            .values()
            .any(|n| n.address == address)
    }

    /// Pseudonyms of all neighbors other than ourselves.
    pub fn other_neighbors(&self) -> Vec<Vec<u8>> {
        self.neighbors.lock().keys().cloned().collect()
    }

    fn suitable_link(profile: &LinkProfile) -> bool {
        profile.can_send()
            && profile.channel.connection_type != ConnectionType::Indirect
            && profile.channel.transmission_type == TransmissionType::Unicast
    }

    /// The endpoint a link makes a candidate neighbor, if any.
    fn suitable_receiver(profile: &LinkProfile) -> Option<String> {
        if !Self::suitable_link(profile) {
            return None;
        }
        profile
            .endpoints
            .iter()
            .find(|e| !e.starts_with('*'))
            .cloned()
    }

    /// Reset the ALIVE timer for a neighbor we just heard from.
    pub fn set_alive(self: &Arc<Self>, pseudonym: &[u8]) {
        if pseudonym == self.myself.pseudonym {
            return;
        }
        let exists = self.neighbors.lock().contains_key(pseudonym);
        if exists {
            self.arm_alive_timer(pseudonym.to_vec());
        }
    }

    fn arm_timer(&self, pseudonym: &[u8]) -> CancellationToken {
        let mut timers = self.timers.lock();
        if let Some(old) = timers.tokens.remove(pseudonym) {
            old.cancel();
        }
        let token = CancellationToken::new();
        timers.tokens.insert(pseudonym.to_vec(), token.clone());
        token
    }

    fn alive_window(&self) -> Duration {
        self.config
            .cs2_ark_timeout
            .mul_f64(self.config.ls_alive_factor)
    }

    fn arm_alive_timer(self: &Arc<Self>, pseudonym: Vec<u8>) {
        let token = self.arm_timer(&pseudonym);
        let nh = self.clone();
        let window = self.alive_window();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(window) => {}
                _ = token.cancelled() => return,
            }
            let neighbor = nh.neighbors.lock().get(&pseudonym).cloned();
            if let Some(neighbor) = neighbor {
                // Probe once, then demote to PRESUMED_DEAD.
                nh.say_hello(&neighbor.address, neighbor.channel_id.as_deref())
                    .await;
                nh.arm_presumed_dead_timer(pseudonym);
            }
        });
    }

    fn arm_presumed_dead_timer(self: &Arc<Self>, pseudonym: Vec<u8>) {
        let token = self.arm_timer(&pseudonym);
        let nh = self.clone();
        let window = self.config.ls_presumed_dead_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(window) => {}
                _ = token.cancelled() => return,
            }
            let address = nh
                .neighbors
                .lock()
                .get(&pseudonym)
                .map(|n| n.address.clone());
            if let Some(address) = address {
                tracing::warn!("no sign of life from {address} within {window:?}");
                nh.declare_dead(&address);
            }
        });
    }

    /// Demote every neighbor at `address` towards death.
    pub fn presume_dead(self: &Arc<Self>, address: &str) {
        let pseudonyms: Vec<Vec<u8>> = self
            .neighbors
            .lock()
            .iter()
            .filter(|(_, n)| n.address == address)
            .map(|(p, _)| p.clone())
            .collect();
        for pseudonym in pseudonyms {
            self.arm_presumed_dead_timer(pseudonym);
        }
    }

    /// Remove every neighbor at `address`, report them dead, and trigger
    /// an LSP refresh. Returns whether anything was removed.
    pub fn declare_dead(self: &Arc<Self>, address: &str) -> bool {
        let dead: Vec<(Vec<u8>, Neighbor)> = {
            let mut neighbors = self.neighbors.lock();
            let pseudonyms: Vec<Vec<u8>> = neighbors
                .iter()
                .filter(|(_, n)| n.address == address)
                .map(|(p, _)| p.clone())
                .collect();
            pseudonyms
                .into_iter()
                .filter_map(|p| neighbors.remove(&p).map(|n| (p, n)))
                .collect()
        };
        for (pseudonym, neighbor) in &dead {
            tracing::warn!("declaring neighbor dead: {}", neighbor.address);
            let mut timers = self.timers.lock();
            if let Some(token) = timers.tokens.remove(pseudonym) {
                token.cancel();
            }
            if let Some(channel) = &neighbor.channel_id {
                self.attempts_remaining
                    .lock()
                    .remove(&(neighbor.address.clone(), channel.clone()));
            }
            let _ = self.dead_tx.send(pseudonym.clone());
        }
        if dead.is_empty() {
            false
        } else {
            self.aliveness_trigger.notify_one();
            true
        }
    }

    async fn say_hello(&self, address: &str, channel_id: Option<&str>) -> bool {
        let hello = PrismMessage {
            from_neighbor: Some(self.myself.pseudonym.clone()),
            name: Some(self.myself.address.clone()),
            whiteboard_id: channel_id.map(str::to_owned),
            ..PrismMessage::new(MsgType::LspHello)
        };
        let wanted = channel_id.map(str::to_owned);
        let filter = move |profile: &LinkProfile| {
            Neighborhood::suitable_link(profile)
                && wanted
                    .as_deref()
                    .is_none_or(|id| profile.channel.channel_id == id)
        };
        self.transport
            .emit_on_links(
                address,
                &hello,
                Some(self.config.ls_neighbor_timeout),
                Some(&filter),
            )
            .await
    }

    async fn handle_msg(self: &Arc<Self>, message: PrismMessage) {
        match message.msg_type {
            MsgType::LspHello => {
                let Some(from) = message.from_neighbor.clone() else {
                    return;
                };
                if from == self.myself.pseudonym {
                    return;
                }
                let Some(name) = message.name.clone() else {
                    return;
                };
                // Hearing from a blocked endpoint resets its attempt budget:
                // the link evidently works in at least one direction.
                self.attempts_remaining
                    .lock()
                    .retain(|(address, _), attempts| !(address == &name && *attempts == 0));

                let response = PrismMessage {
                    from_neighbor: Some(self.myself.pseudonym.clone()),
                    to_neighbor: Some(from.clone()),
                    name: Some(self.myself.address.clone()),
                    whiteboard_id: message.whiteboard_id.clone(),
                    ..PrismMessage::new(MsgType::LspHelloResponse)
                };
                let ok = self
                    .transport
                    .emit_on_links(
                        &name,
                        &response,
                        Some(self.config.ls_neighbor_timeout),
                        Some(&|profile: &LinkProfile| {
                            Neighborhood::suitable_receiver(profile).as_deref()
                                == Some(name.as_str())
                        }),
                    )
                    .await;
                if ok {
                    self.set_alive(&from);
                } else {
                    tracing::warn!("cannot answer LSP hello from {name}; presuming dead");
                    self.presume_dead(&name);
                }
            }
            MsgType::LspHelloResponse => {
                let Some(from) = message.from_neighbor.clone() else {
                    return;
                };
                if message.to_neighbor.as_deref() == Some(self.myself.pseudonym.as_slice())
                    && !self.neighbors.lock().contains_key(&from)
                    && let Some(name) = message.name.clone()
                {
                    let neighbor = Neighbor {
                        address: name.clone(),
                        pseudonym: from.clone(),
                        channel_id: message.whiteboard_id.clone(),
                    };
                    tracing::info!("new neighbor discovered: {name}");
                    self.neighbors.lock().insert(from.clone(), neighbor);
                    if let Some(channel) = &message.whiteboard_id {
                        self.attempts_remaining.lock().remove(&(name, channel.clone()));
                    }
                    self.aliveness_trigger.notify_one();
                    self.arm_alive_timer(from.clone());
                }
                self.set_alive(&from);
            }
            _ => {}
        }
    }

    async fn discover_once(self: &Arc<Self>) {
        let current: Vec<String> = self
            .neighbors
            .lock()
            .values()
            .map(|n| n.address.clone())
            .collect();
        let mut candidates: Vec<(String, String)> = Vec::new();
        for channel in self.transport.channels() {
            for link in channel.links() {
                let profile = link.profile();
                if profile.epoch != self.transport.epoch {
                    continue;
                }
                let Some(endpoint) = Self::suitable_receiver(&profile) else {
                    continue;
                };
                if endpoint == self.myself.address || current.contains(&endpoint) {
                    continue;
                }
                candidates.push((endpoint, profile.channel.channel_id.clone()));
            }
        }

        for (endpoint, channel_id) in candidates {
            let proceed = {
                let mut attempts = self.attempts_remaining.lock();
                let remaining = attempts
                    .entry((endpoint.clone(), channel_id.clone()))
                    .or_insert(self.config.ls_max_discovery_attempts.max(1));
                if *remaining == 0 {
                    false
                } else {
                    *remaining -= 1;
                    true
                }
            };
            if proceed {
                tracing::debug!("saying LSP hello to {endpoint} on {channel_id}");
                self.say_hello(&endpoint, Some(&channel_id)).await;
            }
        }
    }

    /// Run discovery plus the handshake listener until cancelled.
    pub async fn main_task(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!("link-state neighborhood management started");
        let mut hook = self.transport.register_hook(HookFilter::TypeIn(vec![
            MsgType::LspHello,
            MsgType::LspHelloResponse,
        ]));
        let mut discovery = tokio::time::interval(self.config.ls_neighbor_discovery_sleep);
        loop {
            tokio::select! {
                package = hook.recv() => {
                    let Some(package) = package else { return };
                    self.handle_msg(package.message).await;
                }
                _ = discovery.tick() => self.discover_once().await,
                _ = cancel.cancelled() => return,
            }
        }
    }
}
