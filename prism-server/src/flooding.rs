//! One-hop gossip of per-originator payloads (epoch ARKs and other
//! control-plane records).
//!
//! The database keeps the latest payload per originator. A payload seen for
//! a new originator is stored and forwarded on (a subset of) usable links
//! after randomized delays; anything already known is dropped, which bounds
//! the traffic to one accepted flood per originator per node.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng as _;
use rand::seq::SliceRandom as _;
use tokio_util::sync::CancellationToken;

use prism_transport::enums::ConnectionType;
use prism_transport::hooks::HookFilter;
use prism_transport::{EpochTransport, Link, LinkProfile};
use prism_types::message::{MsgType, PrismMessage};

use crate::config::ServerConfig;

/// The flooding substrate of one role.
pub struct Flooding {
    own_pseudonym: Vec<u8>,
    transport: EpochTransport,
    config: Arc<ServerConfig>,
    database: Mutex<HashMap<Vec<u8>, PrismMessage>>,
}

impl Flooding {
    /// A flooding database for this role's epoch.
    pub fn new(
        own_pseudonym: Vec<u8>,
        transport: EpochTransport,
        config: Arc<ServerConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            own_pseudonym,
            transport,
            config,
            database: Mutex::new(HashMap::new()),
        })
    }

    /// Number of known originators.
    pub fn len(&self) -> usize {
        self.database.lock().len()
    }

    /// Whether nothing has been flooded yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every stored payload.
    pub fn payloads(&self) -> Vec<PrismMessage> {
        self.database.lock().values().cloned().collect()
    }

    /// Start a flood of `payload` from this node.
    pub async fn initiate(&self, payload: PrismMessage) {
        let flood = PrismMessage {
            originator: Some(self.own_pseudonym.clone()),
            sender: Some(self.own_pseudonym.clone()),
            hop_count: Some(-1),
            sub_msg: Some(Box::new(payload)),
            ..PrismMessage::new(MsgType::FloodMsg)
        };
        tracing::debug!("initiating flood for epoch {}", self.transport.epoch);
        self.handle_msg(flood).await;
    }

    fn link_ok(&self, profile: &LinkProfile) -> bool {
        profile.can_send()
            && (!self.config.flood_via_direct_only
                || profile.channel.connection_type == ConnectionType::Direct)
    }

    async fn handle_msg(&self, message: PrismMessage) {
        let Some(originator) = message.originator.clone() else {
            return;
        };
        let Some(payload) = message.sub_msg.clone() else {
            return;
        };
        {
            let mut db = self.database.lock();
            if db.contains_key(&originator) {
                return;
            }
            db.insert(originator.clone(), (*payload).clone());
            tracing::debug!(
                "flood database for epoch {} has {} entries",
                self.transport.epoch,
                db.len()
            );
        }

        let hop_count = message.hop_count.unwrap_or(0);
        if self.config.flood_max_hops > 0 && hop_count >= self.config.flood_max_hops {
            tracing::debug!("flood stops: max hop count reached");
            return;
        }
        let forward = PrismMessage {
            originator: Some(originator),
            sender: Some(self.own_pseudonym.clone()),
            hop_count: Some(hop_count + 1),
            sub_msg: Some(payload),
            ..PrismMessage::new(MsgType::FloodMsg)
        };

        let spread = self.config.flood_spread;
        // Decide fan-out and delays up front so no RNG state crosses an
        // await point.
        let plan: Vec<(Arc<dyn Link>, Duration)> = {
            let mut links: Vec<Arc<dyn Link>> = self
                .transport
                .links_for_address("*")
                .into_iter()
                .filter(|link| self.link_ok(&link.profile()))
                .collect();

            let mut rng = rand::thread_rng();
            let r = self.config.flood_gossip_r;
            let probability = if r > 0.0 && r < 1.0 { r } else { 1.0 };
            if r >= 1.0 && (r as usize) < links.len() {
                links.shuffle(&mut rng);
                links.truncate(r as usize);
            }
            let selected: Vec<Arc<dyn Link>> = links
                .into_iter()
                .filter(|_| rng.r#gen::<f64>() < probability)
                .collect();
            selected
                .into_iter()
                .map(|link| {
                    let delay = if spread.is_zero() {
                        Duration::ZERO
                    } else {
                        rng.gen_range(Duration::ZERO..spread)
                    };
                    (link, delay)
                })
                .collect()
        };

        for (link, delay) in plan {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if !link.send(forward.clone(), None).await {
                tracing::warn!("flood forward on {} failed", link.profile().link_id);
            }
        }
    }

    /// Consume FLOOD_MSG packages until cancelled.
    pub async fn listen_task(self: Arc<Self>, cancel: CancellationToken) {
        let mut hook = self
            .transport
            .register_hook(HookFilter::TypeIn(vec![MsgType::FloodMsg]));
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
}
