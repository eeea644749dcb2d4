//! The transport contract: channels, links, and the dispatcher.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use prism_types::message::{LinkAddress, PrismMessage};

use crate::enums::{
    ChannelStatus, ConnectionStatus, ConnectionType, LinkDirection, LinkType, TransmissionType,
};
use crate::hooks::{HookFilter, HookHandle, HookRegistry, Package};

/// Static description of a channel.
#[derive(Debug, Clone)]
pub struct ChannelDesc {
    /// Stable channel identifier.
    pub channel_id: String,
    /// Availability.
    pub status: ChannelStatus,
    /// Topology kind.
    pub connection_type: ConnectionType,
    /// Who loads whose addresses.
    pub link_direction: LinkDirection,
    /// Unicast or multicast.
    pub transmission_type: TransmissionType,
    /// Whether the channel retransmits on loss.
    pub reliable: bool,
    /// Maximum message size in bytes; `None` for unlimited.
    pub mtu: Option<usize>,
    /// Estimated bandwidth in bits per second (0 when unknown).
    pub bandwidth_bps: u64,
    /// Estimated one-way latency in milliseconds (0 when unknown).
    pub latency_ms: u64,
    /// Estimated loss rate.
    pub loss: f64,
    /// Free-form capability tags (`lsp`, `ark`, `uplink`, `downlink`, ...).
    pub tags: Vec<String>,
}

/// A point-in-time snapshot of a link, sufficient for filtering and
/// routing decisions without holding the link itself.
#[derive(Debug, Clone)]
pub struct LinkProfile {
    /// Unique link id.
    pub link_id: String,
    /// Epoch the link is scoped to.
    pub epoch: String,
    /// Literal node names or `*`-prefixed group patterns this link reaches.
    pub endpoints: Vec<String>,
    /// Send/receive capability from this node's perspective.
    pub link_type: LinkType,
    /// Liveness.
    pub connection_status: ConnectionStatus,
    /// The channel-specific address peers can load.
    pub link_address: String,
    /// The owning channel's description.
    pub channel: ChannelDesc,
}

impl LinkProfile {
    /// Whether the link can deliver towards `address` (exact endpoint
    /// match, or the anonymous broadcast address `*`).
    pub fn can_reach(&self, address: &str) -> bool {
        address == "*" || self.endpoints.iter().any(|e| e == address)
    }

    /// Whether sends may be attempted.
    pub fn can_send(&self) -> bool {
        self.link_type.can_send() && self.connection_status.usable()
    }

    /// The CBOR-able address of this link.
    pub fn address(&self) -> LinkAddress {
        LinkAddress {
            channel_id: self.channel.channel_id.clone(),
            link_address: self.link_address.clone(),
        }
    }
}

/// One communication path over a channel, scoped to an epoch.
#[async_trait]
pub trait Link: Send + Sync {
    /// Snapshot of the link's state.
    fn profile(&self) -> LinkProfile;

    /// Send a message. Returns whether the transport accepted it; `false`
    /// is a signal to retry elsewhere, never an exception.
    async fn send(&self, message: PrismMessage, timeout: Option<Duration>) -> bool;

    /// Tear the link down.
    async fn close(&self);
}

/// A configured transport channel.
#[async_trait]
pub trait Channel: Send + Sync {
    /// The channel's description.
    fn descriptor(&self) -> ChannelDesc;

    /// Live links on this channel.
    fn links(&self) -> Vec<Arc<dyn Link>>;

    /// Create a link this node will receive on. Peers reach it by loading
    /// the returned link's address.
    async fn create_link(&self, endpoints: &[String], epoch: &str) -> Option<Arc<dyn Link>>;

    /// Load a peer's address into a link this node can send on.
    async fn load_link(
        &self,
        address: &str,
        endpoints: &[String],
        epoch: &str,
    ) -> Option<Arc<dyn Link>>;
}

/// The node-wide transport: channels plus the hook dispatcher.
pub struct Transport {
    /// This node's own address (its configured name).
    pub local_address: String,
    channels: RwLock<Vec<Arc<dyn Channel>>>,
    registry: HookRegistry,
}

impl Transport {
    /// A transport for `local_address`, parking unmatched packages for
    /// `hold_package` before dropping them.
    pub fn new(local_address: impl Into<String>, hold_package: Duration) -> Arc<Self> {
        Arc::new(Self {
            local_address: local_address.into(),
            channels: RwLock::new(Vec::new()),
            registry: HookRegistry::new(hold_package),
        })
    }

    /// Attach a channel.
    pub fn add_channel(&self, channel: Arc<dyn Channel>) {
        self.channels.write().push(channel);
    }

    /// All configured channels.
    pub fn channels(&self) -> Vec<Arc<dyn Channel>> {
        self.channels.read().clone()
    }

    /// All usable send links reaching `address`, optionally restricted to
    /// one epoch.
    pub fn links_for(&self, address: &str, epoch: Option<&str>) -> Vec<Arc<dyn Link>> {
        self.channels()
            .iter()
            .flat_map(|channel| channel.links())
            .filter(|link| {
                let profile = link.profile();
                profile.can_send()
                    && profile.can_reach(address)
                    && epoch.is_none_or(|e| profile.epoch == e)
            })
            .collect()
    }

    /// Register a hook; parked packages are replayed into it.
    pub fn register_hook(&self, filter: HookFilter) -> HookHandle {
        self.registry.register(filter)
    }

    /// Submit an inbound package to the hooks.
    pub fn submit(&self, package: Package) {
        self.registry.submit(package);
    }

    /// Deliver a message to this node's own hooks, as if it had arrived on
    /// a local link of the given epoch.
    pub fn deliver_local(&self, message: PrismMessage, epoch: &str) {
        let profile = LinkProfile {
            link_id: "local".into(),
            epoch: epoch.to_owned(),
            endpoints: vec![self.local_address.clone()],
            link_type: LinkType::Bidi,
            connection_status: ConnectionStatus::Open,
            link_address: "local://".into(),
            channel: ChannelDesc {
                channel_id: "local".into(),
                status: ChannelStatus::Available,
                connection_type: ConnectionType::Local,
                link_direction: LinkDirection::Bidirectional,
                transmission_type: TransmissionType::Unicast,
                reliable: true,
                mtu: None,
                bandwidth_bps: 0,
                latency_ms: 0,
                loss: 0.0,
                tags: Vec::new(),
            },
        };
        self.submit(Package::new(message, Some(profile)));
    }

    /// Send `message` towards `address` over every matching link, racing
    /// the sends and declaring success on the first acknowledgement. For
    /// `*`-group addresses every link is given its chance (broadcasts are
    /// not cut short by an early winner).
    pub async fn emit_on_links(
        &self,
        address: &str,
        message: &PrismMessage,
        epoch: Option<&str>,
        timeout: Option<Duration>,
        link_filter: Option<&(dyn Fn(&LinkProfile) -> bool + Sync)>,
    ) -> bool {
        if address == self.local_address {
            self.deliver_local(message.clone(), epoch.unwrap_or("genesis"));
            return true;
        }

        let links: Vec<Arc<dyn Link>> = self
            .links_for(address, epoch)
            .into_iter()
            .filter(|link| link_filter.is_none_or(|f| f(&link.profile())))
            .collect();
        if links.is_empty() {
            tracing::debug!("emit_on_links: no usable link for {address}");
            return false;
        }

        let broadcast = address.starts_with('*');
        let mut set = JoinSet::new();
        for link in links {
            let message = message.clone();
            set.spawn(async move { link.send(message, timeout).await });
        }
        let mut any = false;
        while let Some(result) = set.join_next().await {
            if matches!(result, Ok(true)) {
                any = true;
                if !broadcast {
                    set.abort_all();
                    break;
                }
            }
        }
        any
    }

    /// Resolve a cross-channel address into a send link.
    pub async fn load_address(
        &self,
        address: &LinkAddress,
        endpoints: &[String],
        epoch: &str,
    ) -> Option<Arc<dyn Link>> {
        let channel = self
            .channels()
            .into_iter()
            .find(|c| c.descriptor().channel_id == address.channel_id);
        let Some(channel) = channel else {
            tracing::warn!(
                "cannot load address: unknown channel {}",
                address.channel_id
            );
            return None;
        };
        channel
            .load_link(&address.link_address, endpoints, epoch)
            .await
    }

    /// Background maintenance: periodically expire parked packages.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(Duration::from_millis(100));
        loop {
            tokio::select! {
                _ = tick.tick() => self.registry.expire_pool(),
                _ = cancel.cancelled() => break,
            }
        }
    }
}
