//! An in-process transport: named nodes wired through a shared router.
//!
//! Used by the integration harness and local single-machine deployments.
//! Three address forms are understood when loading links:
//!
//! * `node:<name>` — direct unicast to a named node,
//! * `group:<pattern>` — delivery to every member of a broadcast group
//!   (e.g. `group:*client`),
//! * `mem://...` — an address minted by a peer's `create_link`.
//!
//! Channel descriptors (connection type, MTU, latency/bandwidth estimates,
//! tags) are configured per channel, so code that ranks channels or sizes
//! timeouts behaves the same as on a real deployment.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use prism_types::message::PrismMessage;

use crate::enums::{ConnectionStatus, LinkType};
use crate::hooks::Package;
use crate::transport::{Channel, ChannelDesc, Link, LinkProfile, Transport};

#[derive(Default)]
struct NetInner {
    nodes: HashMap<String, mpsc::UnboundedSender<Package>>,
    /// Minted receive addresses: address → owning node.
    addresses: HashMap<String, AddressEntry>,
    /// Broadcast groups: pattern → member nodes.
    groups: HashMap<String, HashSet<String>>,
}

struct AddressEntry {
    owner: String,
    /// Nodes that loaded this address to hear broadcasts from the owner.
    subscribers: HashSet<String>,
}

/// The shared router all in-memory nodes hang off.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetInner>>,
}

impl MemoryNetwork {
    /// A fresh, empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node's transport: inbound packages routed to its name are
    /// pumped into the transport's hooks.
    pub fn attach(&self, transport: Arc<Transport>) {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Package>();
        self.inner
            .lock()
            .nodes
            .insert(transport.local_address.clone(), sender);
        tokio::spawn(async move {
            while let Some(package) = receiver.recv().await {
                transport.submit(package);
            }
        });
    }

    /// Detach a node: sends towards it start failing, simulating death.
    pub fn disconnect(&self, node: &str) {
        let mut inner = self.inner.lock();
        inner.nodes.remove(node);
        for entry in inner.addresses.values_mut() {
            entry.subscribers.remove(node);
        }
        for members in inner.groups.values_mut() {
            members.remove(node);
        }
    }

    /// Add a node to a broadcast group such as `*client`.
    pub fn join_group(&self, group: &str, node: &str) {
        self.inner
            .lock()
            .groups
            .entry(group.to_owned())
            .or_default()
            .insert(node.to_owned());
    }

    /// Build a channel for `node` with the given descriptor.
    pub fn channel(&self, node: &str, desc: ChannelDesc) -> Arc<MemoryChannel> {
        Arc::new(MemoryChannel {
            desc,
            node: node.to_owned(),
            network: self.clone(),
            links: Mutex::new(Vec::new()),
        })
    }

    fn deliver_to(&self, node: &str, package: Package) -> bool {
        let sender = self.inner.lock().nodes.get(node).cloned();
        match sender {
            Some(sender) => sender.send(package).is_ok(),
            None => false,
        }
    }

    fn deliver(&self, target: &Target, package: Package) -> bool {
        match target {
            Target::Node(node) => self.deliver_to(node, package),
            Target::Group(group) => {
                let members: Vec<String> = self
                    .inner
                    .lock()
                    .groups
                    .get(group)
                    .map(|m| m.iter().cloned().collect())
                    .unwrap_or_default();
                let mut any = false;
                for member in members {
                    any |= self.deliver_to(&member, package.clone());
                }
                any
            }
            Target::Subscribers(address) => {
                let subscribers: Vec<String> = self
                    .inner
                    .lock()
                    .addresses
                    .get(address)
                    .map(|entry| entry.subscribers.iter().cloned().collect())
                    .unwrap_or_default();
                let mut any = false;
                for subscriber in subscribers {
                    any |= self.deliver_to(&subscriber, package.clone());
                }
                any
            }
        }
    }
}

#[derive(Debug, Clone)]
enum Target {
    Node(String),
    Group(String),
    Subscribers(String),
}

/// One configured channel of the in-memory transport.
pub struct MemoryChannel {
    desc: ChannelDesc,
    node: String,
    network: MemoryNetwork,
    links: Mutex<Vec<Arc<MemoryLink>>>,
}

impl MemoryChannel {
    fn make_link(
        &self,
        endpoints: &[String],
        epoch: &str,
        link_type: LinkType,
        link_address: String,
        target: Option<Target>,
    ) -> Arc<MemoryLink> {
        let link = Arc::new(MemoryLink {
            profile: Mutex::new(LinkProfile {
                link_id: uuid::Uuid::new_v4().to_string(),
                epoch: epoch.to_owned(),
                endpoints: endpoints.to_vec(),
                link_type,
                connection_status: ConnectionStatus::Available,
                link_address,
                channel: self.desc.clone(),
            }),
            network: self.network.clone(),
            target,
        });
        self.links.lock().push(link.clone());
        link
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn descriptor(&self) -> ChannelDesc {
        self.desc.clone()
    }

    fn links(&self) -> Vec<Arc<dyn Link>> {
        self.links
            .lock()
            .iter()
            .map(|link| link.clone() as Arc<dyn Link>)
            .collect()
    }

    async fn create_link(&self, endpoints: &[String], epoch: &str) -> Option<Arc<dyn Link>> {
        let address = format!("mem://{}/{}", self.node, uuid::Uuid::new_v4());
        // Group endpoints mark an outgoing broadcast link (creator sends,
        // loaders subscribe); otherwise the creator receives and peers
        // load the minted address to send here.
        let broadcast = endpoints.iter().any(|e| e.starts_with('*'));
        let (link_type, target) =
            if broadcast && self.desc.link_direction.receiver_loaded() {
                (LinkType::Send, Some(Target::Subscribers(address.clone())))
            } else if self.desc.link_direction.sender_loaded() {
                (LinkType::Receive, None)
            } else {
                (LinkType::Send, Some(Target::Subscribers(address.clone())))
            };
        self.network.inner.lock().addresses.insert(
            address.clone(),
            AddressEntry {
                owner: self.node.clone(),
                subscribers: HashSet::new(),
            },
        );
        Some(self.make_link(endpoints, epoch, link_type, address, target))
    }

    async fn load_link(
        &self,
        address: &str,
        endpoints: &[String],
        epoch: &str,
    ) -> Option<Arc<dyn Link>> {
        if let Some(node) = address.strip_prefix("node:") {
            return Some(self.make_link(
                endpoints,
                epoch,
                LinkType::Send,
                address.to_owned(),
                Some(Target::Node(node.to_owned())),
            ));
        }
        if let Some(group) = address.strip_prefix("group:") {
            return Some(self.make_link(
                endpoints,
                epoch,
                LinkType::Send,
                address.to_owned(),
                Some(Target::Group(group.to_owned())),
            ));
        }

        let owner = {
            let mut inner = self.network.inner.lock();
            let entry = inner.addresses.get_mut(address)?;
            entry.subscribers.insert(self.node.clone());
            entry.owner.clone()
        };
        // Loading a creator-receives address yields a send link towards the
        // owner; loading a creator-sends address yields a receive link.
        if self.desc.link_direction.sender_loaded() {
            Some(self.make_link(
                endpoints,
                epoch,
                LinkType::Send,
                address.to_owned(),
                Some(Target::Node(owner)),
            ))
        } else {
            Some(self.make_link(endpoints, epoch, LinkType::Receive, address.to_owned(), None))
        }
    }
}

/// A link over the in-memory router.
pub struct MemoryLink {
    profile: Mutex<LinkProfile>,
    network: MemoryNetwork,
    target: Option<Target>,
}

#[async_trait]
impl Link for MemoryLink {
    fn profile(&self) -> LinkProfile {
        self.profile.lock().clone()
    }

    async fn send(&self, message: PrismMessage, _timeout: Option<Duration>) -> bool {
        let profile = self.profile();
        if !profile.can_send() {
            return false;
        }
        let Some(target) = &self.target else {
            return false;
        };
        let package = Package::new(message, Some(profile));
        self.network.deliver(target, package)
    }

    async fn close(&self) {
        let mut profile = self.profile.lock();
        profile.connection_status = ConnectionStatus::Closed;
    }
}

/// A ready-made direct unicast channel descriptor for tests and local
/// deployments.
pub fn direct_channel_desc(channel_id: &str) -> ChannelDesc {
    use crate::enums::{ChannelStatus, ConnectionType, LinkDirection, TransmissionType};
    ChannelDesc {
        channel_id: channel_id.to_owned(),
        status: ChannelStatus::Available,
        connection_type: ConnectionType::Direct,
        link_direction: LinkDirection::Bidirectional,
        transmission_type: TransmissionType::Unicast,
        reliable: true,
        mtu: None,
        bandwidth_bps: 10_000_000,
        latency_ms: 1,
        loss: 0.0,
        tags: vec!["lsp".into(), "mpc".into()],
    }
}

/// An indirect broadcast-capable channel descriptor (client-facing).
pub fn indirect_channel_desc(channel_id: &str) -> ChannelDesc {
    use crate::enums::{ChannelStatus, ConnectionType, LinkDirection, TransmissionType};
    ChannelDesc {
        channel_id: channel_id.to_owned(),
        status: ChannelStatus::Available,
        connection_type: ConnectionType::Indirect,
        link_direction: LinkDirection::Bidirectional,
        transmission_type: TransmissionType::Multicast,
        reliable: false,
        mtu: Some(64 * 1024),
        bandwidth_bps: 1_000_000,
        latency_ms: 20,
        loss: 0.0,
        tags: vec!["ark".into(), "uplink".into(), "downlink".into(), "epoch".into()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::HookFilter;
    use prism_types::message::MsgType;

    async fn node(network: &MemoryNetwork, name: &str) -> Arc<Transport> {
        let transport = Transport::new(name, Duration::from_secs(5));
        network.attach(transport.clone());
        let channel = network.channel(name, direct_channel_desc("direct"));
        transport.add_channel(channel);
        transport
    }

    #[tokio::test]
    async fn direct_links_deliver_between_nodes() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a").await;
        let b = node(&network, "b").await;

        let channel = &a.channels()[0];
        let link = channel
            .load_link("node:b", &["b".into()], "genesis")
            .await
            .unwrap();

        let mut hook = b.register_hook(HookFilter::TypeIn(vec![MsgType::Lsp]));
        assert!(link.send(PrismMessage::new(MsgType::Lsp), None).await);
        let package = hook.recv_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(package.message.msg_type, MsgType::Lsp);
        assert_eq!(package.link.as_ref().unwrap().epoch, "genesis");
    }

    #[tokio::test]
    async fn minted_addresses_route_back_to_creator() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a").await;
        let b = node(&network, "b").await;

        let receive = a.channels()[0]
            .create_link(&["return-id".into()], "genesis")
            .await
            .unwrap();
        let address = receive.profile().link_address;

        let send = b.channels()[0]
            .load_link(&address, &["return-id".into()], "genesis")
            .await
            .unwrap();
        let mut hook = a.register_hook(HookFilter::Any);
        assert!(send.send(PrismMessage::new(MsgType::Arks), None).await);
        assert!(hook.recv_timeout(Duration::from_secs(1)).await.is_some());
    }

    #[tokio::test]
    async fn group_links_reach_all_members_and_disconnect_stops_delivery() {
        let network = MemoryNetwork::new();
        let server = node(&network, "server").await;
        let c1 = node(&network, "c1").await;
        let c2 = node(&network, "c2").await;
        network.join_group("*client", "c1");
        network.join_group("*client", "c2");

        let link = server.channels()[0]
            .load_link("group:*client", &["*client".into()], "genesis")
            .await
            .unwrap();
        let mut h1 = c1.register_hook(HookFilter::Any);
        let mut h2 = c2.register_hook(HookFilter::Any);
        assert!(link.send(PrismMessage::new(MsgType::Nark), None).await);
        assert!(h1.recv_timeout(Duration::from_secs(1)).await.is_some());
        assert!(h2.recv_timeout(Duration::from_secs(1)).await.is_some());

        network.disconnect("c1");
        network.disconnect("c2");
        assert!(!link.send(PrismMessage::new(MsgType::Nark), None).await);
    }
}
