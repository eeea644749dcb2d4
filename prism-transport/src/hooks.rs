//! Hook-based delivery: tasks register a filter and receive matching
//! packages inline instead of through a central dispatcher.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use prism_types::message::{Action, MsgType, PrismMessage};

use crate::transport::LinkProfile;

/// A received message plus its delivery context.
#[derive(Debug, Clone)]
pub struct Package {
    /// The decoded message.
    pub message: PrismMessage,
    /// The link it arrived on; `None` for purely local submission.
    pub link: Option<LinkProfile>,
    /// When it arrived.
    pub received_at: Instant,
}

impl Package {
    /// Wrap a message delivered over `link`.
    pub fn new(message: PrismMessage, link: Option<LinkProfile>) -> Self {
        Self {
            message,
            link,
            received_at: Instant::now(),
        }
    }
}

/// A small algebra of package predicates. Filters compose with
/// [`HookFilter::and`]; matching is pure and cheap, so hooks can be
/// consulted for every inbound package.
#[derive(Debug, Clone)]
pub enum HookFilter {
    /// Matches everything.
    Any,
    /// All inner filters must match.
    And(Vec<HookFilter>),
    /// Message type is one of the given set.
    TypeIn(Vec<MsgType>),
    /// The message carries no pseudonym or exactly this one.
    Pseudonym(Vec<u8>),
    /// The package's delivering link belongs to this epoch (local packages
    /// pass).
    Epoch(String),
    /// An MPC response round: correct pseudonym, destination party, op id,
    /// and action.
    MpcResponse {
        /// Our pseudonym; responses addressed elsewhere are ignored.
        pseudonym: Vec<u8>,
        /// Our party id within the committee.
        party_id: u64,
        /// The op these responses belong to.
        op_id: Vec<u8>,
        /// The expected round label, if any.
        action: Option<Action>,
    },
}

impl HookFilter {
    /// Conjunction of `self` and `other`.
    pub fn and(self, other: HookFilter) -> HookFilter {
        match self {
            HookFilter::And(mut filters) => {
                filters.push(other);
                HookFilter::And(filters)
            }
            filter => HookFilter::And(vec![filter, other]),
        }
    }

    /// Whether a package passes this filter.
    pub fn matches(&self, package: &Package) -> bool {
        let message = &package.message;
        match self {
            HookFilter::Any => true,
            HookFilter::And(filters) => filters.iter().all(|f| f.matches(package)),
            HookFilter::TypeIn(types) => types.contains(&message.msg_type),
            HookFilter::Pseudonym(pseudonym) => message
                .pseudonym
                .as_ref()
                .is_none_or(|p| p == pseudonym),
            HookFilter::Epoch(epoch) => package
                .link
                .as_ref()
                .is_none_or(|link| &link.epoch == epoch),
            HookFilter::MpcResponse {
                pseudonym,
                party_id,
                op_id,
                action,
            } => {
                if message.msg_type != MsgType::MpcResponse {
                    return false;
                }
                if message
                    .pseudonym
                    .as_ref()
                    .is_some_and(|p| p != pseudonym)
                {
                    return false;
                }
                if message.dest_party_id != Some(*party_id) {
                    return false;
                }
                let Some(mpc) = &message.mpc_map else {
                    return false;
                };
                if mpc.request_id.as_deref() != Some(op_id.as_slice()) {
                    return false;
                }
                action.is_none() || mpc.action == *action
            }
        }
    }
}

struct HookEntry {
    id: u64,
    filter: HookFilter,
    sender: mpsc::UnboundedSender<Package>,
}

struct PoolEntry {
    digest: String,
    package: Package,
}

struct RegistryInner {
    hooks: Vec<HookEntry>,
    pool: Vec<PoolEntry>,
    next_id: u64,
}

/// The hook registry shared by a transport: live hooks plus the pool of
/// unmatched packages awaiting a late hook.
#[derive(Clone)]
pub struct HookRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    hold: Duration,
}

impl HookRegistry {
    /// A registry holding unmatched packages for `hold` before dropping
    /// them.
    pub fn new(hold: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                hooks: Vec::new(),
                pool: Vec::new(),
                next_id: 0,
            })),
            hold,
        }
    }

    /// Register a hook. Pooled packages matching the filter are replayed
    /// into it immediately. The hook unregisters when the handle drops.
    pub fn register(&self, filter: HookFilter) -> HookHandle {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        inner.pool.retain(|entry| {
            if filter.matches(&entry.package) {
                let _ = sender.send(entry.package.clone());
                false
            } else {
                true
            }
        });
        inner.hooks.push(HookEntry { id, filter, sender });
        HookHandle {
            id,
            registry: self.clone(),
            receiver,
        }
    }

    fn remove(&self, id: u64) {
        self.inner.lock().hooks.retain(|hook| hook.id != id);
    }

    /// Offer a package to every matching hook; park it when none matches.
    /// Re-submitting a package with the same digest refreshes the parked
    /// copy rather than duplicating it.
    pub fn submit(&self, package: Package) {
        let mut inner = self.inner.lock();
        let mut matched = false;
        inner.hooks.retain(|hook| {
            if hook.filter.matches(&package) {
                match hook.sender.send(package.clone()) {
                    Ok(()) => {
                        matched = true;
                        true
                    }
                    // Receiver side is gone; drop the hook.
                    Err(_) => false,
                }
            } else {
                true
            }
        });
        if !matched {
            let digest = package.message.hexdigest();
            inner.pool.retain(|entry| entry.digest != digest);
            inner.pool.push(PoolEntry { digest, package });
        }
    }

    /// Drop parked packages older than the hold window.
    pub fn expire_pool(&self) {
        let hold = self.hold;
        self.inner
            .lock()
            .pool
            .retain(|entry| entry.package.received_at.elapsed() < hold);
    }
}

/// The receiving side of a registered hook. Dropping it unregisters the
/// hook.
pub struct HookHandle {
    id: u64,
    registry: HookRegistry,
    receiver: mpsc::UnboundedReceiver<Package>,
}

impl HookHandle {
    /// Wait for the next matching package.
    pub async fn recv(&mut self) -> Option<Package> {
        self.receiver.recv().await
    }

    /// Wait for the next matching package, up to `timeout`.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Package> {
        tokio::time::timeout(timeout, self.receiver.recv())
            .await
            .ok()
            .flatten()
    }
}

impl Drop for HookHandle {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn package(msg_type: MsgType) -> Package {
        Package::new(PrismMessage::new(msg_type), None)
    }

    #[tokio::test]
    async fn matching_hook_receives_package() {
        let registry = HookRegistry::new(Duration::from_secs(5));
        let mut hook = registry.register(HookFilter::TypeIn(vec![MsgType::Lsp]));
        registry.submit(package(MsgType::Lsp));
        registry.submit(package(MsgType::Arks));
        let got = hook.recv().await.unwrap();
        assert_eq!(got.message.msg_type, MsgType::Lsp);
    }

    #[tokio::test]
    async fn unmatched_packages_replay_to_late_hooks() {
        let registry = HookRegistry::new(Duration::from_secs(5));
        registry.submit(package(MsgType::FloodMsg));
        let mut hook = registry.register(HookFilter::TypeIn(vec![MsgType::FloodMsg]));
        let got = hook.recv_timeout(Duration::from_millis(100)).await.unwrap();
        assert_eq!(got.message.msg_type, MsgType::FloodMsg);
    }

    #[tokio::test]
    async fn expired_pool_entries_are_dropped() {
        let registry = HookRegistry::new(Duration::from_millis(0));
        registry.submit(package(MsgType::FloodMsg));
        registry.expire_pool();
        let mut hook = registry.register(HookFilter::Any);
        assert!(hook.recv_timeout(Duration::from_millis(50)).await.is_none());
    }

    #[test]
    fn mpc_response_filter_checks_every_coordinate() {
        let filter = HookFilter::MpcResponse {
            pseudonym: vec![1; 32],
            party_id: 2,
            op_id: vec![9; 32],
            action: Some(Action::FindHandler),
        };
        let mut message = PrismMessage {
            dest_party_id: Some(2),
            mpc_map: Some(prism_types::message::MpcMap {
                action: Some(Action::FindHandler),
                request_id: Some(vec![9; 32]),
                ..Default::default()
            }),
            ..PrismMessage::new(MsgType::MpcResponse)
        };
        assert!(filter.matches(&Package::new(message.clone(), None)));

        message.dest_party_id = Some(3);
        assert!(!filter.matches(&Package::new(message.clone(), None)));

        message.dest_party_id = Some(2);
        message.mpc_map.as_mut().unwrap().action = Some(Action::Retrieve);
        assert!(!filter.matches(&Package::new(message, None)));
    }
}
