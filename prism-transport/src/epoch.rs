//! Epoch scoping: a view of the node transport that tags every created
//! link with its epoch and filters delivery accordingly.

use std::sync::Arc;
use std::time::Duration;

use prism_types::message::{LinkAddress, PrismMessage};

use crate::hooks::{HookFilter, HookHandle};
use crate::transport::{Channel, Link, LinkProfile, Transport};

/// An epoch-scoped wrapper over the shared [`Transport`]. Hooks registered
/// through it implicitly require the delivering link to belong to this
/// epoch, and links it creates or loads are tagged with the epoch, so
/// traffic from adjacent epochs never crosses over.
#[derive(Clone)]
pub struct EpochTransport {
    inner: Arc<Transport>,
    /// The epoch this view is scoped to.
    pub epoch: String,
}

impl EpochTransport {
    /// Scope `inner` to `epoch`.
    pub fn new(inner: Arc<Transport>, epoch: impl Into<String>) -> Self {
        Self {
            inner,
            epoch: epoch.into(),
        }
    }

    /// The unscoped transport.
    pub fn base(&self) -> &Arc<Transport> {
        &self.inner
    }

    /// This node's address.
    pub fn local_address(&self) -> &str {
        &self.inner.local_address
    }

    /// All configured channels (link creation through them is scoped by the
    /// `epoch` argument the caller passes, which should be this epoch).
    pub fn channels(&self) -> Vec<Arc<dyn Channel>> {
        self.inner.channels()
    }

    /// Usable send links of this epoch reaching `address`.
    pub fn links_for_address(&self, address: &str) -> Vec<Arc<dyn Link>> {
        self.inner.links_for(address, Some(&self.epoch))
    }

    /// Register a hook further restricted to this epoch's links.
    pub fn register_hook(&self, filter: HookFilter) -> HookHandle {
        self.inner
            .register_hook(HookFilter::Epoch(self.epoch.clone()).and(filter))
    }

    /// Deliver a message to this node's own hooks within this epoch.
    pub fn deliver_local(&self, message: PrismMessage) {
        self.inner.deliver_local(message, &self.epoch);
    }

    /// [`Transport::emit_on_links`], restricted to this epoch.
    pub async fn emit_on_links(
        &self,
        address: &str,
        message: &PrismMessage,
        timeout: Option<Duration>,
        link_filter: Option<&(dyn Fn(&LinkProfile) -> bool + Sync)>,
    ) -> bool {
        self.inner
            .emit_on_links(address, message, Some(&self.epoch), timeout, link_filter)
            .await
    }

    /// Resolve a cross-channel address into a send link of this epoch.
    pub async fn load_address(
        &self,
        address: &LinkAddress,
        endpoints: &[String],
    ) -> Option<Arc<dyn Link>> {
        self.inner
            .load_address(address, endpoints, &self.epoch)
            .await
    }

    /// Create a receive link of this epoch on the given channel.
    pub async fn create_link(
        &self,
        channel: &Arc<dyn Channel>,
        endpoints: &[String],
    ) -> Option<Arc<dyn Link>> {
        channel.create_link(endpoints, &self.epoch).await
    }

    /// Close every link belonging to this epoch.
    pub async fn close_epoch_links(&self) {
        for channel in self.inner.channels() {
            for link in channel.links() {
                if link.profile().epoch == self.epoch {
                    link.close().await;
                }
            }
        }
    }
}
