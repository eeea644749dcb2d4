//! The context shared by every role of one epoch: transport, identity,
//! routing, and flooding. Each epoch exclusively owns its context.

use std::sync::Arc;

use prism_core::envelope;
use prism_transport::EpochTransport;
use prism_transport::hooks::{HookFilter, HookHandle};
use prism_types::message::{MsgType, PrismMessage};
use prism_types::state::StateStore;

use crate::config::ServerConfig;
use crate::data::{KeyMaterial, ServerData};
use crate::flooding::Flooding;
use crate::lsp::LsRouting;

/// Everything a role needs from its epoch.
pub struct RoleContext {
    /// Server tunables.
    pub config: Arc<ServerConfig>,
    /// Epoch-scoped transport.
    pub transport: EpochTransport,
    /// Persisted-state store.
    pub state_store: StateStore,
    /// This server's data for the epoch.
    pub server_data: ServerData,
    /// Epoch key material.
    pub keys: KeyMaterial,
    /// Link-state routing instance (owned by this epoch).
    pub ls_routing: Arc<LsRouting>,
    /// Flooding database (owned by this epoch).
    pub flooding: Arc<Flooding>,
}

impl RoleContext {
    /// Assemble a context. Dropbox and registration servers advertise a
    /// high link cost so traffic is not routed through them.
    pub fn new(
        config: Arc<ServerConfig>,
        transport: EpochTransport,
        state_store: StateStore,
        server_data: ServerData,
        keys: KeyMaterial,
    ) -> Arc<Self> {
        let lsp_cost = if server_data.role_name.starts_with("DROPBOX")
            || server_data.role_name.starts_with("CLIENT")
        {
            100
        } else {
            1
        };
        let ls_routing = LsRouting::new(
            &server_data,
            lsp_cost,
            transport.clone(),
            state_store.clone(),
            config.clone(),
        );
        let flooding = Flooding::new(
            server_data.pseudonym.clone(),
            transport.clone(),
            config.clone(),
        );
        Arc::new(Self {
            config,
            transport,
            state_store,
            server_data,
            keys,
            ls_routing,
            flooding,
        })
    }

    /// This server's pseudonym.
    pub fn pseudonym(&self) -> &[u8] {
        &self.server_data.pseudonym
    }

    /// The epoch name.
    pub fn epoch(&self) -> &str {
        &self.server_data.epoch
    }

    /// Emit a message, resolving the address from its pseudonym via the
    /// router unless overridden.
    pub async fn emit(&self, message: PrismMessage, address: Option<String>) -> bool {
        self.ls_routing.emit(message, address).await
    }

    /// Register a hook for the given message types addressed to us (or to
    /// nobody in particular).
    pub fn type_hook(&self, require_pseudonym: bool, types: Vec<MsgType>) -> HookHandle {
        let filter = if require_pseudonym {
            HookFilter::TypeIn(types).and(HookFilter::Pseudonym(self.pseudonym().to_vec()))
        } else {
            HookFilter::TypeIn(types)
        };
        self.transport.register_hook(filter)
    }

    /// Peel the encryption layer off an inbound package when present:
    /// messages carrying ciphertext, half-key, and nonce are opened with
    /// this epoch's private key. Undecryptable traffic is dropped.
    pub fn open_incoming(&self, message: PrismMessage) -> Option<PrismMessage> {
        if message.ciphertext.is_some() && message.half_key.is_some() && message.nonce.is_some() {
            let decrypted = envelope::decrypt(&message, &self.keys.private_key, None)?;
            tracing::debug!("handling decrypted {:?}", decrypted.msg_type);
            Some(decrypted)
        } else {
            Some(message)
        }
    }
}
