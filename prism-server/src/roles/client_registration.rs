//! The client-registration role: one shard of the committee that issues
//! IBE private keys to bootstrapping clients.
//!
//! The role participates in the network as a client of its own: requests
//! arrive through the normal send/poll pipeline addressed to the server's
//! name, and key shards travel back the same way. Each shard server can
//! compute its own XOR shard of any identity key deterministically, so the
//! committee needs no coordination.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine as _;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use prism_client::PrismClient;
use prism_client::config::ClientConfig;
use prism_core::envelope;
use prism_core::halfkey::PrivateHalfKey;
use prism_core::ibe::{identity_key, identity_key_shard};
use prism_core::make_nonce;
use prism_types::cleartext::ClearText;
use prism_types::message::{MsgType, PrismMessage};

use crate::roles::announcer::{Announcer, ArkBehavior};
use crate::roles::context::RoleContext;

/// One registration committee shard.
pub struct RegistrationRole {
    /// Shared role context.
    pub ctx: Arc<RoleContext>,
    /// Announcing machinery.
    pub announcer: Arc<Announcer>,
    /// The embedded client this role sends and receives through.
    pub client: Arc<PrismClient>,
    ibe_params: Vec<u8>,
    distributed: Mutex<HashMap<String, Vec<u8>>>,
}

impl RegistrationRole {
    /// Build the role and its embedded client.
    pub fn new(
        ctx: Arc<RoleContext>,
        vrf_sortition: Option<prism_core::vrf::VrfSortition>,
    ) -> Arc<Self> {
        let announcer = Announcer::new(ctx.clone(), vrf_sortition);
        let ibe_params = base64::engine::general_purpose::STANDARD
            .decode(&ctx.config.ibe_public_params)
            .unwrap_or_default();

        let mut client_config = ClientConfig::for_node(&ctx.server_data.id);
        client_config.pseudonym_salt = ctx.config.pseudonym_salt.clone();
        client_config.ibe_public_params = ctx.config.ibe_public_params.clone();
        client_config.ibe_private_key = Some(
            base64::engine::general_purpose::STANDARD
                .encode(identity_key(&ibe_params, &ctx.server_data.id)),
        );
        let client = PrismClient::new(
            client_config,
            ctx.transport.base().clone(),
            Some(ctx.keys.identity.root_key),
        );

        let role = Arc::new(Self {
            ctx,
            announcer,
            client,
            ibe_params,
            distributed: Mutex::new(HashMap::new()),
        });
        role.announcer.set_behavior(role.clone());
        role
    }

    /// Run until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> eyre::Result<()> {
        let mut tasks = tokio::task::JoinSet::new();
        tasks.spawn(self.ctx.flooding.clone().listen_task(cancel.clone()));
        tasks.spawn(self.ctx.ls_routing.clone().main_task(cancel.clone()));
        tasks.spawn(self.announcer.clone().run(cancel.clone()));

        let mut inbox = self.client.subscribe();
        tasks.spawn({
            let client = self.client.clone();
            async move { client.run().await }
        });
        tasks.spawn({
            let this = self.clone();
            let cancel = cancel.clone();
            async move {
                loop {
                    let clear = tokio::select! {
                        clear = inbox.recv() => clear,
                        _ = cancel.cancelled() => return,
                    };
                    let Some(clear) = clear else { return };
                    this.message_received(clear);
                }
            }
        });

        cancel.cancelled().await;
        self.client.cancel_token().cancel();
        tasks.abort_all();
        Ok(())
    }

    fn message_received(&self, clear: ClearText) {
        let Some(bytes) = &clear.message_bytes else {
            return;
        };
        let Ok(request) = PrismMessage::decode(bytes) else {
            return;
        };
        if request.msg_type != MsgType::ClientRegistrationRequest {
            tracing::warn!("received message that wasn't a registration request");
            return;
        }
        if !self.authorize(&request) {
            tracing::warn!("received unauthorized registration request");
            return;
        }
        self.register_client(&request);
    }

    /// A name may only re-request a key with the nonce it first used, so a
    /// later impostor cannot re-pull someone's key.
    fn authorize(&self, request: &PrismMessage) -> bool {
        let (Some(name), Some(nonce)) = (&request.name, &request.nonce) else {
            return false;
        };
        match self.distributed.lock().get(name) {
            Some(known) => known == nonce,
            None => true,
        }
    }

    fn register_client(&self, request: &PrismMessage) {
        let (Some(client_name), Some(request_nonce), Some(client_half_key)) =
            (&request.name, &request.nonce, &request.half_key)
        else {
            return;
        };
        let shard = identity_key_shard(
            &self.ibe_params,
            client_name,
            self.ctx.config.ibe_shard_index,
            self.ctx.config.ibe_shard_count.max(1),
        );

        let inner = PrismMessage {
            name: Some(self.ctx.server_data.id.clone()),
            nonce: Some(request_nonce.clone()),
            ciphertext: Some(shard.to_vec()),
            ..PrismMessage::new(MsgType::ClientRegistrationResponse)
        };
        let key = PrivateHalfKey::generate();
        let nonce = make_nonce();
        let Some(ciphertext) = envelope::encrypt(&inner, &key, client_half_key, &nonce) else {
            return;
        };
        let response = PrismMessage {
            ciphertext: Some(ciphertext),
            nonce: Some(nonce),
            half_key: Some(key.public()),
            ..PrismMessage::new(MsgType::EncryptRegistrationMessage)
        };

        self.distributed
            .lock()
            .insert(client_name.clone(), request_nonce.clone());
        tracing::debug!("issuing IBE key shard to {client_name}");

        let clear = ClearText {
            use_ibe: false,
            message_bytes: Some(response.encode()),
            message: None,
            ..ClearText::new(self.ctx.server_data.id.clone(), client_name.clone(), "")
        };
        self.client.send_message(clear);
    }
}

impl ArkBehavior for RegistrationRole {}
