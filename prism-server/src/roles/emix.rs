//! The EMIX role: peel one onion layer, mix, forward.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use parking_lot::Mutex;
use prism_types::message::{MsgType, PrismMessage};

use crate::metrics::METRICS_ID_MIX_FORWARDED;
use crate::roles::announcer::Announcer;
use crate::roles::context::RoleContext;
use crate::roles::mixing::MixStrategy;

/// An onion mix for one epoch.
pub struct EmixRole {
    /// Shared role context.
    pub ctx: Arc<RoleContext>,
    /// Announcing machinery.
    pub announcer: Arc<Announcer>,
    mix: Arc<MixStrategy>,
    pool_flush: Mutex<Option<mpsc::UnboundedReceiver<PrismMessage>>>,
}

impl EmixRole {
    /// Build the role.
    pub fn new(
        ctx: Arc<RoleContext>,
        vrf_sortition: Option<prism_core::vrf::VrfSortition>,
    ) -> Arc<Self> {
        let announcer = Announcer::new(ctx.clone(), vrf_sortition);
        let (mix, pool_flush) = MixStrategy::from_config(&ctx.config);
        let role = Arc::new(Self {
            ctx,
            announcer,
            mix: Arc::new(mix),
            pool_flush: Mutex::new(pool_flush),
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
        tasks.spawn(self.clone().mix_intake_loop(cancel.clone()));
        if let Some(flush) = self.pool_flush.lock().take() {
            tasks.spawn(self.clone().pool_flush_loop(flush, cancel.clone()));
        }
        if self.ctx.config.dynamic_links {
            tasks.spawn(self.clone().link_maintenance_loop(cancel.clone()));
        }
        cancel.cancelled().await;
        tasks.abort_all();
        Ok(())
    }

    async fn link_maintenance_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            self.announcer.maintain_incoming_link("uplink", "*uplink").await;
            self.announcer.maintain_outgoing_link("ark").await;
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        }
    }

    async fn mix_intake_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut hook = self
            .ctx
            .type_hook(true, vec![MsgType::EncryptEmixMessage]);
        loop {
            let package = tokio::select! {
                package = hook.recv() => package,
                _ = cancel.cancelled() => return,
            };
            let Some(package) = package else { return };
            let Some(decrypted) = self.ctx.open_incoming(package.message) else {
                continue;
            };
            let this = self.clone();
            tokio::spawn(async move { this.mix_handler(decrypted).await });
        }
    }

    async fn mix_handler(&self, decrypted: PrismMessage) {
        match decrypted.msg_type {
            MsgType::LinkRequest => self.handle_client_link_request(decrypted).await,
            MsgType::SendToEmix | MsgType::SendToDropbox => {
                let Some(inner) = decrypted.sub_msg.map(|m| *m) else {
                    tracing::debug!("mix message without inner layer");
                    return;
                };
                let Some(inner) = self.mix.mix(inner).await else {
                    return; // pooled; flush loop forwards it later
                };
                self.forward(inner).await;
            }
            other => tracing::debug!("mix ignoring decrypted {other:?}"),
        }
    }

    async fn pool_flush_loop(
        self: Arc<Self>,
        mut flush: mpsc::UnboundedReceiver<PrismMessage>,
        cancel: CancellationToken,
    ) {
        loop {
            let message = tokio::select! {
                message = flush.recv() => message,
                _ = cancel.cancelled() => return,
            };
            let Some(message) = message else { return };
            self.forward(message).await;
        }
    }

    /// Forward the inner layer towards its next hop, retrying on transport
    /// failure.
    async fn forward(&self, inner: PrismMessage) {
        let limit = self.ctx.config.mix_forward_retry_limit.max(1);
        for attempt in 0..limit {
            if self.ctx.emit(inner.clone(), None).await {
                ::metrics::counter!(METRICS_ID_MIX_FORWARDED).increment(1);
                return;
            }
            tracing::warn!(
                "failed to forward mixed message (attempt {}); retrying in {:?}",
                attempt + 1,
                self.ctx.config.mix_forward_retry_delay
            );
            tokio::time::sleep(self.ctx.config.mix_forward_retry_delay).await;
        }
        tracing::error!("could not forward mixed message after {limit} attempts; giving up");
    }

    /// A client asked us to load a return link so a dropbox can later
    /// reply through it.
    async fn handle_client_link_request(&self, request: PrismMessage) {
        let Some(address) = request
            .link_addresses
            .as_deref()
            .and_then(<[_]>::first)
        else {
            return;
        };
        let endpoints = vec![request.name.clone().unwrap_or_else(|| "*client".into())];
        tracing::debug!("loading client-requested link on {}", address.channel_id);
        if self
            .ctx
            .transport
            .load_address(address, &endpoints)
            .await
            .is_none()
        {
            tracing::error!("could not load requested link from {:?}", address);
        }
    }
}

impl crate::roles::announcer::ArkBehavior for EmixRole {}
