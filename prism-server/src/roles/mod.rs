//! Server roles. Each epoch assigns every server exactly one role: a mix
//! (EMIX), a lock-free MPC dropbox committee member, a client-registration
//! shard, or a dummy (sorted out of service). Roles are an explicit sum
//! type; the shared announcing machinery (ARK minting, broadcast, NARKs,
//! LSP participation) lives in [`announcer`].

pub mod announcer;
pub mod client_registration;
pub mod context;
pub mod dropbox;
pub mod emix;
pub mod mixing;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::ark_store::ArkStore;
use crate::flooding::Flooding;

pub use announcer::{Announcer, ArkBehavior};
pub use client_registration::RegistrationRole;
pub use context::RoleContext;
pub use dropbox::LockFreeDropbox;
pub use emix::EmixRole;

/// The role a server plays for one epoch.
#[derive(Clone)]
pub enum Role {
    /// Onion mix.
    Emix(Arc<EmixRole>),
    /// Lock-free MPC dropbox committee member.
    DropboxLf(Arc<LockFreeDropbox>),
    /// IBE registration committee shard.
    ClientRegistration(Arc<RegistrationRole>),
    /// Sorted out of service; announces nothing, floods control traffic.
    Dummy(Arc<DummyRole>),
}

impl Role {
    /// The registry name of this role.
    pub fn name(&self) -> &'static str {
        match self {
            Role::Emix(_) => "EMIX",
            Role::DropboxLf(_) => "DROPBOX_LF",
            Role::ClientRegistration(_) => "CLIENT_REGISTRATION",
            Role::Dummy(_) => "DUMMY",
        }
    }

    /// The role's shared context.
    pub fn ctx(&self) -> &Arc<RoleContext> {
        match self {
            Role::Emix(role) => &role.ctx,
            Role::DropboxLf(role) => &role.ctx,
            Role::ClientRegistration(role) => &role.ctx,
            Role::Dummy(role) => &role.ctx,
        }
    }

    /// The role's flooding database.
    pub fn flooding(&self) -> Arc<Flooding> {
        self.ctx().flooding.clone()
    }

    /// The announcing machinery, for roles that announce.
    pub fn announcer(&self) -> Option<&Arc<Announcer>> {
        match self {
            Role::Emix(role) => Some(&role.announcer),
            Role::DropboxLf(role) => Some(&role.announcer),
            Role::ClientRegistration(role) => Some(&role.announcer),
            Role::Dummy(role) => Some(&role.announcer),
        }
    }

    /// This role's ARK store.
    pub fn ark_store(&self) -> Option<Arc<Mutex<ArkStore>>> {
        self.announcer().map(|a| a.ark_store.clone())
    }

    /// Hand a successor epoch's ARK store to this (outgoing EMIX) role so
    /// clients hear about next-epoch servers before the switchover.
    pub fn handoff_arks(&self, store: Arc<Mutex<ArkStore>>) {
        if let Some(announcer) = self.announcer() {
            announcer.set_handoff_store(store);
        }
    }

    /// Stop accepting new client work (epoch HANDOFF).
    pub fn enter_handoff(&self) {
        if let Role::DropboxLf(role) = self {
            role.enter_handoff();
        }
    }

    /// Run the role until cancelled.
    pub async fn run(&self, cancel: CancellationToken) -> eyre::Result<()> {
        tracing::info!("chosen role: {}", self.name());
        match self {
            Role::Emix(role) => role.clone().run(cancel).await,
            Role::DropboxLf(role) => role.clone().run(cancel).await,
            Role::ClientRegistration(role) => role.clone().run(cancel).await,
            Role::Dummy(role) => role.clone().run(cancel).await,
        }
    }
}

/// A server sorted out of service for the epoch: keeps the control plane
/// (flooding, routing) alive but never announces.
pub struct DummyRole {
    /// Shared role context.
    pub ctx: Arc<RoleContext>,
    /// Announcing machinery, muted.
    pub announcer: Arc<Announcer>,
    // Keeps the muted behavior alive; the announcer only holds it weakly.
    _behavior: Arc<MutedArks>,
}

struct MutedArks;

impl ArkBehavior for MutedArks {
    fn ark_ready(&self) -> bool {
        false
    }

    fn ark_broadcasting(&self) -> bool {
        false
    }
}

impl DummyRole {
    /// Build a dummy role.
    pub fn new(ctx: Arc<RoleContext>) -> Arc<Self> {
        let announcer = Announcer::new(ctx.clone(), None);
        let behavior = Arc::new(MutedArks);
        announcer.set_behavior(behavior.clone());
        Arc::new(Self {
            ctx,
            announcer,
            _behavior: behavior,
        })
    }

    /// Run until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> eyre::Result<()> {
        let mut tasks = tokio::task::JoinSet::new();
        tasks.spawn(self.ctx.flooding.clone().listen_task(cancel.clone()));
        tasks.spawn(self.ctx.ls_routing.clone().main_task(cancel.clone()));
        tasks.spawn(self.announcer.clone().run(cancel.clone()));
        cancel.cancelled().await;
        tasks.abort_all();
        Ok(())
    }
}
