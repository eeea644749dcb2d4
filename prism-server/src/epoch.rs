//! Epochs: a time window with a fixed role assignment. Genesis epochs take
//! their role from configuration; later epochs are seeded and sorted via
//! the VRF. Epochs move through PRE_RUN → RUNNING → HANDOFF → OFF, flooding
//! their successor announcement through the outgoing epoch's control plane
//! and handing ARK stores across the EMIX switchover.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use prism_core::cert::sign_ark;
use prism_core::vrf::{VrfDistribution, VrfSortition};
use prism_transport::{EpochTransport, Link, Transport};
use prism_types::epoch::EpochState;
use prism_types::message::{MsgType, PrismMessage};
use prism_types::state::StateStore;

use crate::config::ServerConfig;
use crate::data::{KeyMaterial, NodeIdentity, ServerData};
use crate::roles::{
    DummyRole, EmixRole, LockFreeDropbox, RegistrationRole, Role, RoleContext,
};

/// What every epoch borrows from the server process.
#[derive(Clone)]
pub struct ServerShared {
    /// Server tunables.
    pub config: Arc<ServerConfig>,
    /// The node-wide transport.
    pub transport: Arc<Transport>,
    /// Persisted-state store.
    pub state_store: StateStore,
    /// Persistent identity (signing key, certificate, root anchor).
    pub identity: NodeIdentity,
}

/// One epoch of one server.
pub struct Epoch {
    /// The epoch name (the seed string; `genesis` for the first).
    pub name: String,
    /// Lifecycle state.
    pub state: Mutex<EpochState>,
    /// Epoch-scoped transport view.
    pub transport: EpochTransport,
    /// The role this server plays in the epoch.
    pub role: Role,
    /// The announcement flooded through the previous epoch during PRE_RUN.
    pub epoch_ark: Mutex<Option<PrismMessage>>,
    /// The preloaded incoming link for this epoch's traffic.
    pub epoch_link: Mutex<Option<Arc<dyn Link>>>,
    previous: Option<Arc<Epoch>>,
    run_cancel: CancellationToken,
    keys: KeyMaterial,
}

impl Epoch {
    /// Build an epoch: the genesis epoch when `seed` is `None`, a
    /// VRF-sorted epoch otherwise.
    pub fn from_seed(
        shared: &ServerShared,
        previous: Option<Arc<Epoch>>,
        seed: Option<&[u8]>,
    ) -> eyre::Result<Arc<Self>> {
        let (name, sortition, server_data) = match seed {
            None => {
                let role_name = match shared.config.role.to_ascii_uppercase().as_str() {
                    "OFF" => "DUMMY".to_owned(),
                    other => other.to_owned(),
                };
                let mut data = ServerData::new(
                    &shared.config.name,
                    &shared.config.pseudonym_salt,
                    role_name,
                    "genesis",
                );
                data.dropbox_index = shared.config.dropbox_index;
                ("genesis".to_owned(), None, data)
            }
            Some(seed) => {
                let name = String::from_utf8_lossy(seed).into_owned();
                let (distribution, committees) =
                    VrfDistribution::role_distribution(&shared.config.vrf_config())?;
                let sortition = VrfSortition::new(distribution);
                let (bucket, proof) =
                    sortition.sort_and_prove(&shared.identity.signing_key, seed);

                let (role_name, committee, dropbox_index) = if bucket == "OFF" {
                    ("DUMMY".to_owned(), None, None)
                } else if bucket.starts_with("DROPBOX") {
                    let (n_range, _) = committees
                        .get(&bucket)
                        .copied()
                        .ok_or_else(|| eyre::eyre!("unknown committee bucket {bucket}"))?;
                    ("DROPBOX_LF".to_owned(), Some(bucket.clone()), Some(n_range - 1))
                } else {
                    (bucket.clone(), None, None)
                };

                let mut data = ServerData::new(
                    &shared.config.name,
                    &shared.config.pseudonym_salt,
                    role_name,
                    name.clone(),
                );
                data.committee = committee;
                data.dropbox_index = dropbox_index;
                data.proof = Some(proof);
                (name, Some(sortition), data)
            }
        };

        let transport = EpochTransport::new(shared.transport.clone(), name.clone());
        let keys = KeyMaterial::for_epoch(shared.identity.clone());
        let ctx = RoleContext::new(
            shared.config.clone(),
            transport.clone(),
            shared.state_store.clone(),
            server_data.clone(),
            keys.clone(),
        );

        let previous_flood = previous.as_ref().map(|epoch| epoch.role.flooding());
        let role = match server_data.role_name.as_str() {
            "EMIX" => Role::Emix(EmixRole::new(ctx, sortition)),
            "DROPBOX_LF" => {
                Role::DropboxLf(LockFreeDropbox::new(ctx, sortition, previous_flood)?)
            }
            "CLIENT_REGISTRATION" => {
                Role::ClientRegistration(RegistrationRole::new(ctx, sortition))
            }
            "DUMMY" => Role::Dummy(DummyRole::new(ctx)),
            other => eyre::bail!("unknown role {other}"),
        };

        let state = if seed.is_none() {
            EpochState::Running
        } else {
            EpochState::PreRun
        };
        Ok(Arc::new(Self {
            name,
            state: Mutex::new(state),
            transport,
            role,
            epoch_ark: Mutex::new(None),
            epoch_link: Mutex::new(None),
            previous,
            run_cancel: CancellationToken::new(),
            keys,
        }))
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EpochState {
        *self.state.lock()
    }

    /// The token cancelling this epoch's tasks.
    pub fn run_cancel_token(&self) -> CancellationToken {
        self.run_cancel.clone()
    }

    /// Re-flood this epoch's announcement through its predecessor.
    pub async fn flood_previous(&self, ark: PrismMessage) {
        if let Some(previous) = &self.previous {
            previous.flood_ark(ark).await;
        }
    }

    /// PRE_RUN: preload the incoming epoch link, mint the epoch ARK, and
    /// flood it through the previous epoch so successor routing info leaks
    /// in over the outgoing control plane.
    pub async fn pre_run(&self) {
        let link = self.make_epoch_link().await;
        let ark = self.make_epoch_ark(link.as_ref());
        *self.epoch_link.lock() = link;
        *self.epoch_ark.lock() = Some(ark.clone());
        if let Some(previous) = &self.previous {
            previous.flood_ark(ark).await;
        }
    }

    async fn make_epoch_link(&self) -> Option<Arc<dyn Link>> {
        let mut channels = self.transport.channels();
        channels.retain(|channel| {
            let desc = channel.descriptor();
            desc.link_direction.sender_loaded()
                && desc.status.usable()
                && desc.tags.iter().any(|t| t == "epoch")
        });
        // Prefer indirect channels for cross-epoch reachability.
        channels.sort_by_key(|channel| {
            (channel.descriptor().connection_type
                != prism_transport::enums::ConnectionType::Indirect) as u8
        });
        let channel = channels.into_iter().next()?;
        self.transport
            .create_link(&channel, &[format!("epoch-{}", self.name)])
            .await
    }

    fn make_epoch_ark(&self, link: Option<&Arc<dyn Link>>) -> PrismMessage {
        let data = &self.role.ctx().server_data;
        let ark = PrismMessage {
            name: Some(data.id.clone()),
            pseudonym: Some(data.pseudonym.clone()),
            role: Some(data.role_name.clone()),
            committee: data.committee.clone(),
            half_key: Some(self.keys.private_key.public()),
            epoch: Some(self.name.clone()),
            certificate: Some(self.keys.identity.certificate.clone()),
            proof: data.proof.clone(),
            link_addresses: link.map(|l| vec![l.profile().address()]),
            ..PrismMessage::new(MsgType::EpochArk)
        };
        sign_ark(ark, &self.keys.identity.signing_key)
    }

    /// Flood an (epoch) ARK through this epoch's control plane.
    pub async fn flood_ark(&self, ark: PrismMessage) {
        tracing::debug!("flooding epoch ARK through epoch {}", self.name);
        self.role.flooding().initiate(ark).await;
    }

    /// Trigger an LSP refresh.
    pub fn flood_lsp(&self) {
        self.role.ctx().ls_routing.trigger_aliveness();
    }

    /// RUNNING: hand our ARK store to the outgoing EMIX, then run the role
    /// until the epoch is torn down.
    pub async fn run(self: Arc<Self>) {
        if let Some(previous) = &self.previous {
            self.handoff_to_previous(previous);
        }
        if let Err(err) = self.role.run(self.run_cancel.clone()).await {
            tracing::error!("epoch {} role failed: {err:?}", self.name);
            *self.state.lock() = EpochState::Off;
            self.shutdown().await;
        }
    }

    /// On servers that were EMIXes in the previous epoch, hand them our
    /// new ARK store so clients hear about next-epoch servers before the
    /// switchover.
    fn handoff_to_previous(&self, previous: &Arc<Epoch>) {
        if matches!(previous.role, Role::Emix(_))
            && let Some(store) = self.role.ark_store()
        {
            tracing::debug!(
                "asking previous epoch {} to broadcast our ARKs",
                previous.name
            );
            previous.role.handoff_arks(store);
        }
    }

    /// Advance one lifecycle step. Spawns the role when entering RUNNING.
    pub async fn next_state(self: &Arc<Self>) {
        let current = self.state();
        match current {
            EpochState::PreRun => {
                *self.state.lock() = EpochState::Running;
                let epoch = self.clone();
                tokio::spawn(async move { epoch.run().await });
            }
            EpochState::Running => {
                *self.state.lock() = EpochState::Handoff;
                self.role.enter_handoff();
            }
            EpochState::Handoff => {
                *self.state.lock() = EpochState::Off;
                tracing::debug!("shutting down epoch {}", self.name);
                self.shutdown().await;
            }
            EpochState::Off => {}
        }
    }

    /// Cancel every task of this epoch and close its links.
    pub async fn shutdown(&self) {
        *self.state.lock() = EpochState::Off;
        tracing::debug!("cancelling tasks for epoch {}", self.name);
        self.run_cancel.cancel();
        tracing::debug!("closing links for epoch {}", self.name);
        self.transport.close_epoch_links().await;
    }
}
