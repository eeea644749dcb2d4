#![deny(missing_docs)]
//! Server side of the PRISM anonymous messaging core.
//!
//! A [`PrismServer`] boots into a genesis epoch with a statically assigned
//! role, then follows [`EpochCommand`](prism_types::epoch::EpochCommand)s:
//! `NEW(seed)` builds and pre-runs a VRF-sorted successor epoch, `NEXT`
//! advances epochs through their lifecycle, `OFF` tears them down. Roles —
//! mixes, lock-free MPC dropbox committees, registration shards — live in
//! [`roles`]; the routing and gossip substrate in [`lsp`] and [`flooding`];
//! the MPC machinery in [`mpc`].

pub mod ark_store;
pub mod config;
pub mod data;
pub mod epoch;
pub mod flooding;
pub mod lsp;
pub mod metrics;
pub mod mpc;
pub mod roles;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use prism_transport::Transport;
use prism_types::epoch::{EpochCommand, EpochState};
use prism_types::state::StateStore;

pub use crate::config::ServerConfig;
pub use crate::data::NodeIdentity;
pub use crate::epoch::{Epoch, ServerShared};
pub use crate::roles::Role;

/// One PRISM server process.
pub struct PrismServer {
    shared: ServerShared,
    epochs: Mutex<HashMap<String, Arc<Epoch>>>,
    current: Mutex<Option<Arc<Epoch>>>,
    command_tx: mpsc::UnboundedSender<EpochCommand>,
    command_rx: Mutex<Option<mpsc::UnboundedReceiver<EpochCommand>>>,
    cancel: CancellationToken,
}

impl PrismServer {
    /// Build a server over its transport and persistent identity.
    pub fn new(
        config: ServerConfig,
        transport: Arc<Transport>,
        identity: NodeIdentity,
    ) -> Arc<Self> {
        let state_store = config
            .state_dir
            .as_ref()
            .map(StateStore::new)
            .unwrap_or_else(StateStore::ephemeral);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            shared: ServerShared {
                config: Arc::new(config),
                transport,
                state_store,
                identity,
            },
            epochs: Mutex::new(HashMap::new()),
            current: Mutex::new(None),
            command_tx,
            command_rx: Mutex::new(Some(command_rx)),
            cancel: CancellationToken::new(),
        })
    }

    /// Enqueue an epoch command.
    pub fn epoch_command(&self, command: EpochCommand) {
        let _ = self.command_tx.send(command);
    }

    /// The cancellation token ending [`Self::run`].
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The epoch currently considered live.
    pub fn current_epoch(&self) -> Option<Arc<Epoch>> {
        self.current.lock().clone()
    }

    /// Look up a live epoch by name.
    pub fn epoch(&self, name: &str) -> Option<Arc<Epoch>> {
        self.epochs.lock().get(name).cloned()
    }

    fn launch(&self, epoch: Arc<Epoch>) {
        tracing::debug!("launching epoch {}", epoch.name);
        self.epochs.lock().insert(epoch.name.clone(), epoch.clone());
        *self.current.lock() = Some(epoch.clone());
        if epoch.state() == EpochState::Running {
            tokio::spawn(async move { epoch.run().await });
        }
    }

    fn target_epochs(&self, name: &Option<String>) -> Vec<Arc<Epoch>> {
        let epochs = self.epochs.lock();
        match name {
            Some(name) => epochs.get(name).cloned().into_iter().collect(),
            None => epochs
                .values()
                .filter(|epoch| epoch.state() != EpochState::Off)
                .cloned()
                .collect(),
        }
    }

    /// Run the server: boot the genesis epoch and drain epoch commands
    /// until cancelled.
    pub async fn run(self: Arc<Self>) -> eyre::Result<()> {
        let transport = self.shared.transport.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move { transport.run(cancel).await });

        let genesis = Epoch::from_seed(&self.shared, None, None)?;
        self.launch(genesis);

        let Some(mut commands) = self.command_rx.lock().take() else {
            eyre::bail!("server already running");
        };
        loop {
            let command = tokio::select! {
                command = commands.recv() => command,
                _ = self.cancel.cancelled() => break,
            };
            let Some(command) = command else { break };
            if let Err(err) = self.handle_command(command).await {
                tracing::error!("epoch command failed: {err:?}");
            }
        }

        // Cascade cancellation into every live epoch.
        for epoch in self.epochs.lock().values() {
            epoch.run_cancel_token().cancel();
        }
        Ok(())
    }

    async fn handle_command(self: &Arc<Self>, command: EpochCommand) -> eyre::Result<()> {
        match command {
            EpochCommand::New { seed } => {
                let previous = self.current_epoch();
                let epoch = Epoch::from_seed(&self.shared, previous, Some(&seed))?;
                epoch.pre_run().await;
                self.launch(epoch);
            }
            EpochCommand::Next { epoch } => {
                for target in self.target_epochs(&epoch) {
                    tracing::debug!("advancing epoch {} to next state", target.name);
                    target.next_state().await;
                }
            }
            EpochCommand::Off { epoch } => {
                for target in self.target_epochs(&epoch) {
                    tracing::debug!("shutting down epoch {}", target.name);
                    target.shutdown().await;
                }
            }
            EpochCommand::FloodEpoch { epoch } => {
                for target in self.target_epochs(&epoch) {
                    let ark = target.epoch_ark.lock().clone();
                    if target.state() == EpochState::PreRun
                        && let Some(ark) = ark
                    {
                        target.flood_previous(ark).await;
                    }
                }
            }
            EpochCommand::FloodLsp { epoch } => {
                for target in self.target_epochs(&epoch) {
                    target.flood_lsp();
                }
            }
        }
        Ok(())
    }
}
