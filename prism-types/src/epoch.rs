//! Epoch lifecycle types shared by servers and clients.

/// Where an epoch is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochState {
    /// Role built, epoch ARK flooded through the previous epoch, links
    /// preloaded; not yet serving.
    PreRun,
    /// Role main loop active.
    Running,
    /// No new client work accepted; outstanding polls still served.
    Handoff,
    /// Torn down; all tasks cancelled and links closed.
    Off,
}

/// Commands driving epoch transitions, delivered on an async queue.
#[derive(Debug, Clone)]
pub enum EpochCommand {
    /// Seed and pre-run a new epoch.
    New {
        /// The VRF seed; doubles as the epoch name.
        seed: Vec<u8>,
    },
    /// Advance an epoch (or every live epoch) to its next state.
    Next {
        /// Restrict to one epoch by name.
        epoch: Option<String>,
    },
    /// Tear an epoch (or every live epoch) down.
    Off {
        /// Restrict to one epoch by name.
        epoch: Option<String>,
    },
    /// Re-flood a pre-run epoch's ARK through its predecessor.
    FloodEpoch {
        /// Restrict to one epoch by name.
        epoch: Option<String>,
    },
    /// Trigger an LSP refresh for an epoch.
    FloodLsp {
        /// Restrict to one epoch by name.
        epoch: Option<String>,
    },
}
