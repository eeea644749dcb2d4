//! Metric identifiers exported by server roles.

/// Gauge: fragments currently stored on this dropbox peer.
pub const METRICS_ID_DROPBOX_STORED_FRAGMENTS: &str = "prism_dropbox_stored_fragments";

/// Gauge: polls currently being served.
pub const METRICS_ID_DROPBOX_ACTIVE_POLLS: &str = "prism_dropbox_active_polls";

/// Gauge: preproducts available across owned batches.
pub const METRICS_ID_MPC_PREPRODUCTS_AVAILABLE: &str = "prism_mpc_preproducts_available";

/// Counter: preproduct batches that failed to generate.
pub const METRICS_ID_MPC_BATCH_FAILURES: &str = "prism_mpc_batch_failures";

/// Counter: store attempts retried with a fresh fragment id.
pub const METRICS_ID_DROPBOX_STORE_RETRIES: &str = "prism_dropbox_store_retries";

/// Counter: messages forwarded by the mix.
pub const METRICS_ID_MIX_FORWARDED: &str = "prism_mix_forwarded";

/// Gauge: servers currently known and valid in the ARK store.
pub const METRICS_ID_ARK_VALID_SERVERS: &str = "prism_ark_valid_servers";

/// Counter: NARKs broadcast for unreachable servers.
pub const METRICS_ID_NARKS_SENT: &str = "prism_narks_sent";
