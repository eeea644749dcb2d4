//! Server configuration, settable via CLI flags or `PRISM_SERVER_*`
//! environment variables. Covers every protocol tunable: MPC geometry and
//! timeouts, ARK broadcast cadence, LSP tuning, NARK pacing, gossip
//! fan-out, and sortition distribution.

use std::time::Duration;

use clap::Parser;
use num_bigint::BigUint;

use prism_core::field;
use prism_core::vrf::VrfConfig;

/// Tunables for one server process.
#[derive(Parser, Debug, Clone)]
pub struct ServerConfig {
    /// The server's name.
    #[clap(long, env = "PRISM_SERVER_NAME")]
    pub name: String,

    /// Salt mixed into every pseudonym derivation.
    #[clap(long, env = "PRISM_SERVER_PSEUDONYM_SALT", default_value = "")]
    pub pseudonym_salt: String,

    /// Directory for persisted state; ephemeral when unset.
    #[clap(long, env = "PRISM_SERVER_STATE_DIR")]
    pub state_dir: Option<String>,

    /// Statically assigned role for the genesis epoch.
    #[clap(long, env = "PRISM_SERVER_ROLE", default_value = "EMIX")]
    pub role: String,

    /// Comma-separated committee member names for a genesis dropbox.
    #[clap(long, env = "PRISM_SERVER_COMMITTEE_MEMBERS", default_value = "")]
    pub committee_members: String,

    /// This server's party id in the genesis committee (-1 = not a member).
    #[clap(long, env = "PRISM_SERVER_PARTY_ID", default_value = "-1")]
    pub party_id: i64,

    /// Dropbox shard index served by this server.
    #[clap(long, env = "PRISM_SERVER_DROPBOX_INDEX")]
    pub dropbox_index: Option<u64>,

    /// Whether ARK/LSP control traffic runs at all.
    #[clap(long, env = "PRISM_SERVER_CONTROL_TRAFFIC", default_value = "true")]
    pub control_traffic: bool,

    /// Whether link-state routing is used to address peers by pseudonym.
    #[clap(long, env = "PRISM_SERVER_LS_ROUTING", default_value = "true")]
    pub ls_routing: bool,

    /// Whether links are created/loaded on demand.
    #[clap(long, env = "PRISM_SERVER_DYNAMIC_LINKS", default_value = "false")]
    pub dynamic_links: bool,

    /// Template for direct channel addresses of named nodes.
    #[clap(long, env = "PRISM_SERVER_DIRECT_ADDRESS_FORMAT", default_value = "node:{name}")]
    pub direct_address_format: String,

    /// How long unmatched inbound packages are held for late hooks.
    #[clap(long, env = "PRISM_SERVER_DT_HOLD_PACKAGE", default_value="60s", value_parser = humantime::parse_duration)]
    pub dt_hold_package: Duration,

    // --- MPC geometry -----------------------------------------------------
    /// Committee size.
    #[clap(long, env = "PRISM_SERVER_MPC_NPARTIES", default_value = "4")]
    pub mpc_nparties: u64,

    /// Reconstruction threshold.
    #[clap(long, env = "PRISM_SERVER_THRESHOLD", default_value = "2")]
    pub threshold: u64,

    /// Field modulus (decimal or 0x-hex); defaults to 2^521 - 1.
    #[clap(long, env = "PRISM_SERVER_MPC_MODULUS")]
    pub mpc_modulus: Option<String>,

    // --- Preproduct pipeline ---------------------------------------------
    /// Preproducts generated per batch.
    #[clap(long, env = "PRISM_SERVER_MPC_PREPRODUCT_BATCH_SIZE", default_value = "50")]
    pub mpc_preproduct_batch_size: usize,

    /// Refill when stock falls below `batch_size * refresh_threshold`.
    #[clap(long, env = "PRISM_SERVER_MPC_PREPRODUCT_REFRESH_THRESHOLD", default_value = "0.5")]
    pub mpc_preproduct_refresh_threshold: f64,

    /// Per-preproduct slice of the batch generation timeout, in seconds.
    #[clap(long, env = "PRISM_SERVER_MPC_LF_BATCH_TIMEOUT", default_value = "0.5")]
    pub mpc_lf_batch_timeout: f64,

    // --- Dropbox op tuning ------------------------------------------------
    /// Concurrent store requests.
    #[clap(long, env = "PRISM_SERVER_MPC_LF_CONCURRENT_STORE_LIMIT", default_value = "16")]
    pub mpc_lf_concurrent_store_limit: usize,

    /// Concurrent find ops.
    #[clap(long, env = "PRISM_SERVER_MPC_LF_CONCURRENT_FIND_LIMIT", default_value = "4")]
    pub mpc_lf_concurrent_find_limit: usize,

    /// Max fragments checked per find op.
    #[clap(long, env = "PRISM_SERVER_MPC_LF_FIND_LIMIT", default_value = "10")]
    pub mpc_lf_find_limit: usize,

    /// Store round timeout.
    #[clap(long, env = "PRISM_SERVER_MPC_LF_STORE_TIMEOUT", default_value="20s", value_parser = humantime::parse_duration)]
    pub mpc_lf_store_timeout: Duration,

    /// Find round base timeout (padded by traffic estimates).
    #[clap(long, env = "PRISM_SERVER_MPC_LF_CHECK_TIMEOUT", default_value="30s", value_parser = humantime::parse_duration)]
    pub mpc_lf_check_timeout: Duration,

    /// Retrieve round timeout.
    #[clap(long, env = "PRISM_SERVER_MPC_LF_RETRIEVE_TIMEOUT", default_value="30s", value_parser = humantime::parse_duration)]
    pub mpc_lf_retrieve_timeout: Duration,

    /// Handshake cadence/timeout.
    #[clap(long, env = "PRISM_SERVER_MPC_LF_HELLO_TIMEOUT", default_value="5s", value_parser = humantime::parse_duration)]
    pub mpc_lf_hello_timeout: Duration,

    /// Base timeout for small MPC rounds.
    #[clap(long, env = "PRISM_SERVER_MPC_LF_BASE_OP_TIMEOUT", default_value="10s", value_parser = humantime::parse_duration)]
    pub mpc_lf_base_op_timeout: Duration,

    /// Pause before retrying a failed client reply.
    #[clap(long, env = "PRISM_SERVER_MPC_LF_REPLY_RETRY", default_value="10s", value_parser = humantime::parse_duration)]
    pub mpc_lf_reply_retry: Duration,

    /// Whether committee-internal traffic is encrypted peer-to-peer.
    #[clap(long, env = "PRISM_SERVER_MPC_LF_ENCRYPT_PEER", default_value = "true")]
    pub mpc_lf_encrypt_peer: bool,

    /// Drop stored fragments older than this (handles fragments orphaned
    /// by store retries); unset disables the sweep.
    #[clap(long, env = "PRISM_SERVER_MPC_LF_FRAGMENT_TTL", value_parser = humantime::parse_duration)]
    pub mpc_lf_fragment_ttl: Option<Duration>,

    /// Dropbox → client reply deadline.
    #[clap(long, env = "PRISM_SERVER_DB_REPLY_TIMEOUT", default_value="10s", value_parser = humantime::parse_duration)]
    pub db_reply_timeout: Duration,

    // --- ARK broadcast ----------------------------------------------------
    /// Pause between ARKS broadcast batches.
    #[clap(long, env = "PRISM_SERVER_CS2_ARK_SLEEP_TIME", default_value="5s", value_parser = humantime::parse_duration)]
    pub cs2_ark_sleep_time: Duration,

    /// Own-ARK re-mint interval.
    #[clap(long, env = "PRISM_SERVER_CS2_ARK_TIMEOUT", default_value="5min", value_parser = humantime::parse_duration)]
    pub cs2_ark_timeout: Duration,

    /// ARK expiration = re-mint interval × this factor.
    #[clap(long, env = "PRISM_SERVER_CS2_ARK_EXPIRATION_FACTOR", default_value = "3.0")]
    pub cs2_ark_expiration_factor: f64,

    /// Upper bound on an ARKS batch when channel MTUs are unknown.
    #[clap(long, env = "PRISM_SERVER_CS2_ARKS_MAX_MTU", default_value = "65536")]
    pub cs2_arks_max_mtu: usize,

    // --- Link-state routing -----------------------------------------------
    /// Largest accepted LSP TTL, seconds.
    #[clap(long, env = "PRISM_SERVER_LS_TTL_MAX", default_value = "600")]
    pub ls_ttl_max: u64,

    /// TTL of our own LSPs, seconds.
    #[clap(long, env = "PRISM_SERVER_LS_TIME_TO_LIVE", default_value = "600")]
    pub ls_time_to_live: u64,

    /// Refresh our own LSP after this fraction of its TTL.
    #[clap(long, env = "PRISM_SERVER_LS_OWN_REFRESH", default_value = "0.66")]
    pub ls_own_refresh: f64,

    /// Max hops an LSP is flooded.
    #[clap(long, env = "PRISM_SERVER_LS_HOPS_MAX", default_value = "16")]
    pub ls_hops_max: u64,

    /// Neighbor ALIVE window = ARK re-mint interval × this factor.
    #[clap(long, env = "PRISM_SERVER_LS_ALIVE_FACTOR", default_value = "2.0")]
    pub ls_alive_factor: f64,

    /// Grace period before a silent neighbor is declared dead.
    #[clap(long, env = "PRISM_SERVER_LS_PRESUMED_DEAD_TIMEOUT", default_value="60s", value_parser = humantime::parse_duration)]
    pub ls_presumed_dead_timeout: Duration,

    /// Pause between neighbor discovery sweeps.
    #[clap(long, env = "PRISM_SERVER_LS_NEIGHBOR_DISCOVERY_SLEEP", default_value="10s", value_parser = humantime::parse_duration)]
    pub ls_neighbor_discovery_sleep: Duration,

    /// Hello reply deadline.
    #[clap(long, env = "PRISM_SERVER_LS_NEIGHBOR_TIMEOUT", default_value="5s", value_parser = humantime::parse_duration)]
    pub ls_neighbor_timeout: Duration,

    /// Drain interval of the LSP send/ack queues.
    #[clap(long, env = "PRISM_SERVER_LS_Q_RATE_LIMIT", default_value="50ms", value_parser = humantime::parse_duration)]
    pub ls_q_rate_limit: Duration,

    /// Hello attempts per (address, channel) before giving up.
    #[clap(long, env = "PRISM_SERVER_LS_MAX_DISCOVERY_ATTEMPTS", default_value = "10")]
    pub ls_max_discovery_attempts: u32,

    /// Forwarding attempts for an LSP_FWD hop.
    #[clap(long, env = "PRISM_SERVER_LS_N_TRIES_FORWARDING", default_value = "3")]
    pub ls_n_tries_forwarding: u32,

    /// Pause between forwarding attempts.
    #[clap(long, env = "PRISM_SERVER_LS_SLEEP_TRY_FORWARDING", default_value="2s", value_parser = humantime::parse_duration)]
    pub ls_sleep_try_forwarding: Duration,

    // --- NARK pacing --------------------------------------------------------
    /// Whether death notices are broadcast at all.
    #[clap(long, env = "PRISM_SERVER_NARK", default_value = "true")]
    pub nark: bool,

    /// Wait between the two reachability samples.
    #[clap(long, env = "PRISM_SERVER_NARK_CONFIRMATION", default_value="10s", value_parser = humantime::parse_duration)]
    pub nark_confirmation: Duration,

    /// Cooldown between NARK cycles.
    #[clap(long, env = "PRISM_SERVER_NARK_TIMEOUT", default_value="30s", value_parser = humantime::parse_duration)]
    pub nark_timeout: Duration,

    /// Whether routing changes may cut the cooldown short.
    #[clap(long, env = "PRISM_SERVER_NARK_ALLOW_CANCEL", default_value = "true")]
    pub nark_allow_cancel: bool,

    // --- Flooding -----------------------------------------------------------
    /// Stop forwarding floods past this hop count (0 = unlimited).
    #[clap(long, env = "PRISM_SERVER_FLOOD_MAX_HOPS", default_value = "16")]
    pub flood_max_hops: i64,

    /// Gossip fan-out: < 1 is a per-link probability, >= 1 a link count,
    /// 0 means every link.
    #[clap(long, env = "PRISM_SERVER_FLOOD_GOSSIP_R", default_value = "0")]
    pub flood_gossip_r: f64,

    /// Spread forwards over this window.
    #[clap(long, env = "PRISM_SERVER_FLOOD_SPREAD", default_value="0s", value_parser = humantime::parse_duration)]
    pub flood_spread: Duration,

    /// Forward floods on direct links only.
    #[clap(long, env = "PRISM_SERVER_FLOOD_VIA_DIRECT_ONLY", default_value = "false")]
    pub flood_via_direct_only: bool,

    // --- Sortition ----------------------------------------------------------
    /// Probability of sorting out of service.
    #[clap(long, env = "PRISM_SERVER_VRF_P_OFF", default_value = "0.0")]
    pub vrf_p_off: f64,

    /// Probability mass reserved for EMIX.
    #[clap(long, env = "PRISM_SERVER_VRF_P_EMIX", default_value = "0.5")]
    pub vrf_p_emix: f64,

    /// Number of dropbox index ranges.
    #[clap(long, env = "PRISM_SERVER_VRF_N_RANGES", default_value = "1")]
    pub vrf_n_ranges: u64,

    /// Committees per range.
    #[clap(long, env = "PRISM_SERVER_VRF_M_REPLICAS", default_value = "1")]
    pub vrf_m_replicas: u64,

    /// Optional static seed for the first sortition epoch.
    #[clap(long, env = "PRISM_SERVER_VRF_SEED")]
    pub vrf_seed: Option<String>,

    // --- Send resilience ----------------------------------------------------
    /// Emit attempts before giving up for this cycle.
    #[clap(long, env = "PRISM_SERVER_EMIT_RETRIES", default_value = "3")]
    pub emit_retries: u32,

    /// Pause between emit attempts.
    #[clap(long, env = "PRISM_SERVER_SLEEP_TRY_EMITTING", default_value="2s", value_parser = humantime::parse_duration)]
    pub sleep_try_emitting: Duration,

    // --- Mixing -------------------------------------------------------------
    /// Mix strategy: `idempotent`, `poisson`, or `pool`.
    #[clap(long, env = "PRISM_SERVER_MIX_STRATEGY", default_value = "idempotent")]
    pub mix_strategy: String,

    /// Rate parameter of the Poisson mix.
    #[clap(long, env = "PRISM_SERVER_MIX_POISSON_LAMBDA", default_value = "1.0")]
    pub mix_poisson_lambda: f64,

    /// Pool mix flush threshold.
    #[clap(long, env = "PRISM_SERVER_MIX_POOL_THRESHOLD", default_value = "4")]
    pub mix_pool_threshold: usize,

    /// Forward attempts before a mixed message is dropped.
    #[clap(long, env = "PRISM_SERVER_MIX_FORWARD_RETRY_LIMIT", default_value = "5")]
    pub mix_forward_retry_limit: u32,

    /// Pause between forward attempts.
    #[clap(long, env = "PRISM_SERVER_MIX_FORWARD_RETRY_DELAY", default_value="2s", value_parser = humantime::parse_duration)]
    pub mix_forward_retry_delay: Duration,

    // --- Registration committee ---------------------------------------------
    /// Base64 IBE public parameters (registration committee + clients).
    #[clap(long, env = "PRISM_SERVER_IBE_PUBLIC_PARAMS", default_value = "")]
    pub ibe_public_params: String,

    /// This server's shard index within the registration committee.
    #[clap(long, env = "PRISM_SERVER_IBE_SHARD_INDEX", default_value = "0")]
    pub ibe_shard_index: usize,

    /// Registration committee size.
    #[clap(long, env = "PRISM_SERVER_IBE_SHARD_COUNT", default_value = "1")]
    pub ibe_shard_count: usize,
}

impl ServerConfig {
    /// A config with fast timings suitable for in-process tests.
    pub fn for_node(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pseudonym_salt: String::new(),
            state_dir: None,
            role: "EMIX".into(),
            committee_members: String::new(),
            party_id: -1,
            dropbox_index: None,
            control_traffic: true,
            ls_routing: false,
            dynamic_links: false,
            direct_address_format: "node:{name}".into(),
            dt_hold_package: Duration::from_secs(30),
            mpc_nparties: 4,
            threshold: 2,
            mpc_modulus: None,
            mpc_preproduct_batch_size: 16,
            mpc_preproduct_refresh_threshold: 0.5,
            mpc_lf_batch_timeout: 0.5,
            mpc_lf_concurrent_store_limit: 16,
            mpc_lf_concurrent_find_limit: 4,
            mpc_lf_find_limit: 10,
            mpc_lf_store_timeout: Duration::from_secs(10),
            mpc_lf_check_timeout: Duration::from_secs(15),
            mpc_lf_retrieve_timeout: Duration::from_secs(15),
            mpc_lf_hello_timeout: Duration::from_millis(500),
            mpc_lf_base_op_timeout: Duration::from_secs(10),
            mpc_lf_reply_retry: Duration::from_secs(1),
            mpc_lf_encrypt_peer: true,
            mpc_lf_fragment_ttl: Some(Duration::from_secs(24 * 3600)),
            db_reply_timeout: Duration::from_secs(5),
            cs2_ark_sleep_time: Duration::from_millis(300),
            cs2_ark_timeout: Duration::from_secs(5),
            cs2_ark_expiration_factor: 3.0,
            cs2_arks_max_mtu: 65536,
            ls_ttl_max: 600,
            ls_time_to_live: 600,
            ls_own_refresh: 0.66,
            ls_hops_max: 16,
            ls_alive_factor: 2.0,
            ls_presumed_dead_timeout: Duration::from_secs(2),
            ls_neighbor_discovery_sleep: Duration::from_millis(500),
            ls_neighbor_timeout: Duration::from_secs(2),
            ls_q_rate_limit: Duration::from_millis(10),
            ls_max_discovery_attempts: 10,
            ls_n_tries_forwarding: 3,
            ls_sleep_try_forwarding: Duration::from_millis(200),
            nark: true,
            nark_confirmation: Duration::from_millis(500),
            nark_timeout: Duration::from_secs(2),
            nark_allow_cancel: true,
            flood_max_hops: 16,
            flood_gossip_r: 0.0,
            flood_spread: Duration::from_secs(0),
            flood_via_direct_only: false,
            vrf_p_off: 0.0,
            vrf_p_emix: 0.5,
            vrf_n_ranges: 1,
            vrf_m_replicas: 1,
            vrf_seed: None,
            emit_retries: 3,
            sleep_try_emitting: Duration::from_millis(200),
            mix_strategy: "idempotent".into(),
            mix_poisson_lambda: 1.0,
            mix_pool_threshold: 4,
            mix_forward_retry_limit: 5,
            mix_forward_retry_delay: Duration::from_millis(200),
            ibe_public_params: String::new(),
            ibe_shard_index: 0,
            ibe_shard_count: 1,
        }
    }

    /// The MPC field modulus.
    pub fn modulus(&self) -> eyre::Result<BigUint> {
        match &self.mpc_modulus {
            Some(text) => field::parse_modulus(text),
            None => Ok(field::default_modulus()),
        }
    }

    /// The sortition tuning block.
    pub fn vrf_config(&self) -> VrfConfig {
        VrfConfig {
            n_ranges: self.vrf_n_ranges,
            m_replicas: self.vrf_m_replicas,
            p_emix: self.vrf_p_emix,
            p_off: self.vrf_p_off,
        }
    }

    /// The direct-channel address of a named node.
    pub fn direct_address_for(&self, name: &str) -> String {
        self.direct_address_format.replace("{name}", name)
    }

    /// Genesis committee member names.
    pub fn genesis_committee(&self) -> Vec<String> {
        self.committee_members
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect()
    }
}
