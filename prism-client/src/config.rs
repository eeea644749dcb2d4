//! Client configuration, settable via CLI flags or `PRISM_CLIENT_*`
//! environment variables.

use std::time::Duration;

use clap::Parser;

/// Tunables for one client process.
#[derive(Parser, Debug, Clone)]
pub struct ClientConfig {
    /// The client's name; pseudonyms and IBE identities derive from it.
    #[clap(long, env = "PRISM_CLIENT_NAME")]
    pub name: String,

    /// Salt mixed into every pseudonym derivation.
    #[clap(long, env = "PRISM_CLIENT_PSEUDONYM_SALT", default_value = "")]
    pub pseudonym_salt: String,

    /// Total number of dropbox shard indices in the deployment.
    #[clap(long, env = "PRISM_CLIENT_DROPBOX_COUNT", default_value = "1")]
    pub dropbox_count: u64,

    /// How many consecutive shard indices serve each recipient.
    #[clap(long, env = "PRISM_CLIENT_DROPBOXES_PER_CLIENT", default_value = "1")]
    pub dropboxes_per_client: u64,

    /// How many distinct dropboxes each outgoing message is sent to.
    #[clap(long, env = "PRISM_CLIENT_DROPBOX_SEND_REDUNDANCY", default_value = "1")]
    pub dropbox_send_redundancy: usize,

    /// Base poll period in milliseconds.
    #[clap(long, env = "PRISM_CLIENT_POLL_TIMING_MS", default_value = "3000")]
    pub poll_timing_ms: u64,

    /// Whether polls carry an expiration so the dropbox keeps checking
    /// until the next poll is due.
    #[clap(long, env = "PRISM_CLIENT_POLL_WITH_DURATION", default_value = "false")]
    pub dropbox_poll_with_duration: bool,

    /// Whether the client polls at all.
    #[clap(long, env = "PRISM_CLIENT_POLLING", default_value = "true")]
    pub polling: bool,

    /// Target number of EMIX onion layers per route.
    #[clap(long, env = "PRISM_CLIENT_ONION_LAYERS", default_value = "3")]
    pub onion_layers: usize,

    /// Largest accepted plaintext, in bytes.
    #[clap(long, env = "PRISM_CLIENT_MAX_PLAINTEXT_SIZE", default_value = "10000")]
    pub max_plaintext_size: usize,

    /// How long a message digest stays in the dedupe set.
    #[clap(long, env = "PRISM_CLIENT_MSG_SEEN_TTL", default_value="10min", value_parser = humantime::parse_duration)]
    pub msg_seen_ttl: Duration,

    /// Cadence of the dedupe purge task.
    #[clap(long, env = "PRISM_CLIENT_MSG_SEEN_SLEEP", default_value="30s", value_parser = humantime::parse_duration)]
    pub msg_seen_sleep: Duration,

    /// Send attempts before an emit is abandoned for this cycle.
    #[clap(long, env = "PRISM_CLIENT_EMIT_RETRIES", default_value = "3")]
    pub emit_retries: u32,

    /// Pause between emit retries.
    #[clap(long, env = "PRISM_CLIENT_SLEEP_TRY_EMITTING", default_value="2s", value_parser = humantime::parse_duration)]
    pub sleep_try_emitting: Duration,

    /// Whether links are created/loaded on demand (off for statically
    /// wired deployments).
    #[clap(long, env = "PRISM_CLIENT_DYNAMIC_LINKS", default_value = "false")]
    pub dynamic_links: bool,

    /// Link maintenance cycle period.
    #[clap(long, env = "PRISM_CLIENT_LINK_MAINTENANCE_INTERVAL", default_value="10s", value_parser = humantime::parse_duration)]
    pub link_maintenance_interval: Duration,

    /// Desired number of connected first-hop EMIXes.
    #[clap(long, env = "PRISM_CLIENT_EMIX_COUNT", default_value = "2")]
    pub client_emix_count: usize,

    /// Name prefix of the client-registration committee.
    #[clap(long, env = "PRISM_CLIENT_IBE_COMMITTEE_NAME", default_value = "registration")]
    pub ibe_committee_name: String,

    /// Number of registration committee shards.
    #[clap(long, env = "PRISM_CLIENT_IBE_SHARDS", default_value = "1")]
    pub ibe_shards: usize,

    /// Base64 IBE public parameters.
    #[clap(long, env = "PRISM_CLIENT_IBE_PUBLIC_PARAMS", default_value = "")]
    pub ibe_public_params: String,

    /// Base64 IBE private key, when pre-provisioned.
    #[clap(long, env = "PRISM_CLIENT_IBE_PRIVATE_KEY")]
    pub ibe_private_key: Option<String>,

    /// Pause between IBE bootstrap request rounds.
    #[clap(long, env = "PRISM_CLIENT_BOOTSTRAP_REQUEST_INTERVAL", default_value="10s", value_parser = humantime::parse_duration)]
    pub bootstrap_request_interval: Duration,

    /// Base64 ARKs used to bootstrap the server DB before any broadcast is
    /// heard.
    #[clap(long, env = "PRISM_CLIENT_BOOTSTRAP_ARKS", value_delimiter = ',')]
    pub bootstrap_arks: Vec<String>,

    /// The epoch the bootstrap ARKs belong to.
    #[clap(long, env = "PRISM_CLIENT_BOOTSTRAP_EPOCH", default_value = "genesis")]
    pub bootstrap_epoch: String,

    /// Directory for persisted state; ephemeral when unset.
    #[clap(long, env = "PRISM_CLIENT_STATE_DIR")]
    pub state_dir: Option<String>,
}

impl ClientConfig {
    /// A config with defaults suitable for in-process tests.
    pub fn for_node(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pseudonym_salt: String::new(),
            dropbox_count: 1,
            dropboxes_per_client: 1,
            dropbox_send_redundancy: 1,
            poll_timing_ms: 500,
            dropbox_poll_with_duration: false,
            polling: true,
            onion_layers: 1,
            max_plaintext_size: 10_000,
            msg_seen_ttl: Duration::from_secs(600),
            msg_seen_sleep: Duration::from_secs(30),
            emit_retries: 3,
            sleep_try_emitting: Duration::from_millis(200),
            dynamic_links: false,
            link_maintenance_interval: Duration::from_secs(10),
            client_emix_count: 2,
            ibe_committee_name: "registration".into(),
            ibe_shards: 1,
            ibe_public_params: String::new(),
            ibe_private_key: None,
            bootstrap_request_interval: Duration::from_secs(2),
            bootstrap_arks: Vec::new(),
            bootstrap_epoch: "genesis".into(),
            state_dir: None,
        }
    }

    /// The poll period as a [`Duration`].
    pub fn poll_timing(&self) -> Duration {
        Duration::from_millis(self.poll_timing_ms)
    }
}
