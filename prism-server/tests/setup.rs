//! Shared harness for the in-process integration suites: a memory-network
//! deployment of servers and clients with a common root authority.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use ed25519_dalek::SigningKey;

use prism_client::PrismClient;
use prism_client::config::ClientConfig;
use prism_core::cert::RootAuthority;
use prism_core::ibe::identity_key;
use prism_server::data::NodeIdentity;
use prism_server::{PrismServer, ServerConfig};
use prism_transport::Transport;
use prism_transport::memory::{MemoryNetwork, direct_channel_desc, indirect_channel_desc};

/// Deployment-wide IBE parameters shared by all test clients.
pub const IBE_TEST_PARAMS: &[u8] = b"prism-test-ibe-root";

/// One in-process deployment.
pub struct TestNet {
    /// The shared router.
    pub network: MemoryNetwork,
    /// The deployment root.
    pub root: RootAuthority,
}

#[allow(dead_code)]
impl TestNet {
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
        Self {
            network: MemoryNetwork::new(),
            root: RootAuthority::generate(),
        }
    }

    /// A fresh identity certified by the deployment root.
    pub fn identity_for(&self, name: &str) -> NodeIdentity {
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let certificate = self.root.issue(name, &signing_key.verifying_key());
        NodeIdentity {
            signing_key,
            certificate,
            root_key: self.root.verifying_key(),
        }
    }

    /// A transport attached to the network with one direct and one
    /// indirect channel.
    pub fn transport_for(&self, name: &str) -> Arc<Transport> {
        let transport = Transport::new(name, Duration::from_secs(30));
        self.network.attach(transport.clone());
        transport.add_channel(self.network.channel(name, direct_channel_desc("direct")));
        transport.add_channel(self.network.channel(name, indirect_channel_desc("indirect")));
        transport
    }

    /// Spawn a server and its run loop.
    pub fn spawn_server(&self, config: ServerConfig) -> (Arc<PrismServer>, Arc<Transport>) {
        let transport = self.transport_for(&config.name);
        let identity = self.identity_for(&config.name);
        let server = PrismServer::new(config, transport.clone(), identity);
        let run = server.clone();
        tokio::spawn(async move {
            if let Err(err) = run.run().await {
                tracing::error!("server run failed: {err:?}");
            }
        });
        (server, transport)
    }

    /// Spawn a client, joined to the `*client` broadcast group. Clients
    /// without IBE configuration get pre-provisioned keys under the
    /// deployment-wide test parameters.
    pub fn spawn_client(&self, mut config: ClientConfig) -> (Arc<PrismClient>, Arc<Transport>) {
        if config.ibe_public_params.is_empty() {
            let engine = base64::engine::general_purpose::STANDARD;
            config.ibe_public_params = engine.encode(IBE_TEST_PARAMS);
            config.ibe_private_key =
                Some(engine.encode(identity_key(IBE_TEST_PARAMS, &config.name)));
        }
        let transport = self.transport_for(&config.name);
        self.network.join_group("*client", &config.name);
        let client = PrismClient::new(config, transport.clone(), Some(self.root.verifying_key()));
        let run = client.clone();
        tokio::spawn(async move { run.run().await });
        (client, transport)
    }

    /// Load a direct send link from `transport` to the named node.
    pub async fn load_direct(&self, transport: &Arc<Transport>, target: &str, epoch: &str) {
        let channel = &transport.channels()[0];
        channel
            .load_link(&format!("node:{target}"), &[target.to_owned()], epoch)
            .await
            .expect("direct memory links always load");
    }

    /// Load a `*client` broadcast group link onto `transport`.
    pub async fn load_client_group(&self, transport: &Arc<Transport>, epoch: &str) {
        let channel = &transport.channels()[0];
        channel
            .load_link("group:*client", &["*client".to_owned()], epoch)
            .await
            .expect("group memory links always load");
    }
}

/// Await `predicate` becoming true, panicking after `timeout`.
#[allow(dead_code)]
pub async fn wait_until(timeout: Duration, what: &str, predicate: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !predicate() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
