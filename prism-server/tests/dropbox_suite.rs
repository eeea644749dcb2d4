//! End-to-end scenarios over a 4-peer lock-free MPC dropbox committee:
//! store, oblivious find, retrieve, delete, and the failure modes around
//! them.

mod setup;

use std::sync::Arc;
use std::time::Duration;

use prism_client::PrismClient;
use prism_client::config::ClientConfig;
use prism_server::roles::Role;
use prism_server::{PrismServer, ServerConfig};
use prism_transport::Transport;
use prism_types::cleartext::ClearText;

use setup::{TestNet, wait_until};

const COMMITTEE: [&str; 4] = ["db-0", "db-1", "db-2", "db-3"];

struct Deployment {
    net: TestNet,
    dropboxes: Vec<(Arc<PrismServer>, Arc<Transport>)>,
    #[allow(dead_code)]
    mix: (Arc<PrismServer>, Arc<Transport>),
}

impl Deployment {
    async fn start() -> Self {
        let net = TestNet::new();

        let mut dropboxes = Vec::new();
        for (i, name) in COMMITTEE.iter().enumerate() {
            let mut config = ServerConfig::for_node(*name);
            config.role = "DROPBOX_LF".into();
            config.committee_members = COMMITTEE.join(",");
            config.party_id = i as i64;
            config.dropbox_index = Some(0);
            config.mpc_nparties = 4;
            config.threshold = 2;
            config.mpc_preproduct_batch_size = 8;
            dropboxes.push(net.spawn_server(config));
        }

        let mix = net.spawn_server(ServerConfig::for_node("mix-0"));
        // The mix reaches the committee directly and broadcasts to clients.
        for name in COMMITTEE {
            net.load_direct(&mix.1, name, "genesis").await;
        }
        net.load_client_group(&mix.1, "genesis").await;
        // The committee leader replies to clients over the broadcast group.
        net.load_client_group(&dropboxes[0].1, "genesis").await;

        Self {
            net,
            dropboxes,
            mix,
        }
    }

    async fn start_client(&self, name: &str) -> Arc<PrismClient> {
        let mut config = ClientConfig::for_node(name);
        config.onion_layers = 1;
        config.poll_timing_ms = 500;
        let (client, transport) = self.net.spawn_client(config);
        self.net.load_direct(&transport, "mix-0", "genesis").await;
        client
    }

    fn dropbox_role(&self, index: usize) -> Arc<prism_server::roles::LockFreeDropbox> {
        let epoch = self.dropboxes[index]
            .0
            .current_epoch()
            .expect("genesis epoch is live");
        match &epoch.role {
            Role::DropboxLf(role) => role.clone(),
            other => panic!("expected a dropbox role, got {}", other.name()),
        }
    }

    fn stored_total(&self) -> usize {
        (0..self.dropboxes.len())
            .map(|i| self.dropbox_role(i).stored_fragment_count())
            .sum()
    }

    /// Wait until a client has heard verified ARKs for the mix and the
    /// committee leader.
    async fn wait_bootstrapped(&self, client: &Arc<PrismClient>) {
        let client = client.clone();
        wait_until(Duration::from_secs(90), "client server discovery", move || {
            let known = client.known_servers("genesis");
            known.iter().any(|name| name == "mix-0")
                && known.iter().any(|name| name == "db-0")
        })
        .await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn oblivious_dropbox_store_find_retrieve_roundtrip() {
    let deployment = Deployment::start().await;
    let alice = deployment.start_client("alice").await;
    let bob = deployment.start_client("bob").await;
    let mut bob_inbox = bob.subscribe();

    deployment.wait_bootstrapped(&alice).await;
    deployment.wait_bootstrapped(&bob).await;

    alice.send_message(ClearText::new("alice", "bob", "hello bob"));
    alice.send_message(ClearText::new("alice", "bob", "and hello again"));

    let mut received = Vec::new();
    while received.len() < 2 {
        let clear = tokio::time::timeout(Duration::from_secs(120), bob_inbox.recv())
            .await
            .expect("bob should receive both messages in time")
            .expect("client delegate channel stays open");
        assert_eq!(clear.sender, "alice");
        assert_eq!(clear.receiver, "bob");
        received.push(clear.message.unwrap_or_default());
    }
    received.sort();
    assert_eq!(received, vec!["and hello again", "hello bob"]);

    // Delivered fragments are deleted committee-wide (best-effort gossip,
    // but nothing here is partitioned).
    wait_until(Duration::from_secs(60), "fragment deletion", {
        let counts = move || deployment.stored_total();
        move || counts() == 0
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mismatched_pseudonym_reveals_nothing() {
    let deployment = Deployment::start().await;
    let alice = deployment.start_client("alice").await;
    let carol = deployment.start_client("carol").await;
    let mut carol_inbox = carol.subscribe();

    deployment.wait_bootstrapped(&alice).await;
    deployment.wait_bootstrapped(&carol).await;

    alice.send_message(ClearText::new("alice", "bob", "for bob only"));

    // Wait until the message is stored, then give carol several poll
    // cycles against it.
    wait_until(Duration::from_secs(90), "fragment storage", {
        let stored = {
            let d = &deployment;
            let roles: Vec<_> = (0..4).map(|i| d.dropbox_role(i)).collect();
            move || {
                roles
                    .iter()
                    .filter(|r| r.stored_fragment_count() > 0)
                    .count()
            }
        };
        move || stored() >= 2
    })
    .await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    // Carol's polls opened nonzero values only: no delivery, and the
    // fragments stay stored for bob.
    assert!(carol_inbox.try_recv().is_err(), "carol must receive nothing");
    assert!(carol.message_store.from_sender("alice").is_empty());
    assert!(deployment.stored_total() > 0, "fragments must remain stored");

    // Bob shows up later and still gets the message.
    let bob = deployment.start_client("bob").await;
    let mut bob_inbox = bob.subscribe();
    deployment.wait_bootstrapped(&bob).await;
    let clear = tokio::time::timeout(Duration::from_secs(120), bob_inbox.recv())
        .await
        .expect("bob should still receive the stored message")
        .expect("client delegate channel stays open");
    assert_eq!(clear.message.as_deref(), Some("for bob only"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn poll_fails_below_threshold_and_recovers() {
    let deployment = Deployment::start().await;
    let alice = deployment.start_client("alice").await;
    let bob = deployment.start_client("bob").await;
    let mut bob_inbox = bob.subscribe();

    deployment.wait_bootstrapped(&alice).await;
    deployment.wait_bootstrapped(&bob).await;

    alice.send_message(ClearText::new("alice", "bob", "under threshold"));
    wait_until(Duration::from_secs(90), "fragment storage", {
        let d = &deployment;
        let roles: Vec<_> = (0..4).map(|i| d.dropbox_role(i)).collect();
        move || {
            roles
                .iter()
                .filter(|r| r.stored_fragment_count() > 0)
                .count()
                >= 2
        }
    })
    .await;

    // Partition three of four peers away: no threshold subset remains.
    for name in &COMMITTEE[1..] {
        deployment.net.network.disconnect(name);
    }
    tokio::time::sleep(Duration::from_secs(8)).await;
    assert!(
        bob_inbox.try_recv().is_err(),
        "a poll without a threshold subset must return nothing"
    );

    // Heal the partition; the next poll cycles succeed.
    for i in 1..COMMITTEE.len() {
        deployment
            .net
            .network
            .attach(deployment.dropboxes[i].1.clone());
    }
    let clear = tokio::time::timeout(Duration::from_secs(120), bob_inbox.recv())
        .await
        .expect("bob should receive the message after the partition heals")
        .expect("client delegate channel stays open");
    assert_eq!(clear.message.as_deref(), Some("under threshold"));
}
