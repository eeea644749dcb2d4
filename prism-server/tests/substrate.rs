//! Integration coverage of the control-plane substrate: flooding
//! propagation and link-state routing convergence/recovery.

mod setup;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use prism_core::pseudonym::Pseudonym;
use prism_server::ServerConfig;
use prism_server::data::ServerData;
use prism_server::flooding::Flooding;
use prism_server::lsp::LsRouting;
use prism_transport::{EpochTransport, Transport};
use prism_types::message::{MsgType, PrismMessage};
use prism_types::state::StateStore;

use setup::{TestNet, wait_until};

fn fast_ls_config(name: &str) -> ServerConfig {
    let mut config = ServerConfig::for_node(name);
    config.ls_routing = true;
    config.ls_neighbor_discovery_sleep = Duration::from_millis(200);
    config.ls_presumed_dead_timeout = Duration::from_millis(800);
    config.ls_q_rate_limit = Duration::from_millis(5);
    // ALIVE window ~1.2s: silent neighbors get probed quickly, so the
    // dead-node recovery path runs within the test budget.
    config.cs2_ark_timeout = Duration::from_secs(60);
    config.ls_alive_factor = 0.02;
    config
}

struct LsNode {
    ls: Arc<LsRouting>,
    transport: Arc<Transport>,
    pseudonym: Vec<u8>,
}

fn ls_node(net: &TestNet, name: &str, cancel: &CancellationToken) -> LsNode {
    let transport = net.transport_for(name);
    let epoch_transport = EpochTransport::new(transport.clone(), "genesis");
    let server_data = ServerData::new(name, "", "EMIX", "genesis");
    let pseudonym = server_data.pseudonym.clone();
    let ls = LsRouting::new(
        &server_data,
        1,
        epoch_transport,
        StateStore::ephemeral(),
        Arc::new(fast_ls_config(name)),
    );
    tokio::spawn(ls.clone().main_task(cancel.clone()));
    ls.start();
    LsNode {
        ls,
        transport,
        pseudonym,
    }
}

async fn wire_pair(net: &TestNet, a: &LsNode, b_name: &str, b: &LsNode, a_name: &str) {
    net.load_direct(&a.transport, b_name, "genesis").await;
    net.load_direct(&b.transport, a_name, "genesis").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lsp_routing_converges_and_drops_dead_nodes() {
    let net = TestNet::new();
    let cancel = CancellationToken::new();

    // A line topology: a - b - c.
    let a = ls_node(&net, "ls-a", &cancel);
    let b = ls_node(&net, "ls-b", &cancel);
    let c = ls_node(&net, "ls-c", &cancel);
    wire_pair(&net, &a, "ls-b", &b, "ls-a").await;
    wire_pair(&net, &b, "ls-c", &c, "ls-b").await;

    // Every pair in the component converges, including the indirect a-c.
    let c_hex = hex::encode(&c.pseudonym);
    let b_hex = hex::encode(&b.pseudonym);
    {
        let a_ls = a.ls.clone();
        let c_hex = c_hex.clone();
        wait_until(Duration::from_secs(60), "routing convergence", move || {
            a_ls.db.reachable_destinations().contains(&c_hex)
        })
        .await;
    }
    // The next hop towards c from a must be b.
    assert_eq!(a.ls.db.next_hop(&c_hex), Some(b_hex));

    // Kill c. a should, within the presumed-dead window, drop routes to it.
    net.network.disconnect("ls-c");
    {
        let a_ls = a.ls.clone();
        let c_hex = c_hex.clone();
        wait_until(Duration::from_secs(60), "dead node removal", move || {
            !a_ls.db.reachable_destinations().contains(&c_hex)
        })
        .await;
    }
    // a and b still reach each other.
    assert!(
        a.ls
            .db
            .reachable_destinations()
            .contains(&hex::encode(&b.pseudonym))
    );
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn floods_reach_every_node_in_the_component()
{
    let net = TestNet::new();
    let cancel = CancellationToken::new();
    let config = Arc::new(ServerConfig::for_node("flood"));

    let mut nodes = Vec::new();
    for name in ["fl-a", "fl-b", "fl-c"] {
        let transport = net.transport_for(name);
        let epoch_transport = EpochTransport::new(transport.clone(), "genesis");
        let pseudonym = Pseudonym::from_address(name, "").as_bytes().to_vec();
        let flooding = Flooding::new(pseudonym, epoch_transport, config.clone());
        tokio::spawn(flooding.clone().listen_task(cancel.clone()));
        nodes.push((flooding, transport));
    }
    // Chain: a - b - c.
    net.load_direct(&nodes[0].1, "fl-b", "genesis").await;
    net.load_direct(&nodes[1].1, "fl-a", "genesis").await;
    net.load_direct(&nodes[1].1, "fl-c", "genesis").await;
    net.load_direct(&nodes[2].1, "fl-b", "genesis").await;

    let payload = PrismMessage {
        name: Some("announcement".into()),
        ..PrismMessage::new(MsgType::EpochArk)
    };
    nodes[0].0.initiate(payload).await;

    for (flooding, _) in &nodes {
        let flooding = flooding.clone();
        wait_until(Duration::from_secs(30), "flood propagation", move || {
            flooding.len() == 1
        })
        .await;
    }
    // Each node stored the payload itself, not the flood envelope.
    for (flooding, _) in &nodes {
        let payloads = flooding.payloads();
        assert_eq!(payloads[0].msg_type, MsgType::EpochArk);
        assert_eq!(payloads[0].name.as_deref(), Some("announcement"));
    }
    cancel.cancel();
}
