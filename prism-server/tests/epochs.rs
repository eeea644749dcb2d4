//! Epoch lifecycle: seeding a successor epoch, flooding its announcement
//! through the outgoing epoch, and switching clients over.

mod setup;

use std::time::Duration;

use prism_client::config::ClientConfig;
use prism_server::ServerConfig;
use prism_types::epoch::{EpochCommand, EpochState};

use setup::{TestNet, wait_until};

fn emix_config(name: &str) -> ServerConfig {
    let mut config = ServerConfig::for_node(name);
    config.role = "EMIX".into();
    // Sortition mass: everything to EMIX so the whole fleet mixes.
    config.vrf_p_emix = 1.0;
    config.vrf_p_off = 0.0;
    config
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn epoch_transition_switches_servers_and_clients() {
    let net = TestNet::new();

    let names = ["mix-a", "mix-b", "mix-c"];
    let mut servers = Vec::new();
    for name in names {
        servers.push(net.spawn_server(emix_config(name)));
    }
    // Full mesh so genesis flooding reaches everyone.
    for (_, transport) in &servers {
        for name in names {
            if transport.local_address != name {
                net.load_direct(transport, name, "genesis").await;
            }
        }
    }

    let (client, _client_transport) = net.spawn_client(ClientConfig::for_node("claire"));
    assert_eq!(client.current_epoch(), "genesis");

    wait_until(Duration::from_secs(30), "genesis epochs live", {
        let servers: Vec<_> = servers.iter().map(|(s, _)| s.clone()).collect();
        move || {
            servers.iter().all(|server| {
                server
                    .current_epoch()
                    .is_some_and(|epoch| epoch.state() == EpochState::Running)
            })
        }
    })
    .await;

    // Seed the successor epoch everywhere; its announcement floods through
    // the genesis control plane.
    for (server, _) in &servers {
        server.epoch_command(EpochCommand::New {
            seed: b"epoch-2".to_vec(),
        });
    }
    client.epoch_command(EpochCommand::New {
        seed: b"epoch-2".to_vec(),
    });

    wait_until(Duration::from_secs(60), "epoch-2 pre-run", {
        let servers: Vec<_> = servers.iter().map(|(s, _)| s.clone()).collect();
        move || {
            servers.iter().all(|server| {
                server
                    .epoch("epoch-2")
                    .is_some_and(|epoch| epoch.state() == EpochState::PreRun)
            })
        }
    })
    .await;

    // Everyone sorted into EMIX under this distribution.
    for (server, _) in &servers {
        let epoch = server.epoch("epoch-2").expect("epoch-2 exists");
        assert_eq!(epoch.role.name(), "EMIX");
    }

    // Advance: epoch-2 runs, genesis enters handoff.
    for (server, _) in &servers {
        server.epoch_command(EpochCommand::Next { epoch: None });
    }
    client.epoch_command(EpochCommand::Next { epoch: None });

    wait_until(Duration::from_secs(60), "epoch-2 running", {
        let servers: Vec<_> = servers.iter().map(|(s, _)| s.clone()).collect();
        move || {
            servers.iter().all(|server| {
                server
                    .epoch("epoch-2")
                    .is_some_and(|epoch| epoch.state() == EpochState::Running)
                    && server
                        .epoch("genesis")
                        .is_some_and(|epoch| epoch.state() == EpochState::Handoff)
            })
        }
    })
    .await;

    wait_until(Duration::from_secs(30), "client epoch switch", {
        let client = client.clone();
        move || client.current_epoch() == "epoch-2"
    })
    .await;

    // Tear the old epoch down; new work rides epoch-2 links only.
    for (server, _) in &servers {
        server.epoch_command(EpochCommand::Next {
            epoch: Some("genesis".into()),
        });
    }
    wait_until(Duration::from_secs(30), "genesis shutdown", {
        let servers: Vec<_> = servers.iter().map(|(s, _)| s.clone()).collect();
        move || {
            servers.iter().all(|server| {
                server
                    .epoch("genesis")
                    .is_some_and(|epoch| epoch.state() == EpochState::Off)
            })
        }
    })
    .await;
}
