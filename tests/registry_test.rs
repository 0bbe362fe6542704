//! Handle registry and bulk teardown tests.

use coopnet::stack::sim::{SimStack, Teardown};
use coopnet::{ConnectState, NetError, Network};
use std::net::SocketAddr;

const SERVER: &str = "10.0.0.2";

fn server_addr(port: u16) -> SocketAddr {
    SocketAddr::new(SERVER.parse().unwrap(), port)
}

async fn pump_later(sim: &SimStack) {
    tokio::task::yield_now().await;
    sim.pump();
}

#[test]
fn test_membership_follows_handle_lifetime() {
    let net = Network::new(SimStack::new());
    assert!(net.registry().is_empty());

    let a = net.client();
    let b = net.client();
    let c = b.clone();
    assert_eq!(net.live_handles(), 3);

    drop(b);
    assert_eq!(net.live_handles(), 2);
    drop(a);
    drop(c);
    assert!(net.registry().is_empty());
}

#[test]
fn test_stop_all_on_idle_handles() {
    let net = Network::new(SimStack::new());
    let _a = net.client();
    let _b = net.client();
    assert_eq!(net.stop_all(), 0);
    assert_eq!(net.live_handles(), 2);
}

#[tokio::test]
async fn test_stop_all_covers_every_state() {
    let sim = SimStack::new();
    sim.listen(server_addr(80));
    sim.blackhole(server_addr(81));
    let net = Network::new(sim.clone());

    let idle = net.client();

    let connected = net.client();
    let (result, _) = tokio::join!(connected.connect(SERVER, 80), pump_later(&sim));
    result.unwrap();
    let connected_peer = sim.last_peer().unwrap();
    let sharer = connected.clone();

    let connecting = net.client();
    connecting.start_connect(SERVER.parse().unwrap(), 81).unwrap();
    let connecting_peer = sim.last_peer().unwrap();
    assert_eq!(connecting.connect_state(), ConnectState::Connecting);

    let stopped = net.stop_all();

    assert_eq!(stopped, 3);
    for handle in [&idle, &connected, &sharer, &connecting] {
        assert!(!handle.is_open());
        assert!(!handle.connected());
        assert_eq!(handle.connect_state(), ConnectState::Idle);
    }
    assert_eq!(sim.live_connections(), 0);
    assert_eq!(connected_peer.teardown(), Some(Teardown::Aborted));
    assert_eq!(connected_peer.releases(), 1);
    assert_eq!(connecting_peer.teardown(), Some(Teardown::Aborted));

    // Handles stay registered and usable.
    assert_eq!(net.live_handles(), 4);
    let (result, _) = tokio::join!(connected.connect(SERVER, 80), pump_later(&sim));
    result.unwrap();
    assert!(connected.connected());
}

#[tokio::test]
async fn test_stop_all_aborts_shared_context_held_elsewhere() {
    let sim = SimStack::new();
    sim.listen(server_addr(80));
    let net = Network::new(sim.clone());
    let client = net.client();
    let (result, _) = tokio::join!(client.connect(SERVER, 80), pump_later(&sim));
    result.unwrap();
    let peer = sim.last_peer().unwrap();

    let held = client.context().unwrap();
    assert_eq!(held.ref_count(), 2);

    net.stop_all();

    assert_eq!(held.ref_count(), 1);
    assert!(!held.has_connection());
    assert!(held.is_aborted());
    assert_eq!(held.write(b"late"), 0);

    drop(held);
    assert_eq!(peer.releases(), 1);
}

#[tokio::test]
async fn test_stop_all_resumes_blocked_connect() {
    let sim = SimStack::new();
    sim.blackhole(server_addr(80));
    let net = Network::new(sim.clone());
    let client = net.client();

    let reset = async {
        tokio::task::yield_now().await;
        net.stop_all()
    };
    let (result, stopped) = tokio::join!(client.connect(SERVER, 80), reset);

    assert_eq!(stopped, 1);
    assert_eq!(result, Err(NetError::ConnectionAborted));
    assert_eq!(sim.live_connections(), 0);
}

#[test]
fn test_networks_have_separate_registries() {
    let first = Network::new(SimStack::new());
    let second = Network::new(SimStack::new());
    let _a = first.client();
    let _b = first.client();
    let _c = second.client();

    assert_eq!(first.live_handles(), 2);
    assert_eq!(second.live_handles(), 1);
}
