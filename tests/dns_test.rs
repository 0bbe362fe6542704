//! DNS Module Tests
//!
//! Covers:
//! - `Name` struct and numeric host detection
//! - `DnsResolverWithOverrides` using a MockResolver
//! - `GaiResolver` (Basic System Resolver)
//! - `HickoryResolver` selected through configuration
//! - Resolution failures surfacing through connect

use coopnet::base::neterror::NetError;
use coopnet::dns::{
    parse_ip_literal, Addrs, DnsResolverWithOverrides, GaiResolver, Name, Resolve, Resolving,
};
use coopnet::stack::sim::{Endpoint, SimStack};
use coopnet::{ConnectMode, ConnectOutcome, ConnectState, Network, NetworkConfig};
use std::cell::Cell;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct MockResolver {
    response: Vec<SocketAddr>,
    calls: AtomicUsize,
}

impl MockResolver {
    fn new(response: Vec<SocketAddr>) -> Self {
        Self { response, calls: AtomicUsize::new(0) }
    }
}

impl Resolve for MockResolver {
    fn resolve(&self, name: Name) -> Resolving {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let addrs = self.response.clone();
        Box::pin(async move {
            if addrs.is_empty() {
                return Err(NetError::dns_failed(
                    name.as_str(),
                    std::io::Error::new(std::io::ErrorKind::NotFound, "no such host"),
                ));
            }
            Ok(Box::new(addrs.into_iter()) as Addrs)
        })
    }
}

#[test]
fn test_name_api() {
    let name = Name::new("example.com");
    assert_eq!(name.as_str(), "example.com");
    assert_eq!(name.to_string(), "example.com");
}

#[test]
fn test_numeric_hosts_detected() {
    assert!(parse_ip_literal("127.0.0.1").is_some());
    assert!(parse_ip_literal("fe80::1").is_some());
    assert!(parse_ip_literal("localhost").is_none());
}

#[tokio::test]
async fn test_dns_overrides() {
    let mock = Arc::new(MockResolver::new(vec![SocketAddr::new(
        IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
        0,
    )]));

    let mut overrides = HashMap::new();
    overrides.insert("local.override".to_string(), vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);

    let resolver = DnsResolverWithOverrides::new(mock.clone(), overrides);
    assert_eq!(resolver.override_count(), 1);

    let addrs: Vec<_> = resolver.resolve(Name::new("local.override")).await.unwrap().collect();
    assert_eq!(addrs.len(), 1);
    assert_eq!(addrs[0].ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    assert_eq!(mock.calls.load(Ordering::SeqCst), 0);

    let addrs: Vec<_> = resolver.resolve(Name::new("other.com")).await.unwrap().collect();
    assert_eq!(addrs.len(), 1);
    assert_eq!(addrs[0].ip(), IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)));
    assert_eq!(mock.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_gai_resolver_localhost() {
    let resolver = GaiResolver::new();
    let result = resolver.resolve(Name::new("localhost")).await;

    // Some sandboxes ship without a hosts file; only check what resolved.
    if let Ok(addrs) = result {
        let list: Vec<_> = addrs.collect();
        assert!(!list.is_empty());
    }
}

#[tokio::test]
async fn test_network_uses_first_address() {
    let first = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)), 0);
    let second = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 8)), 0);
    let net = Network::builder()
        .stack(SimStack::new())
        .resolver(Arc::new(MockResolver::new(vec![first, second])))
        .build();

    assert_eq!(net.resolve("sensor.local").await.unwrap(), first.ip());
}

#[tokio::test]
async fn test_literal_host_never_reaches_resolver() {
    let mock = Arc::new(MockResolver::new(Vec::new()));
    let net = Network::builder().stack(SimStack::new()).resolver(mock.clone()).build();

    assert!(net.resolve("10.0.0.2").await.is_ok());
    assert_eq!(mock.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_resolution_failure_leaves_handle_idle() {
    let sim = SimStack::new();
    let net = Network::builder()
        .stack(sim.clone())
        .resolver(Arc::new(MockResolver::new(Vec::new())))
        .build();
    let client = net.client();

    let result = client.connect("missing.local", 80).await;

    match result {
        Err(NetError::NameNotResolvedFor { domain, .. }) => assert_eq!(domain, "missing.local"),
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(client.connect_state(), ConnectState::Idle);
    assert_eq!(sim.created_connections(), 0);
    assert_eq!(client.last_error().map(|e| e.as_i32()), Some(-105));
}

#[tokio::test]
async fn test_override_routes_connect() {
    let sim = SimStack::new();
    let gateway: IpAddr = "192.168.4.1".parse().unwrap();
    sim.listen(SocketAddr::new(gateway, 80));
    let net = Network::builder()
        .stack(sim.clone())
        .resolver(Arc::new(MockResolver::new(Vec::new())))
        .dns_override("gateway.local", gateway)
        .build();
    let client = net.client();

    let pumped = Cell::new(false);
    let pump = async {
        tokio::task::yield_now().await;
        sim.pump();
        pumped.set(true);
    };
    let (result, _) = tokio::join!(client.connect("gateway.local", 80), pump);

    assert!(pumped.get());
    result.unwrap();
    assert_eq!(client.remote_ip(), gateway);
}

#[tokio::test]
async fn test_configured_hickory_resolver_routes_connect() {
    let sim = SimStack::new();
    sim.set_default_endpoint(Endpoint::Listening);
    let config = NetworkConfig::from_json(r#"{"resolver": "hickory"}"#).unwrap();
    let net = Network::builder().stack(sim.clone()).config(config).build();
    let client = net.client();

    let outcome = client.connect_ex("localhost", 80, ConnectMode::NonBlocking).await;
    assert_eq!(outcome, Ok(ConnectOutcome::Pending));
    sim.pump();

    assert!(client.connected());
    assert!(client.remote_ip().is_loopback());
    assert_eq!(client.remote_port(), 80);
}
