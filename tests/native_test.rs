//! Client handles over real loopback sockets.
//!
//! Every test runs inside a `LocalSet`, which the native stack needs for its
//! per-connection driver tasks.

use coopnet::stack::native::NativeStack;
use coopnet::{ConnectMode, ConnectOutcome, NetError, Network, TcpState};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::LocalSet;

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn local<F: Future>(f: F) -> F::Output {
    LocalSet::new().run_until(f).await
}

#[tokio::test]
async fn test_echo_roundtrip() {
    local(async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let net = Network::new(NativeStack::new());
        let client = net.client();
        client.connect("127.0.0.1", port).await.unwrap();

        assert!(client.connected());
        assert_eq!(client.status(), TcpState::Established);
        assert_eq!(client.remote_port(), port);
        assert_ne!(client.local_port(), 0);

        assert_eq!(client.write(b"hello"), 5);
        client.flush().await;

        eventually(|| client.available() >= 5).await;
        let mut buf = [0u8; 5];
        assert_eq!(client.read(&mut buf), 5);
        assert_eq!(&buf, b"hello");

        server.await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn test_refused_connect_leaves_handle_idle() {
    local(async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let net = Network::new(NativeStack::new());
        let client = net.client();
        let result = client.connect("127.0.0.1", port).await;

        assert_eq!(result, Err(NetError::ConnectionReset));
        assert!(!client.is_open());
        assert!(!client.connected());
    })
    .await;
}

#[tokio::test]
async fn test_nonblocking_connect_completes_in_background() {
    local(async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            sock
        });

        let net = Network::new(NativeStack::new());
        let client = net.client();
        let outcome = client.connect_ex("127.0.0.1", port, ConnectMode::NonBlocking).await;
        assert_eq!(outcome, Ok(ConnectOutcome::Pending));

        eventually(|| client.connected()).await;
        let _sock = server.await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn test_peer_close_drains_before_disconnect() {
    local(async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"bye").await.unwrap();
            sock.shutdown().await.unwrap();
            sock
        });

        let net = Network::new(NativeStack::new());
        let client = net.client();
        client.connect("127.0.0.1", port).await.unwrap();

        eventually(|| client.status() == TcpState::CloseWait).await;
        assert_eq!(client.available(), 3);
        assert!(client.connected());

        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf), 3);
        assert!(!client.connected());
        let _sock = server.await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn test_stop_all_resets_peer() {
    local(async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            // RST surfaces as an error, or as EOF on some platforms.
            match sock.read(&mut buf).await {
                Ok(n) => assert_eq!(n, 0),
                Err(e) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset),
            }
        });

        let net = Network::new(NativeStack::new());
        let client = net.client();
        client.connect("127.0.0.1", port).await.unwrap();

        assert_eq!(net.stop_all(), 1);
        assert!(!client.is_open());

        tokio::time::timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
    })
    .await;
}

#[tokio::test]
async fn test_graceful_close_delivers_pending_data() {
    local(async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            sock.read_to_end(&mut received).await.unwrap();
            received
        });

        let net = Network::new(NativeStack::new());
        let client = net.client();
        client.connect("127.0.0.1", port).await.unwrap();
        assert_eq!(client.write(b"last words"), 10);
        client.stop();

        let received = tokio::time::timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
        assert_eq!(received, b"last words");
    })
    .await;
}
