//! End-to-end relay tests over loopback sockets.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use port_relay_core::{Error, LimitsConfig, Registry, Stats};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

/// Upper bound for anything a test waits on.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn registry() -> Registry {
    Registry::new(LimitsConfig::default(), Arc::new(Stats::default()))
}

fn free_tcp_port() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port().to_string()
}

fn free_udp_port() -> String {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port().to_string()
}

/// TCP echo server. Each connection reports on the channel once its peer hangs up.
async fn spawn_tcp_echo(addr: &str) -> mpsc::UnboundedReceiver<()> {
    let listener = TcpListener::bind(addr).await.unwrap();
    let (closed_tx, closed_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let closed_tx = closed_tx.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                let _ = closed_tx.send(());
            });
        }
    });

    closed_rx
}

/// UDP echo server replying to whoever sent the datagram.
async fn spawn_udp_echo(addr: &str) {
    let socket = UdpSocket::bind(addr).await.unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], peer).await;
        }
    });
}

async fn round_trip(stream: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    stream.read_exact(&mut buf).await.unwrap();
    buf
}

#[tokio::test]
async fn start_then_stop_toggles_running() {
    let registry = registry();
    let port = free_tcp_port();

    registry
        .start_stream("127.0.0.1", &port, "127.0.0.1", "9")
        .await
        .unwrap();
    assert!(registry.is_stream_running("127.0.0.1", &port).await);
    assert!(!registry.is_datagram_running("127.0.0.1", &port).await);

    registry.stop_stream("127.0.0.1", &port).await.unwrap();
    assert!(!registry.is_stream_running("127.0.0.1", &port).await);
    assert_eq!(registry.session_count().await, 0);
}

#[tokio::test]
async fn duplicate_start_is_rejected() {
    let registry = registry();
    let port = free_tcp_port();

    registry
        .start_stream("127.0.0.1", &port, "127.0.0.1", "9")
        .await
        .unwrap();
    let err = registry
        .start_stream("127.0.0.1", &port, "127.0.0.1", "10")
        .await
        .unwrap_err();

    assert!(matches!(err, Error::AlreadyRunning(_)));
    assert_eq!(registry.session_count().await, 1);
    assert_eq!(registry.sessions().await[0].target.port, 9);

    registry.stop_stream("127.0.0.1", &port).await.unwrap();
}

#[tokio::test]
async fn concurrent_duplicate_starts_register_once() {
    let registry = registry();
    let port = free_tcp_port();

    let (a, b) = tokio::join!(
        registry.start_stream("127.0.0.1", &port, "127.0.0.1", "9"),
        registry.start_stream("127.0.0.1", &port, "127.0.0.1", "9"),
    );

    assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
    let err = a.err().or(b.err()).unwrap();
    assert!(matches!(err, Error::AlreadyRunning(_)));
    assert_eq!(registry.session_count().await, 1);

    registry.stop_all().await;
}

#[tokio::test]
async fn stop_without_session() {
    let registry = registry();
    let port = free_tcp_port();
    registry
        .start_datagram("127.0.0.1", &free_udp_port(), "127.0.0.1", "9")
        .await
        .unwrap();

    let err = registry.stop_stream("127.0.0.1", &port).await.unwrap_err();
    assert!(matches!(err, Error::NotRunning(_)));
    assert_eq!(registry.session_count().await, 1);

    registry.stop_all().await;
}

#[tokio::test]
async fn tcp_and_udp_share_a_listen_endpoint() {
    let registry = registry();
    let port = free_tcp_port();

    registry
        .start_stream("127.0.0.1", &port, "127.0.0.1", "9")
        .await
        .unwrap();
    registry
        .start_datagram("127.0.0.1", &port, "127.0.0.1", "9")
        .await
        .unwrap();
    assert_eq!(registry.session_count().await, 2);

    registry.stop_datagram("127.0.0.1", &port).await.unwrap();
    assert!(registry.is_stream_running("127.0.0.1", &port).await);
    assert!(!registry.is_datagram_running("127.0.0.1", &port).await);

    registry.stop_all().await;
}

#[tokio::test]
async fn invalid_ports_are_rejected() {
    let registry = registry();

    for (listen, target) in [("abc", "80"), ("70000", "80"), ("8080", ""), ("8080", "0")] {
        let err = registry
            .start_stream("127.0.0.1", listen, "127.0.0.1", target)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidEndpoint(_)), "{listen} -> {target}");
    }
    assert!(!registry.is_stream_running("127.0.0.1", "abc").await);
    assert_eq!(registry.session_count().await, 0);
}

#[tokio::test]
async fn tcp_echo_through_relay() {
    let mut closed = spawn_tcp_echo("127.0.0.1:19002").await;
    let registry = registry();
    registry
        .start_stream("127.0.0.1", "19001", "127.0.0.1", "19002")
        .await
        .unwrap();

    let mut client = TcpStream::connect("127.0.0.1:19001").await.unwrap();
    let echoed = timeout(TEST_TIMEOUT, round_trip(&mut client, b"ping"))
        .await
        .unwrap();
    assert_eq!(echoed, b"ping");

    drop(client);
    timeout(TEST_TIMEOUT, closed.recv())
        .await
        .expect("target connection stayed open")
        .unwrap();

    registry.stop_stream("127.0.0.1", "19001").await.unwrap();
}

#[tokio::test]
async fn concurrent_clients_get_their_own_bytes() {
    let target_port = free_tcp_port();
    let _closed = spawn_tcp_echo(&format!("127.0.0.1:{}", target_port)).await;
    let listen_port = free_tcp_port();
    let registry = registry();
    registry
        .start_stream("127.0.0.1", &listen_port, "127.0.0.1", &target_port)
        .await
        .unwrap();

    let clients = (0..50).map(|i| {
        let addr = format!("127.0.0.1:{}", listen_port);
        tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let payload = format!("client-{:02}-{}", i, "x".repeat(i * 37));
            let echoed = round_trip(&mut stream, payload.as_bytes()).await;
            assert_eq!(echoed, payload.as_bytes());
        })
    });

    for client in clients.collect::<Vec<_>>() {
        timeout(TEST_TIMEOUT, client).await.unwrap().unwrap();
    }

    let stats = registry.stats().get_aggregated().await;
    assert_eq!(stats.total_connections, 50);

    registry.stop_stream("127.0.0.1", &listen_port).await.unwrap();
}

#[tokio::test]
async fn udp_echo_through_relay() {
    spawn_udp_echo("127.0.0.1:19004").await;
    let registry = registry();
    registry
        .start_datagram("127.0.0.1", "19003", "127.0.0.1", "19004")
        .await
        .unwrap();
    assert!(registry.is_datagram_running("127.0.0.1", "19003").await);

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect("127.0.0.1:19003").await.unwrap();
    client.send(b"hello").await.unwrap();

    let mut buf = [0u8; 64];
    let n = timeout(TEST_TIMEOUT, client.recv(&mut buf))
        .await
        .expect("no reply")
        .unwrap();
    assert_eq!(&buf[..n], b"hello");

    registry.stop_datagram("127.0.0.1", "19003").await.unwrap();
}

#[tokio::test]
async fn udp_replies_reach_the_right_client() {
    let target_port = free_udp_port();
    spawn_udp_echo(&format!("127.0.0.1:{}", target_port)).await;
    let listen_port = free_udp_port();
    let registry = registry();
    registry
        .start_datagram("127.0.0.1", &listen_port, "127.0.0.1", &target_port)
        .await
        .unwrap();

    let relay = format!("127.0.0.1:{}", listen_port);
    let alice = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let bob = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    alice.connect(&relay).await.unwrap();
    bob.connect(&relay).await.unwrap();

    for round in 0..3 {
        alice.send(format!("alice-{}", round).as_bytes()).await.unwrap();
        bob.send(format!("bob-{}", round).as_bytes()).await.unwrap();

        let mut buf = [0u8; 64];
        let n = timeout(TEST_TIMEOUT, alice.recv(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], format!("alice-{}", round).as_bytes());
        let n = timeout(TEST_TIMEOUT, bob.recv(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], format!("bob-{}", round).as_bytes());
    }

    assert_eq!(registry.stats().get_active().await.len(), 2);
    registry.stop_datagram("127.0.0.1", &listen_port).await.unwrap();
}

#[tokio::test]
async fn idle_udp_association_expires() {
    let target_port = free_udp_port();
    spawn_udp_echo(&format!("127.0.0.1:{}", target_port)).await;
    let listen_port = free_udp_port();
    let limits = LimitsConfig {
        udp_idle_timeout: 1,
        ..LimitsConfig::default()
    };
    let registry = Registry::new(limits, Arc::new(Stats::default()));
    registry
        .start_datagram("127.0.0.1", &listen_port, "127.0.0.1", &target_port)
        .await
        .unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(format!("127.0.0.1:{}", listen_port)).await.unwrap();
    client.send(b"once").await.unwrap();
    let mut buf = [0u8; 16];
    timeout(TEST_TIMEOUT, client.recv(&mut buf)).await.unwrap().unwrap();

    let stats = registry.stats();
    timeout(TEST_TIMEOUT, async {
        while !stats.get_active().await.is_empty() {
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("association never expired");

    let history = stats.get_history(None).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].bytes_sent, 4);
    assert_eq!(history[0].bytes_received, 4);

    client.send(b"again").await.unwrap();
    let n = timeout(TEST_TIMEOUT, client.recv(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"again");

    registry.stop_all().await;
}

#[tokio::test]
async fn unreachable_target_only_affects_the_connection() {
    let dead_port = free_tcp_port();
    let listen_port = free_tcp_port();
    let registry = registry();
    registry
        .start_stream("127.0.0.1", &listen_port, "127.0.0.1", &dead_port)
        .await
        .unwrap();

    let mut client = TcpStream::connect(format!("127.0.0.1:{}", listen_port))
        .await
        .unwrap();
    let mut buf = [0u8; 8];
    let n = timeout(TEST_TIMEOUT, client.read(&mut buf))
        .await
        .expect("inbound connection was not closed")
        .unwrap_or(0);
    assert_eq!(n, 0);

    assert!(registry.is_stream_running("127.0.0.1", &listen_port).await);
    assert_eq!(registry.stats().get_aggregated().await.failed_dials, 1);

    registry.stop_stream("127.0.0.1", &listen_port).await.unwrap();
}

#[tokio::test]
async fn stop_during_transfer_leaves_connection_to_drain() {
    let target_port = free_tcp_port();
    let mut closed = spawn_tcp_echo(&format!("127.0.0.1:{}", target_port)).await;
    let listen_port = free_tcp_port();
    let relay = format!("127.0.0.1:{}", listen_port);
    let registry = registry();
    registry
        .start_stream("127.0.0.1", &listen_port, "127.0.0.1", &target_port)
        .await
        .unwrap();

    let mut client = TcpStream::connect(&relay).await.unwrap();
    assert_eq!(round_trip(&mut client, b"before").await, b"before");

    registry.stop_stream("127.0.0.1", &listen_port).await.unwrap();
    assert!(!registry.is_stream_running("127.0.0.1", &listen_port).await);
    assert!(TcpStream::connect(&relay).await.is_err());

    // The accepted connection is not torn down by stop.
    assert_eq!(round_trip(&mut client, b"after").await, b"after");

    drop(client);
    timeout(TEST_TIMEOUT, closed.recv())
        .await
        .expect("connection never terminated")
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stopped_port_can_be_rebound_immediately() {
    let target_port = free_udp_port();
    spawn_udp_echo(&format!("127.0.0.1:{}", target_port)).await;
    let registry = registry();
    let tcp_port = free_tcp_port();
    let udp_port = free_udp_port();

    for _ in 0..20 {
        registry
            .start_stream("127.0.0.1", &tcp_port, "127.0.0.1", "9")
            .await
            .unwrap();
        registry
            .start_datagram("127.0.0.1", &udp_port, "127.0.0.1", &target_port)
            .await
            .unwrap();

        // A live association holds the listening socket too.
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(format!("127.0.0.1:{}", udp_port)).await.unwrap();
        client.send(b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        timeout(TEST_TIMEOUT, client.recv(&mut buf)).await.unwrap().unwrap();

        registry.stop_stream("127.0.0.1", &tcp_port).await.unwrap();
        registry.stop_datagram("127.0.0.1", &udp_port).await.unwrap();
    }

    registry
        .start_stream("127.0.0.1", &tcp_port, "127.0.0.1", "9")
        .await
        .unwrap();
    registry
        .start_datagram("127.0.0.1", &udp_port, "127.0.0.1", &target_port)
        .await
        .unwrap();
    assert_eq!(registry.stop_all().await, 2);

    TcpListener::bind(format!("127.0.0.1:{}", tcp_port)).await.unwrap();
    UdpSocket::bind(format!("127.0.0.1:{}", udp_port)).await.unwrap();
}

#[tokio::test]
async fn restart_with_new_target() {
    let old_port = free_tcp_port();
    let new_port = free_tcp_port();
    let _old_closed = spawn_tcp_echo(&format!("127.0.0.1:{}", old_port)).await;
    let new_target = TcpListener::bind(format!("127.0.0.1:{}", new_port)).await.unwrap();
    let listen_port = free_tcp_port();
    let relay = format!("127.0.0.1:{}", listen_port);
    let registry = registry();

    registry
        .start_stream("127.0.0.1", &listen_port, "127.0.0.1", &old_port)
        .await
        .unwrap();
    let mut client = TcpStream::connect(&relay).await.unwrap();
    assert_eq!(round_trip(&mut client, b"old").await, b"old");
    drop(client);

    registry.stop_stream("127.0.0.1", &listen_port).await.unwrap();
    let info = registry
        .start_stream("127.0.0.1", &listen_port, "127.0.0.1", &new_port)
        .await
        .unwrap();
    assert_eq!(info.target.port.to_string(), new_port);

    let mut client = TcpStream::connect(&relay).await.unwrap();
    client.write_all(b"new").await.unwrap();
    let (mut accepted, _) = timeout(TEST_TIMEOUT, new_target.accept())
        .await
        .expect("new target never saw a connection")
        .unwrap();
    let mut buf = [0u8; 3];
    timeout(TEST_TIMEOUT, accepted.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"new");

    registry.stop_all().await;
}

#[tokio::test]
async fn active_client_keeps_its_association() {
    // Receives but never answers.
    let target = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target_port = target.local_addr().unwrap().port().to_string();
    let listen_port = free_udp_port();
    let limits = LimitsConfig {
        udp_idle_timeout: 1,
        ..LimitsConfig::default()
    };
    let registry = Registry::new(limits, Arc::new(Stats::default()));
    registry
        .start_datagram("127.0.0.1", &listen_port, "127.0.0.1", &target_port)
        .await
        .unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(format!("127.0.0.1:{}", listen_port)).await.unwrap();

    let mut sources = HashSet::new();
    let mut buf = [0u8; 16];
    for _ in 0..10 {
        client.send(b"tick").await.unwrap();
        let (_, source) = timeout(TEST_TIMEOUT, target.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        sources.insert(source);
        sleep(Duration::from_millis(300)).await;
    }

    assert_eq!(sources.len(), 1);
    assert_eq!(registry.stats().get_aggregated().await.total_connections, 1);

    registry.stop_all().await;
}
