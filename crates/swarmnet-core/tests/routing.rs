//! End-to-end flow: accept, match, route, then move data both ways under
//! the rate-controlled schedulers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use swarmnet_core::{
    ConfigHandle, Connection, ConnectionListener, NetworkConfig, NetworkManager, PrefixMatcher,
    RawStreamFactory, RoutingData, RoutingListener,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const SIGNATURE: &[u8] = b"SWARM/1 ";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
struct CapturingRouter {
    connections: Mutex<Vec<Arc<Connection>>>,
}

impl RoutingListener for CapturingRouter {
    fn connection_routed(&self, connection: Arc<Connection>, _routing_data: RoutingData) {
        self.connections.lock().unwrap().push(connection);
    }
}

#[derive(Default)]
struct RecordingListener {
    messages: Mutex<Vec<Vec<u8>>>,
}

impl ConnectionListener for RecordingListener {
    fn message_received(&self, message: Vec<u8>) {
        self.messages.lock().unwrap().push(message);
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

fn started_manager(cfg: NetworkConfig) -> Arc<NetworkManager> {
    let manager = NetworkManager::new(ConfigHandle::new(cfg));
    manager.start().expect("manager start");
    manager
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn inbound_connection_is_routed_and_moves_data() {
    init_tracing();
    let manager = started_manager(NetworkConfig {
        listen_port: 0,
        ..NetworkConfig::default()
    });
    let router = Arc::new(CapturingRouter::default());
    manager.request_incoming_connection_routing(
        Arc::new(PrefixMatcher::new(SIGNATURE)),
        Arc::clone(&router) as Arc<dyn RoutingListener>,
        Arc::new(RawStreamFactory),
    );

    let addr = manager.listen_addr().expect("listen address");
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(SIGNATURE).await.unwrap();
    client.write_all(b"hello").await.unwrap();
    client.flush().await.unwrap();

    wait_for("routing", || !router.connections.lock().unwrap().is_empty()).await;
    let conn = Arc::clone(&router.connections.lock().unwrap()[0]);
    assert!(conn.is_lan_local());

    let listener = Arc::new(RecordingListener::default());
    conn.set_listener(Arc::clone(&listener) as Arc<dyn ConnectionListener>);
    manager.start_transfer_processing(&conn);

    // The signature prefix travels with the connection and arrives first.
    wait_for("first message", || {
        !listener.messages.lock().unwrap().is_empty()
    })
    .await;
    {
        let messages = listener.messages.lock().unwrap();
        let mut received = Vec::new();
        for m in messages.iter() {
            received.extend_from_slice(m);
        }
        assert!(received.starts_with(SIGNATURE));
    }

    // Server-to-client under the write scheduler.
    conn.send(b"welcome").unwrap();
    let mut buf = [0u8; 7];
    timeout(Duration::from_secs(5), client.read_exact(&mut buf))
        .await
        .expect("no reply")
        .unwrap();
    assert_eq!(&buf, b"welcome");

    // Client-to-server under the read scheduler.
    client.write_all(b"payload").await.unwrap();
    client.flush().await.unwrap();
    wait_for("payload", || {
        let messages = listener.messages.lock().unwrap();
        let mut received = Vec::new();
        for m in messages.iter() {
            received.extend_from_slice(m);
        }
        received.ends_with(b"payload")
    })
    .await;

    let stats = manager.stats();
    assert_eq!(stats.connections_routed, 1);
    assert!(stats.bytes_sent >= 7);
    assert!(stats.bytes_received >= SIGNATURE.len() as u64);

    manager.stop_transfer_processing(&conn);
    manager.stop_transfer_processing(&conn); // idempotent
    conn.close();
    manager.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unmatched_inbound_connection_is_dropped() {
    init_tracing();
    let manager = started_manager(NetworkConfig {
        listen_port: 0,
        ..NetworkConfig::default()
    });
    let router = Arc::new(CapturingRouter::default());
    manager.request_incoming_connection_routing(
        Arc::new(PrefixMatcher::new(SIGNATURE)),
        Arc::clone(&router) as Arc<dyn RoutingListener>,
        Arc::new(RawStreamFactory),
    );

    let addr = manager.listen_addr().expect("listen address");
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
    client.flush().await.unwrap();

    wait_for("drop", || manager.stats().connections_dropped >= 1).await;
    assert!(router.connections.lock().unwrap().is_empty());

    // The socket is closed on us.
    let mut buf = [0u8; 1];
    let read = timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("peer did not close");
    assert!(matches!(read, Ok(0) | Err(_)));
    manager.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_routing_stops_matching() {
    init_tracing();
    let manager = started_manager(NetworkConfig {
        listen_port: 0,
        ..NetworkConfig::default()
    });
    let router = Arc::new(CapturingRouter::default());
    let matcher: Arc<dyn swarmnet_core::ByteMatcher> = Arc::new(PrefixMatcher::new(SIGNATURE));
    manager.request_incoming_connection_routing(
        Arc::clone(&matcher),
        Arc::clone(&router) as Arc<dyn RoutingListener>,
        Arc::new(RawStreamFactory),
    );
    assert!(manager.cancel_incoming_connection_routing(&matcher));
    assert!(!manager.cancel_incoming_connection_routing(&matcher));

    // With no matchers left, the connection is refused outright.
    let addr = manager.listen_addr().expect("listen address");
    let mut client = TcpStream::connect(addr).await.unwrap();
    let _ = client.write_all(SIGNATURE).await;
    wait_for("drop", || manager.stats().connections_dropped >= 1).await;
    assert!(router.connections.lock().unwrap().is_empty());
    manager.shutdown();
}
