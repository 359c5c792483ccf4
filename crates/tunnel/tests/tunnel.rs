// Tunnel lifecycle tests over a scripted in-process secure channel

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use sshfwd_common::{ForwardOptions, ServerOptions, TunnelEvent, TunnelOptions, TunnelState};
use sshfwd_tunnel::{
    create_tunnel_with, ChannelError, ConnectionCloseListener, ForwardError, ForwardStream,
    ListeningEndpoint, SecureChannel, TunnelManager,
};

type OpenArgs = (String, u16, String, u16);

/// Secure channel that relays sub-streams to plain TCP and fails on demand
struct FakeChannel {
    fail_next: Mutex<VecDeque<ChannelError>>,
    always_fail: Option<fn() -> ChannelError>,
    connected: AtomicBool,
    opens: Mutex<Vec<OpenArgs>>,
    ends: AtomicUsize,
    reconnects: AtomicUsize,
}

impl FakeChannel {
    fn new(always_fail: Option<fn() -> ChannelError>) -> Arc<Self> {
        Arc::new(Self {
            fail_next: Mutex::new(VecDeque::new()),
            always_fail,
            connected: AtomicBool::new(true),
            opens: Mutex::new(Vec::new()),
            ends: AtomicUsize::new(0),
            reconnects: AtomicUsize::new(0),
        })
    }

    fn healthy() -> Arc<Self> {
        Self::new(None)
    }

    fn failing(error: fn() -> ChannelError) -> Arc<Self> {
        Self::new(Some(error))
    }

    fn fail_next(&self, error: ChannelError) {
        self.fail_next.lock().unwrap().push_back(error);
    }

    fn opens(&self) -> Vec<OpenArgs> {
        self.opens.lock().unwrap().clone()
    }
}

#[async_trait]
impl SecureChannel for FakeChannel {
    async fn open_forward(
        &self,
        src_addr: &str,
        src_port: u16,
        dst_addr: &str,
        dst_port: u16,
    ) -> Result<Box<dyn ForwardStream>, ChannelError> {
        self.opens.lock().unwrap().push((
            src_addr.to_string(),
            src_port,
            dst_addr.to_string(),
            dst_port,
        ));

        if let Some(error) = self.fail_next.lock().unwrap().pop_front() {
            return Err(error);
        }
        if let Some(error) = self.always_fail {
            return Err(error());
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ChannelError::NotConnected);
        }

        let stream = TcpStream::connect((dst_addr, dst_port))
            .await
            .map_err(|e| ChannelError::Remote(e.to_string()))?;
        Ok(Box::new(stream))
    }

    async fn end(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.ends.fetch_add(1, Ordering::SeqCst);
    }

    async fn reconnect(&self) -> Result<(), ChannelError> {
        self.connected.store(true, Ordering::SeqCst);
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct CountingListener(AtomicUsize);

impl CountingListener {
    fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionCloseListener for CountingListener {
    async fn on_connection_closed(&self, _tunnel: &TunnelManager) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

async fn endpoint() -> Arc<ListeningEndpoint> {
    Arc::new(ListeningEndpoint::bind(&ServerOptions::default()).await.unwrap())
}

fn target(echo: SocketAddr) -> ForwardOptions {
    ForwardOptions {
        dst_addr: echo.ip().to_string(),
        dst_port: echo.port(),
        ..Default::default()
    }
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn round_trip(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_all(payload).await.unwrap();
    let mut echoed = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, payload);
}

#[tokio::test]
async fn test_relay_is_byte_transparent() {
    let echo = echo_server().await;
    let channel = FakeChannel::healthy();
    let tunnel = create_tunnel_with(TunnelOptions::default(), endpoint().await, channel.clone(), target(echo));
    let mut events = tunnel.subscribe();

    let payload: Vec<u8> = (0..=255u8).cycle().take(16 * 1024).collect();
    let mut client = TcpStream::connect(tunnel.endpoint().local_addr()).await.unwrap();
    round_trip(&mut client, &payload).await;
    drop(client);

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let TunnelEvent::ConnectionClosed { bytes_sent, bytes_received, .. } =
                events.recv().await.unwrap()
            {
                return (bytes_sent, bytes_received);
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(closed, (payload.len() as u64, payload.len() as u64));

    assert_eq!(
        channel.opens(),
        vec![("127.0.0.1".to_string(), 0, echo.ip().to_string(), echo.port())]
    );
    assert_eq!(tunnel.reconnect_cycles(), 0);
    tunnel.close().await;
}

#[tokio::test]
async fn test_each_connection_notifies_listeners_once() {
    let echo = echo_server().await;
    let tunnel = create_tunnel_with(
        TunnelOptions::default(),
        endpoint().await,
        FakeChannel::healthy(),
        target(echo),
    );
    let listener = Arc::new(CountingListener::default());
    assert!(tunnel.add_connection_close_listener(listener.clone()));

    for i in 0..3u8 {
        let mut client = TcpStream::connect(tunnel.endpoint().local_addr()).await.unwrap();
        round_trip(&mut client, &[i; 16]).await;
    }

    eventually("three close notifications", || listener.count() == 3).await;
    assert_eq!(tunnel.endpoint().active_connections(), 0);
    assert_eq!(tunnel.state(), TunnelState::Idle);
    tunnel.close().await;
}

#[tokio::test]
async fn test_transient_failure_runs_one_reconnect_cycle() {
    let echo = echo_server().await;
    let channel = FakeChannel::healthy();
    channel.fail_next(ChannelError::NotConnected);

    let options = TunnelOptions {
        auto_reconnect: true,
        reconnect_delay_ms: 50,
        ..Default::default()
    };
    let tunnel = create_tunnel_with(options, endpoint().await, channel.clone(), target(echo));
    let addr = tunnel.endpoint().local_addr();

    let started = Instant::now();
    let mut client = TcpStream::connect(addr).await.unwrap();
    round_trip(&mut client, b"ping").await;
    assert!(started.elapsed() >= Duration::from_millis(50));

    assert_eq!(tunnel.reconnect_cycles(), 1);
    assert_eq!(channel.ends.load(Ordering::SeqCst), 1);
    assert_eq!(channel.reconnects.load(Ordering::SeqCst), 1);

    let opens = channel.opens();
    assert_eq!(opens.len(), 2);
    assert_eq!(opens[0], opens[1]);

    // The endpoint was reopened on the same address
    assert!(tunnel.endpoint().is_open());
    let mut second = TcpStream::connect(addr).await.unwrap();
    round_trip(&mut second, b"pong").await;
    assert!(!tunnel.is_closed());
    tunnel.close().await;
}

#[tokio::test]
async fn test_retry_budget_is_exhausted() {
    let channel = FakeChannel::failing(|| ChannelError::NotConnected);
    let options = TunnelOptions {
        auto_reconnect: true,
        auto_reconnect_count: 2,
        reconnect_delay_ms: 10,
        ..Default::default()
    };
    let endpoint = endpoint().await;
    let tunnel = TunnelManager::new(endpoint.clone(), channel.clone(), options);

    let _client = TcpStream::connect(endpoint.local_addr()).await.unwrap();
    let connection = endpoint.accept().await.unwrap();
    let err = tunnel.forward(connection, &ForwardOptions::default()).await.unwrap_err();

    match err {
        ForwardError::RetriesExhausted { attempts, last } => {
            assert_eq!(attempts, 2);
            assert_eq!(last.to_string(), "Not connected");
        }
        other => panic!("expected exhausted retries, got {:?}", other),
    }
    assert_eq!(tunnel.reconnect_cycles(), 2);
    assert_eq!(channel.ends.load(Ordering::SeqCst), 2);
    assert_eq!(channel.opens().len(), 3);
    assert!(!tunnel.is_connecting());
    assert!(endpoint.is_open());
}

#[tokio::test]
async fn test_close_cancels_pending_reconnect() {
    let channel = FakeChannel::failing(|| ChannelError::NoResponse);
    let options = TunnelOptions {
        auto_reconnect: true,
        reconnect_delay_ms: 10_000,
        ..Default::default()
    };
    let endpoint = endpoint().await;
    let tunnel = TunnelManager::new(endpoint.clone(), channel.clone(), options);

    let _client = TcpStream::connect(endpoint.local_addr()).await.unwrap();
    let connection = endpoint.accept().await.unwrap();
    let forward = {
        let tunnel = tunnel.clone();
        tokio::spawn(async move { tunnel.forward(connection, &ForwardOptions::default()).await })
    };

    eventually("reconnect wait", || tunnel.state() == TunnelState::ReconnectWait).await;
    assert!(tunnel.is_connecting());
    tunnel.close().await;

    let result = tokio::time::timeout(Duration::from_secs(2), forward)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(ForwardError::Cancelled)));
    assert_eq!(channel.reconnects.load(Ordering::SeqCst), 0);
    assert!(!endpoint.is_open());
    assert_eq!(tunnel.state(), TunnelState::Closed);
}

#[tokio::test]
async fn test_non_transient_failure_drops_connection() {
    let echo = echo_server().await;
    let channel = FakeChannel::healthy();
    channel.fail_next(ChannelError::Remote("Connection refused".to_string()));

    let options = TunnelOptions {
        auto_reconnect: true,
        ..Default::default()
    };
    let tunnel = create_tunnel_with(options, endpoint().await, channel.clone(), target(echo));
    let listener = Arc::new(CountingListener::default());
    tunnel.add_connection_close_listener(listener.clone());

    let mut client = TcpStream::connect(tunnel.endpoint().local_addr()).await.unwrap();
    let mut buf = [0u8; 8];
    let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .unwrap();
    // Closed unserved: EOF or reset
    assert!(matches!(read, Ok(0) | Err(_)));

    eventually("close notification", || listener.count() == 1).await;
    assert_eq!(tunnel.reconnect_cycles(), 0);
    assert_eq!(channel.ends.load(Ordering::SeqCst), 0);

    // Later connections are still served
    let mut client = TcpStream::connect(tunnel.endpoint().local_addr()).await.unwrap();
    round_trip(&mut client, b"still up").await;
    tunnel.close().await;
}

#[tokio::test]
async fn test_duplicate_and_removed_listeners() {
    let echo = echo_server().await;
    let tunnel = create_tunnel_with(
        TunnelOptions::default(),
        endpoint().await,
        FakeChannel::healthy(),
        target(echo),
    );

    let counter = Arc::new(CountingListener::default());
    let listener: Arc<dyn ConnectionCloseListener> = counter.clone();
    let witness = Arc::new(CountingListener::default());
    assert!(tunnel.add_connection_close_listener(listener.clone()));
    assert!(!tunnel.add_connection_close_listener(listener.clone()));
    assert!(tunnel.add_connection_close_listener(witness.clone()));

    let mut client = TcpStream::connect(tunnel.endpoint().local_addr()).await.unwrap();
    round_trip(&mut client, b"one").await;
    drop(client);
    eventually("first notification", || witness.count() == 1).await;
    assert_eq!(counter.count(), 1);

    assert!(tunnel.remove_connection_close_listener(&listener));
    assert!(!tunnel.remove_connection_close_listener(&listener));

    let mut client = TcpStream::connect(tunnel.endpoint().local_addr()).await.unwrap();
    round_trip(&mut client, b"two").await;
    drop(client);
    eventually("second notification", || witness.count() == 2).await;
    assert_eq!(counter.count(), 1);
    tunnel.close().await;
}

#[tokio::test]
async fn test_auto_close_after_last_connection() {
    let echo = echo_server().await;
    let options = TunnelOptions {
        auto_close: true,
        ..Default::default()
    };
    let channel = FakeChannel::healthy();
    let tunnel = create_tunnel_with(options, endpoint().await, channel.clone(), target(echo));
    let addr = tunnel.endpoint().local_addr();

    let mut client = TcpStream::connect(addr).await.unwrap();
    round_trip(&mut client, b"bye").await;
    assert!(!tunnel.is_closed());
    drop(client);

    tokio::time::timeout(Duration::from_secs(5), tunnel.closed())
        .await
        .unwrap();
    assert!(!tunnel.endpoint().is_open());
    assert!(channel.ends.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn test_auto_close_waits_for_pending_reconnect() {
    let echo = echo_server().await;
    let channel = FakeChannel::healthy();
    let options = TunnelOptions {
        auto_close: true,
        auto_reconnect: true,
        reconnect_delay_ms: 300,
        ..Default::default()
    };
    let tunnel = create_tunnel_with(options, endpoint().await, channel.clone(), target(echo));
    let addr = tunnel.endpoint().local_addr();

    let mut first = TcpStream::connect(addr).await.unwrap();
    round_trip(&mut first, b"first").await;

    channel.fail_next(ChannelError::NotConnected);
    let mut second = TcpStream::connect(addr).await.unwrap();
    eventually("reconnect cycle", || tunnel.reconnect_pending()).await;

    // The first connection closes while the second is mid-cycle
    drop(first);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!tunnel.is_closed());

    round_trip(&mut second, b"second").await;
    assert_eq!(tunnel.reconnect_cycles(), 1);
    drop(second);

    tokio::time::timeout(Duration::from_secs(5), tunnel.closed())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_close_stops_accepting() {
    let echo = echo_server().await;
    let channel = FakeChannel::healthy();
    let tunnel = create_tunnel_with(TunnelOptions::default(), endpoint().await, channel.clone(), target(echo));
    let addr = tunnel.endpoint().local_addr();
    let mut events = tunnel.subscribe();

    tunnel.close().await;
    tunnel.close().await;

    assert_eq!(tunnel.state(), TunnelState::Closed);
    assert!(matches!(events.recv().await.unwrap(), TunnelEvent::Closed { .. }));
    assert!(events.try_recv().is_err());

    let mut refused = false;
    for _ in 0..100 {
        if TcpStream::connect(addr).await.is_err() {
            refused = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(refused, "endpoint still accepting after close");
}

#[tokio::test]
async fn test_external_endpoint_close_ends_channel() {
    let echo = echo_server().await;
    let channel = FakeChannel::healthy();
    let tunnel = create_tunnel_with(TunnelOptions::default(), endpoint().await, channel.clone(), target(echo));

    tunnel.endpoint().close();

    tokio::time::timeout(Duration::from_secs(5), tunnel.closed())
        .await
        .unwrap();
    assert!(channel.ends.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn test_concurrent_failures_share_one_reconnect_cycle() {
    let echo = echo_server().await;
    let channel = FakeChannel::healthy();
    channel.fail_next(ChannelError::NotConnected);
    channel.fail_next(ChannelError::NotConnected);

    let options = TunnelOptions {
        auto_reconnect: true,
        auto_reconnect_count: 1,
        reconnect_delay_ms: 200,
        ..Default::default()
    };
    let endpoint = endpoint().await;
    let tunnel = TunnelManager::new(endpoint.clone(), channel.clone(), options);

    // Both connections are accepted before either attempt can close the endpoint
    let mut first = TcpStream::connect(endpoint.local_addr()).await.unwrap();
    let first_conn = endpoint.accept().await.unwrap();
    let mut second = TcpStream::connect(endpoint.local_addr()).await.unwrap();
    let second_conn = endpoint.accept().await.unwrap();

    let forwards: Vec<_> = [first_conn, second_conn]
        .into_iter()
        .map(|connection| {
            let tunnel = tunnel.clone();
            let target = target(echo);
            tokio::spawn(async move { tunnel.forward(connection, &target).await })
        })
        .collect();

    round_trip(&mut first, b"first").await;
    round_trip(&mut second, b"second").await;

    assert_eq!(tunnel.reconnect_cycles(), 1);
    assert_eq!(channel.ends.load(Ordering::SeqCst), 1);
    assert_eq!(channel.reconnects.load(Ordering::SeqCst), 1);
    assert_eq!(channel.opens().len(), 4);

    drop(first);
    drop(second);
    for forward in forwards {
        let stats = tokio::time::timeout(Duration::from_secs(5), forward)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(stats.bytes_sent > 0);
    }
    tunnel.close().await;
}
