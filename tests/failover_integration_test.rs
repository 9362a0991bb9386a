//! End-to-end tests that drive the real UDP listener against fake upstream
//! resolvers: primary timeout with fallback, CDN-suffix bypass, all-upstreams-fail
//! SERVFAIL synthesis, and learned bypass after repeated primary failures.
//! Nothing internal is mocked — every exchange goes over a real loopback socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dnsward::config::{Config, ResolverEndpoint};
use dnsward::core::Core;
use dnsward::server::run_udp_listener;
use dnsward::wire::Message;
use dnsward::wire::enums::QType;
use dnsward::wire::header::Header;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

fn build_query(id: u16, qname: &str) -> Bytes {
    let header = Header {
        id,
        rd: true,
        qdcount: 1,
        ..Default::default()
    };
    let mut buf = Vec::new();
    header.write(&mut buf).unwrap();
    dnsward::wire::common::write_name(&mut buf, qname).unwrap();
    buf.extend_from_slice(&u16::from(QType::A).to_be_bytes());
    buf.extend_from_slice(&1u16.to_be_bytes());
    Bytes::from(buf)
}

/// A fake upstream that never replies, so every exchange against it times out.
async fn silent_upstream() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 512];
        // Read and drop forever so the port stays open but never answers.
        loop {
            if socket.recv_from(&mut buf).await.is_err() {
                break;
            }
        }
    });
    addr
}

/// A fake upstream that always answers NOERROR.
async fn healthy_upstream() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 512];
        loop {
            let (n, peer) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(_) => break,
            };
            let mut header = Header::parse(&buf[..n]).unwrap();
            header.qr = true;
            header.rcode = 0;
            let mut out = Vec::new();
            header.write(&mut out).unwrap();
            out.extend_from_slice(&buf[12..n]);
            let _ = socket.send_to(&out, peer).await;
        }
    });
    addr
}

/// A fake upstream that always refuses (RCODE=5), forcing fallback.
async fn refusing_upstream() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 512];
        loop {
            let (n, peer) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(_) => break,
            };
            let mut header = Header::parse(&buf[..n]).unwrap();
            header.qr = true;
            header.rcode = 5; // REFUSED
            let mut out = Vec::new();
            header.write(&mut out).unwrap();
            out.extend_from_slice(&buf[12..n]);
            let _ = socket.send_to(&out, peer).await;
        }
    });
    addr
}

async fn ephemeral_listen_port() -> u16 {
    let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    probe.local_addr().unwrap().port()
}

async fn start_proxy(config: Config) -> (SocketAddr, broadcast::Sender<()>) {
    let listen_port = config.dns_port;
    let core = Core::new(config);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(run_udp_listener(Arc::clone(&core), shutdown_rx));
    tokio::time::sleep(Duration::from_millis(50)).await;
    (
        SocketAddr::new("127.0.0.1".parse().unwrap(), listen_port),
        shutdown_tx,
    )
}

async fn ask(listen_addr: SocketAddr, id: u16, qname: &str) -> Message {
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(&build_query(id, qname), listen_addr).await.unwrap();
    let mut buf = vec![0u8; 512];
    let n = tokio::time::timeout(Duration::from_secs(3), client.recv(&mut buf))
        .await
        .expect("response within timeout")
        .unwrap();
    Message::parse(Bytes::copy_from_slice(&buf[..n])).unwrap()
}

/// S2: primary never replies, fallback answers NOERROR quickly. The client
/// must still receive a successful answer with its own transaction ID.
#[tokio::test]
async fn falls_back_when_primary_times_out() {
    let primary_addr = silent_upstream().await;
    let fallback_addr = healthy_upstream().await;
    let port = ephemeral_listen_port().await;

    let config = Config {
        listen_address: "127.0.0.1".to_string(),
        dns_port: port,
        primary: ResolverEndpoint::new(primary_addr.ip().to_string(), primary_addr.port()),
        fallbacks: vec![ResolverEndpoint::new(fallback_addr.ip().to_string(), fallback_addr.port())],
        primary_timeout: Duration::from_millis(100),
        fallback_timeout: Duration::from_secs(1),
        intelligent_caching: false,
        enable_query_deduplication: false,
        ..Default::default()
    };

    let (listen_addr, _shutdown) = start_proxy(config).await;
    let response = ask(listen_addr, 21, "slow.test").await;
    assert_eq!(response.id(), 21);
    assert!(response.is_success());
}

/// S4: a CDN-suffix query bypasses the primary on the very first request and
/// is answered by the fallback directly.
#[tokio::test]
async fn cdn_suffix_bypasses_primary_on_first_query() {
    let primary_addr = silent_upstream().await;
    let fallback_addr = healthy_upstream().await;
    let port = ephemeral_listen_port().await;

    let config = Config {
        listen_address: "127.0.0.1".to_string(),
        dns_port: port,
        primary: ResolverEndpoint::new(primary_addr.ip().to_string(), primary_addr.port()),
        fallbacks: vec![ResolverEndpoint::new(fallback_addr.ip().to_string(), fallback_addr.port())],
        primary_timeout: Duration::from_millis(100),
        fallback_timeout: Duration::from_secs(1),
        intelligent_caching: true,
        enable_query_deduplication: false,
        ..Default::default()
    };

    let (listen_addr, _shutdown) = start_proxy(config).await;
    let started = std::time::Instant::now();
    let response = ask(listen_addr, 22, "d123.cloudfront.net").await;
    assert!(response.is_success());
    // If the primary had been tried first, this would take at least the
    // 100ms primary timeout; bypass should answer far sooner.
    assert!(started.elapsed() < Duration::from_millis(90));
}

/// S6: every configured resolver fails, so the client receives a
/// synthesized SERVFAIL that still carries its transaction ID and question.
#[tokio::test]
async fn synthesizes_servfail_when_all_upstreams_fail() {
    let primary_addr = refusing_upstream().await;
    let fallback_addr = refusing_upstream().await;
    let port = ephemeral_listen_port().await;

    let config = Config {
        listen_address: "127.0.0.1".to_string(),
        dns_port: port,
        primary: ResolverEndpoint::new(primary_addr.ip().to_string(), primary_addr.port()),
        fallbacks: vec![ResolverEndpoint::new(fallback_addr.ip().to_string(), fallback_addr.port())],
        primary_timeout: Duration::from_millis(200),
        fallback_timeout: Duration::from_millis(200),
        intelligent_caching: false,
        enable_query_deduplication: false,
        ..Default::default()
    };

    let (listen_addr, _shutdown) = start_proxy(config).await;
    let response = ask(listen_addr, 23, "dead.test").await;
    assert_eq!(response.id(), 23);
    assert!(response.is_response());
    assert_eq!(response.rcode(), dnsward::wire::enums::ResponseCode::SERVFAIL);
    assert!(!response.is_success());
}

/// S3: three consecutive primary failures against the same name trigger a
/// learned bypass that keeps the next query away from the primary.
#[tokio::test]
async fn repeated_primary_failures_trigger_learned_bypass() {
    let primary_addr = refusing_upstream().await;
    let fallback_addr = healthy_upstream().await;
    let port = ephemeral_listen_port().await;

    let config = Config {
        listen_address: "127.0.0.1".to_string(),
        dns_port: port,
        primary: ResolverEndpoint::new(primary_addr.ip().to_string(), primary_addr.port()),
        fallbacks: vec![ResolverEndpoint::new(fallback_addr.ip().to_string(), fallback_addr.port())],
        primary_timeout: Duration::from_millis(200),
        fallback_timeout: Duration::from_secs(1),
        intelligent_caching: true,
        enable_query_deduplication: false,
        fallback_threshold: 3,
        min_queries_before_bypass: 1,
        ..Default::default()
    };

    let core = Core::new(config.clone());
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(run_udp_listener(Arc::clone(&core), shutdown_rx));
    tokio::time::sleep(Duration::from_millis(50)).await;
    let listen_addr = SocketAddr::new("127.0.0.1".parse().unwrap(), config.dns_port);

    for id in 1..=3u16 {
        let response = ask(listen_addr, id, "flaky.test").await;
        assert!(response.is_success(), "fallback must still answer while bypass is learning");
    }

    assert!(core.bypass.should_bypass("flaky.test"));
    let _ = shutdown_tx;
}

/// S7: many concurrent identical queries must collapse into a single
/// upstream exchange, yet every client still gets back a response carrying
/// its own transaction ID.
#[tokio::test]
async fn concurrent_identical_queries_collapse_to_one_upstream_exchange() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let upstream_hits = Arc::new(AtomicUsize::new(0));
    let hits = Arc::clone(&upstream_hits);
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let primary_addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 512];
        loop {
            let (n, peer) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(_) => break,
            };
            hits.fetch_add(1, Ordering::SeqCst);
            // Simulate a resolver slow enough that concurrent arrivals are
            // still in flight when the next one shows up.
            tokio::time::sleep(Duration::from_millis(40)).await;
            let mut header = Header::parse(&buf[..n]).unwrap();
            header.qr = true;
            header.rcode = 0;
            let mut out = Vec::new();
            header.write(&mut out).unwrap();
            out.extend_from_slice(&buf[12..n]);
            let _ = socket.send_to(&out, peer).await;
        }
    });

    let port = ephemeral_listen_port().await;
    let config = Config {
        listen_address: "127.0.0.1".to_string(),
        dns_port: port,
        primary: ResolverEndpoint::new(primary_addr.ip().to_string(), primary_addr.port()),
        fallbacks: vec![],
        primary_timeout: Duration::from_secs(1),
        intelligent_caching: false,
        enable_query_deduplication: true,
        ..Default::default()
    };
    let (listen_addr, _shutdown) = start_proxy(config).await;

    const CONCURRENT_CLIENTS: u16 = 20;
    let mut tasks = Vec::new();
    for id in 0..CONCURRENT_CLIENTS {
        tasks.push(tokio::spawn(async move { ask(listen_addr, id, "popular.test").await }));
    }

    for (id, task) in tasks.into_iter().enumerate() {
        let response = task.await.unwrap();
        assert_eq!(response.id(), id as u16, "each client must get back its own transaction ID");
        assert!(response.is_success());
    }

    assert_eq!(
        upstream_hits.load(Ordering::SeqCst),
        1,
        "concurrent identical queries must collapse into a single upstream exchange"
    );
}
