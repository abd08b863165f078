//! Loopback tests covering listeners, the fetcher and the echo protocol.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use quic_demo::echo::{ClientState, EchoClient, EchoServer, Framing, ServerState};
use quic_demo::error::{ConfigError, EchoError, ProtocolViolation};
use quic_demo::fetch::{BatchPolicy, FetchError, FetchOptions, Fetcher, Target};
use quic_demo::orchestrator::{
    BindSet, ListenerError, ListenerEvent, Orchestrator, Running, TransportMode,
};
use quic_demo::payload;
use quic_demo::router::demo_routes;
use quic_demo::server::Server;
use quic_demo::transport::tls::{self, CertifiedPair, TlsSource, Trust, ECHO_ALPN};
use quic_demo::transport::TransportSettings;

fn certified_pair() -> Arc<CertifiedPair> {
    Arc::new(CertifiedPair::self_signed(&["localhost", "127.0.0.1"]).unwrap())
}

struct Started {
    running: Running,
    quic: SocketAddr,
    tcp: SocketAddr,
}

/// Start a QUIC and a TCP listener on loopback, plus any extra binds.
async fn start_server(pair: Arc<CertifiedPair>, extra: &str) -> (Started, Vec<ListenerEvent>) {
    let list = format!("127.0.0.1:0,tcp://127.0.0.1:0{extra}");
    let binds = BindSet::parse(&list, TransportMode::Quic).unwrap();
    let expected = binds.len();

    let settings = TransportSettings::default();
    let server = Server::new(demo_routes(None).unwrap(), &settings);
    let mut running = Orchestrator::new(binds, server, TlsSource::Pair(pair), settings).start();

    let mut events = Vec::new();
    while events.len() < expected {
        events.push(running.next_event().await.unwrap());
    }

    let ready = |mode| {
        events.iter().find_map(|e| match e {
            ListenerEvent::Ready { bind, local_addr } if bind.mode == mode => Some(*local_addr),
            _ => None,
        })
    };
    let started = Started {
        quic: ready(TransportMode::Quic).unwrap(),
        tcp: ready(TransportMode::Tcp).unwrap(),
        running,
    };
    (started, events)
}

fn fetcher(pair: &CertifiedPair, policy: BatchPolicy) -> Fetcher {
    let trust = Trust::Roots(pair.root_store().unwrap());
    let options = FetchOptions {
        policy,
        ..FetchOptions::default()
    };
    Fetcher::new(&trust, None, options).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_binds_one_unbindable() {
    let taken = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let taken_addr = taken.local_addr().unwrap();
    let pair = certified_pair();

    let (started, events) = start_server(pair.clone(), &format!(",{taken_addr}")).await;

    let failed: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ListenerEvent::Failed { bind, .. } => Some(bind.addr.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(failed, vec![taken_addr.to_string()]);

    // Both surviving listeners serve.
    let fetcher = fetcher(&pair, BatchPolicy::ContinueOnError);
    let targets = vec![
        format!("https://127.0.0.1:{}/16", started.quic.port()),
        format!("tcp://127.0.0.1:{}/16", started.tcp.port()),
    ];
    let results = fetcher
        .fetch_all(targets.iter().map(|t| t.parse().unwrap()).collect())
        .await
        .unwrap();
    for result in &results {
        let body = result.outcome.as_ref().unwrap();
        assert_eq!(body.status, 200);
        assert_eq!(body.body.as_deref(), Some(payload::generate(16).as_slice()));
    }
    fetcher.close().await;

    started.running.shutdown();
    let reports = started.running.join().await;
    assert_eq!(reports.len(), 3);
    assert!(reports[0].result.is_ok());
    assert!(reports[1].result.is_ok());
    assert!(matches!(
        reports[2].result,
        Err(ListenerError::Config(ConfigError::Bind { .. }))
    ));
    drop(taken);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fetch_five_targets() {
    let pair = certified_pair();
    let (started, _) = start_server(pair.clone(), "").await;
    let quic = started.quic.port();
    let tcp = started.tcp.port();

    let targets: Vec<Target> = [
        format!("https://127.0.0.1:{quic}/1024"),
        format!("https://127.0.0.1:{quic}/demo/tile"),
        format!("127.0.0.1:{quic}/demo/tiles"),
        format!("https://127.0.0.1:{quic}/0"),
        format!("tcp://127.0.0.1:{tcp}/demo/upload"),
    ]
    .iter()
    .map(|t| t.parse().unwrap())
    .collect();

    let fetcher = fetcher(&pair, BatchPolicy::ContinueOnError);
    let results = fetcher.fetch_all(targets.clone()).await.unwrap();
    assert_eq!(results.len(), 5);

    for (result, target) in results.iter().zip(&targets) {
        assert_eq!(result.target, target.to_string());
    }
    let statuses: Vec<u16> = results
        .iter()
        .map(|r| r.outcome.as_ref().unwrap().status)
        .collect();
    assert_eq!(statuses, vec![200, 200, 200, 400, 200]);

    let first = results[0].outcome.as_ref().unwrap();
    assert_eq!(first.len, 1024);
    assert_eq!(first.body.as_deref(), Some(payload::generate(1024).as_slice()));
    assert_eq!(results[3].outcome.as_ref().unwrap().len, 0);

    fetcher.close().await;
    started.running.shutdown();
    started.running.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fetch_failure_policies() {
    let pair = certified_pair();
    let (started, _) = start_server(pair.clone(), "").await;

    // Nothing listens on port 1.
    let targets: Vec<Target> = [
        format!("https://127.0.0.1:{}/8", started.quic.port()),
        "tcp://127.0.0.1:1/8".to_string(),
    ]
    .iter()
    .map(|t| t.parse().unwrap())
    .collect();

    let lenient = fetcher(&pair, BatchPolicy::ContinueOnError);
    let results = lenient.fetch_all(targets.clone()).await.unwrap();
    assert_eq!(results.len(), 2);
    assert!(results[0].outcome.is_ok());
    assert!(results[1].outcome.is_err());
    lenient.close().await;

    let strict = fetcher(&pair, BatchPolicy::AbortOnError);
    let err = strict.fetch_all(targets).await.unwrap_err();
    assert!(matches!(err, FetchError::Aborted { ref target, .. } if target == "tcp://127.0.0.1:1/8"));
    strict.close().await;

    started.running.shutdown();
    started.running.join().await;
}

async fn echo_roundtrip(framing: Framing) {
    let pair = CertifiedPair::self_signed(&["localhost"]).unwrap();
    let mut server = EchoServer::bind("127.0.0.1:0".parse().unwrap(), &pair, framing).unwrap();
    let addr = server.local_addr().unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let observed = Arc::clone(&seen);
    let server_task = tokio::spawn(async move {
        let result = server
            .serve_one(|chunk| observed.lock().unwrap().extend_from_slice(chunk))
            .await;
        let state = server.state();
        server.close().await;
        (result, state)
    });

    let config = tls::client_config(&Trust::Roots(pair.root_store().unwrap()), &[], None).unwrap();
    let mut client = EchoClient::new("127.0.0.1:0".parse().unwrap(), config, framing).unwrap();
    let echoed = client.send(addr, "localhost", b"afa papa!").await.unwrap();
    assert_eq!(&echoed[..], b"afa papa!");
    assert_eq!(client.state(), ClientState::Verified);

    let (result, state) = server_task.await.unwrap();
    assert_eq!(result.unwrap(), 9);
    assert_eq!(state, ServerState::Closed);
    assert_eq!(seen.lock().unwrap().as_slice(), b"afa papa!");
    client.close().await;
}

#[tokio::test]
async fn test_echo_raw() {
    echo_roundtrip(Framing::Raw).await;
}

#[tokio::test]
async fn test_echo_framed() {
    echo_roundtrip(Framing::LengthPrefixed).await;
}

#[tokio::test]
async fn test_echo_truncated_by_peer() {
    let pair = CertifiedPair::self_signed(&["localhost"]).unwrap();
    let config = tls::quic_server_config(&pair, &[ECHO_ALPN], std::time::Duration::from_secs(5))
        .unwrap();
    let endpoint = quinn::Endpoint::server(config, "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = endpoint.local_addr().unwrap();

    // A peer that echoes three bytes and then ends the stream.
    let peer = tokio::spawn(async move {
        let connection = endpoint.accept().await.unwrap().await.unwrap();
        let (mut send, mut recv) = connection.accept_bi().await.unwrap();
        let mut buf = [0u8; 9];
        recv.read_exact(&mut buf).await.unwrap();
        send.write_all(&buf[..3]).await.unwrap();
        send.finish().unwrap();
        connection.closed().await;
    });

    let client_tls =
        tls::client_config(&Trust::Roots(pair.root_store().unwrap()), &[], None).unwrap();
    let mut client =
        EchoClient::new("127.0.0.1:0".parse().unwrap(), client_tls, Framing::Raw).unwrap();
    let err = client.send(addr, "localhost", b"afa papa!").await.unwrap_err();
    assert!(matches!(
        err,
        EchoError::Protocol(ProtocolViolation::ShortEcho {
            expected: 9,
            received: 3
        })
    ));
    assert_eq!(client.state(), ClientState::AwaitingExactEcho);

    peer.await.unwrap();
}
