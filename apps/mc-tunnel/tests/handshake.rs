use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};

use mc_tunnel::observer::{ChannelObserver, NoopObserver, ObserverEvent};
use mc_tunnel::signal::{self, SdpKind, SessionDescription};
use mc_tunnel::{ConnectionEstablisher, SessionPhase, TunnelConfig, TunnelError};

fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

fn config() -> TunnelConfig {
    TunnelConfig::localhost().with_path_discovery_timeout(Duration::from_secs(15))
}

fn establisher() -> ConnectionEstablisher {
    ConnectionEstablisher::new(config(), Arc::new(NoopObserver)).expect("build webrtc api")
}

#[test_timeout::tokio_timeout_test(30)]
async fn create_offer_returns_an_offer_token() {
    init_tracing();
    let host = establisher();
    assert_eq!(host.phase(), SessionPhase::Idle);

    let token = host.create_offer().await.expect("create offer");

    let raw = STANDARD.decode(token.as_str()).expect("token is base64");
    let json: Value = serde_json::from_slice(&raw).expect("token is json");
    assert_eq!(json["type"], "offer");
    assert!(json["sdp"].as_str().is_some_and(|sdp| !sdp.is_empty()));

    let desc = signal::decode(token.as_str()).unwrap();
    assert_eq!(desc.kind, SdpKind::Offer);
    assert!(desc.sdp.contains("m=application"));

    assert_eq!(host.phase(), SessionPhase::AwaitingPathDiscovery);
    assert_eq!(host.open_resources(), 1);
    host.shutdown().await;
    assert_eq!(host.open_resources(), 0);
    assert_eq!(host.phase(), SessionPhase::Closed);
}

#[test_timeout::tokio_timeout_test(45)]
async fn offer_answer_exchange_succeeds() {
    init_tracing();
    let host = establisher();
    let joiner = establisher();

    let offer = host.create_offer().await.expect("create offer");
    let answer = joiner.accept_offer(offer.as_str()).await.expect("accept offer");
    let desc = signal::decode(answer.as_str()).unwrap();
    assert_eq!(desc.kind, SdpKind::Answer);
    assert!(!desc.sdp.is_empty());
    assert_eq!(joiner.phase(), SessionPhase::AwaitingPathDiscovery);

    host.accept_answer(answer.as_str())
        .await
        .expect("accept answer");

    // An answer is single use.
    assert!(matches!(
        host.accept_answer(answer.as_str()).await,
        Err(TunnelError::SignalingRejected(_))
    ));

    host.shutdown().await;
    joiner.shutdown().await;
    assert_eq!(host.open_resources(), 0);
    assert_eq!(joiner.open_resources(), 0);
}

#[test_timeout::tokio_timeout_test(30)]
async fn malformed_tokens_allocate_nothing() {
    init_tracing();
    let host = establisher();
    host.create_offer().await.expect("create offer");
    let joiner = establisher();

    let not_json = STANDARD.encode("definitely not json");
    let missing_sdp = STANDARD.encode(r#"{"type":"offer"}"#);
    let bad_tokens = ["", "%%% not base64 %%%", not_json.as_str(), missing_sdp.as_str()];

    for bad in bad_tokens {
        let joiner_before = joiner.open_resources();
        assert!(
            matches!(joiner.accept_offer(bad).await, Err(TunnelError::TokenFormat(_))),
            "accept_offer({bad:?})"
        );
        assert_eq!(joiner.open_resources(), joiner_before);
        assert_eq!(joiner.phase(), SessionPhase::Idle);

        let host_before = host.open_resources();
        assert!(
            matches!(host.accept_answer(bad).await, Err(TunnelError::TokenFormat(_))),
            "accept_answer({bad:?})"
        );
        assert_eq!(host.open_resources(), host_before);
        assert_eq!(host.phase(), SessionPhase::AwaitingPathDiscovery);
    }
    host.shutdown().await;
}

#[test_timeout::tokio_timeout_test(30)]
async fn wrong_token_kind_is_rejected_before_allocation() {
    let joiner = establisher();
    let answer_token = signal::encode(&SessionDescription::answer("v=0\r\n")).unwrap();
    assert!(matches!(
        joiner.accept_offer(answer_token.as_str()).await,
        Err(TunnelError::SignalingRejected(_))
    ));
    assert_eq!(joiner.open_resources(), 0);

    let host = establisher();
    let offer = host.create_offer().await.unwrap();
    assert!(matches!(
        host.accept_answer(offer.as_str()).await,
        Err(TunnelError::SignalingRejected(_))
    ));
    host.shutdown().await;
}

#[test_timeout::tokio_timeout_test(45)]
async fn answer_without_pending_offer_is_rejected() {
    let host = establisher();
    let joiner = establisher();
    let offer = host.create_offer().await.unwrap();
    let answer = joiner.accept_offer(offer.as_str()).await.unwrap();

    let stranger = establisher();
    assert!(matches!(
        stranger.accept_answer(answer.as_str()).await,
        Err(TunnelError::SignalingRejected(_))
    ));
    assert_eq!(stranger.open_resources(), 0);

    host.shutdown().await;
    joiner.shutdown().await;
}

#[test_timeout::tokio_timeout_test(60)]
async fn repeated_offers_do_not_leak_peer_connections() {
    init_tracing();
    let host = establisher();
    for _ in 0..5 {
        host.create_offer().await.expect("create offer");
        assert_eq!(host.open_resources(), 1);
        host.shutdown().await;
    }
    assert_eq!(host.open_resources(), 0);

    // A new offer replaces the session in progress.
    for _ in 0..3 {
        host.create_offer().await.expect("create offer");
    }
    assert_eq!(host.open_resources(), 1);
    host.shutdown().await;
    host.shutdown().await;
    assert_eq!(host.open_resources(), 0);
}

#[test_timeout::tokio_timeout_test(20)]
async fn path_discovery_timeout_releases_the_peer_connection() {
    init_tracing();
    let (observer, mut events) = ChannelObserver::new();
    let host = ConnectionEstablisher::new(
        TunnelConfig::localhost().with_path_discovery_timeout(Duration::ZERO),
        Arc::new(observer),
    )
    .unwrap();
    let mut phases = host.subscribe_phase();

    match host.create_offer().await {
        Err(TunnelError::PathDiscoveryTimeout { timeout }) => assert_eq!(timeout, Duration::ZERO),
        other => panic!("expected path discovery timeout, got {other:?}"),
    }
    assert_eq!(host.open_resources(), 0);
    assert_eq!(*phases.borrow_and_update(), SessionPhase::Failed);

    let event = events.recv().await.expect("failure is reported");
    assert!(matches!(event, ObserverEvent::Log(message) if message.starts_with("Handshake failed")));

    host.shutdown().await;
    assert_eq!(host.phase(), SessionPhase::Closed);
}

#[test_timeout::tokio_timeout_test(30)]
async fn wait_ready_gives_up_without_a_peer() {
    let host = establisher();
    host.create_offer().await.unwrap();
    assert!(host.wait_ready(Duration::from_millis(200)).await.is_none());
    assert!(host.tunnel().is_none());
    assert!(host.proxy_local_addr().is_none());
    host.shutdown().await;
}

#[test_timeout::tokio_timeout_test(20)]
async fn phase_reads_awaiting_path_discovery_during_the_wait() {
    init_tracing();
    // A STUN server that never answers keeps srflx gathering open.
    let silent_stun = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let stun_url = format!("stun:{}", silent_stun.local_addr().unwrap());
    let host = ConnectionEstablisher::new(
        TunnelConfig::localhost()
            .with_ice_servers(vec![stun_url])
            .with_path_discovery_timeout(Duration::from_millis(1500)),
        Arc::new(NoopObserver),
    )
    .unwrap();
    let mut phases = host.subscribe_phase();

    let offering = {
        let host = host.clone();
        tokio::spawn(async move { host.create_offer().await })
    };
    tokio::time::timeout(
        Duration::from_secs(1),
        phases.wait_for(|phase| *phase == SessionPhase::AwaitingPathDiscovery),
    )
    .await
    .expect("phase moves to AwaitingPathDiscovery before the deadline")
    .unwrap();
    assert!(!offering.is_finished());
    assert_eq!(host.open_resources(), 1);

    match offering.await.unwrap() {
        Err(TunnelError::PathDiscoveryTimeout { .. }) => {}
        other => panic!("expected path discovery timeout, got {other:?}"),
    }
    assert_eq!(host.phase(), SessionPhase::Failed);
    assert_eq!(host.open_resources(), 0);
    drop(silent_stun);
}

#[test_timeout::tokio_timeout_test(30)]
async fn accept_offer_timeout_releases_the_peer_connection() {
    init_tracing();
    let host = establisher();
    let offer = host.create_offer().await.expect("create offer");

    let (observer, mut events) = ChannelObserver::new();
    let joiner = ConnectionEstablisher::new(
        TunnelConfig::localhost().with_path_discovery_timeout(Duration::ZERO),
        Arc::new(observer),
    )
    .unwrap();

    match joiner.accept_offer(offer.as_str()).await {
        Err(TunnelError::PathDiscoveryTimeout { timeout }) => assert_eq!(timeout, Duration::ZERO),
        other => panic!("expected path discovery timeout, got {other:?}"),
    }
    assert_eq!(joiner.open_resources(), 0);
    assert_eq!(joiner.phase(), SessionPhase::Failed);
    let event = events.recv().await.expect("failure is reported");
    assert!(matches!(event, ObserverEvent::Log(message) if message.starts_with("Handshake failed")));

    host.shutdown().await;
    joiner.shutdown().await;
}
