mod support;

use std::time::Duration;

use beach_connector::connection::{
    ConnectionError, ConnectionManager, ConnectionPhase, ConnectionTimings,
};
use beach_connector::protocol::ResultItem;
use serde_json::json;
use support::{MockCoordinator, fast_timings, settings};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;

async fn wait_for_phase(manager: &ConnectionManager, phase: ConnectionPhase) {
    let mut phases = manager.subscribe_phase();
    timeout(Duration::from_secs(5), phases.wait_for(|current| *current == phase))
        .await
        .expect("phase not reached")
        .expect("phase channel closed");
}

#[test_timeout::tokio_timeout_test(30)]
async fn silent_coordinator_triggers_reconnect_with_fresh_credential() {
    let coordinator = MockCoordinator::bind().await;
    let timings = ConnectionTimings {
        liveness_window: Duration::from_millis(400),
        ..fast_timings()
    };
    let manager = ConnectionManager::new(settings(&coordinator.url(), timings), &CancellationToken::new());

    let (first, ()) = tokio::join!(coordinator.accept(), manager.start());
    assert!(manager.is_connected().await);

    // The first session stays open at TCP level but never speaks.
    let mut second = coordinator.accept().await;
    assert_eq!(second.credential, first.credential);
    wait_for_phase(&manager, ConnectionPhase::Connected).await;

    manager.send(&ResultItem::success("after-reconnect", "ok")).await.unwrap();
    let delivered = second.next_json().await.unwrap();
    assert_eq!(delivered["id"], "after-reconnect");

    manager.close().await;
    drop(first);
}

#[test_timeout::tokio_timeout_test(30)]
async fn coordinator_close_triggers_reconnect() {
    let coordinator = MockCoordinator::bind().await;
    let manager = ConnectionManager::new(settings(&coordinator.url(), fast_timings()), &CancellationToken::new());

    let (first, ()) = tokio::join!(coordinator.accept(), manager.start());
    let closing = tokio::spawn(first.close());

    let second = coordinator.accept().await;
    assert_eq!(second.authorization.as_deref(), Some("Bearer test-token"));
    wait_for_phase(&manager, ConnectionPhase::Connected).await;
    assert_eq!(manager.backoff_interval().await, Duration::from_millis(50));

    manager.close().await;
    let _ = closing.await;
}

#[test_timeout::tokio_timeout_test(30)]
async fn failed_initial_connect_keeps_retrying_until_coordinator_appears() {
    let placeholder = MockCoordinator::bind().await;
    let addr = placeholder.addr;
    let url = placeholder.url();
    drop(placeholder);

    let manager = ConnectionManager::new(settings(&url, fast_timings()), &CancellationToken::new());
    manager.start().await;
    assert!(!manager.is_connected().await);

    sleep(Duration::from_millis(300)).await;
    let coordinator = MockCoordinator::bind_to(addr).await;
    let peer = coordinator.accept().await;
    assert_eq!(peer.credential["clientType"], "connector");
    wait_for_phase(&manager, ConnectionPhase::Connected).await;
    manager.close().await;
}

#[test_timeout::tokio_timeout_test(30)]
async fn saturated_inbound_queue_drops_newest_items() {
    let coordinator = MockCoordinator::bind().await;
    let timings = ConnectionTimings {
        inbound_capacity: 2,
        ..fast_timings()
    };
    let manager = ConnectionManager::new(settings(&coordinator.url(), timings), &CancellationToken::new());
    let mut inbound = manager.receive().unwrap();

    let (mut peer, ()) = tokio::join!(coordinator.accept(), manager.start());
    for n in 0..5 {
        peer.send_json(json!({"id": format!("w{n}"), "type": "execute", "command": "true"}))
            .await;
    }
    // The pong proves every earlier frame has been through the read loop.
    peer.send_json(json!({"id": "sync", "type": "ping"})).await;
    let pong = peer.next_json().await.unwrap();
    assert_eq!(pong["id"], "sync");

    let mut received = Vec::new();
    while let Ok(item) = inbound.try_recv() {
        received.push(item.id);
    }
    assert_eq!(received, vec!["w0", "w1"]);
    assert!(manager.is_connected().await);
    manager.close().await;
}

#[test_timeout::tokio_timeout_test(30)]
async fn close_sends_normal_close_frame_and_is_final() {
    let coordinator = MockCoordinator::bind().await;
    let manager = ConnectionManager::new(settings(&coordinator.url(), fast_timings()), &CancellationToken::new());
    let (mut peer, ()) = tokio::join!(coordinator.accept(), manager.start());

    manager.close().await;
    match peer.next_message().await {
        Some(Message::Close(Some(frame))) => assert_eq!(frame.code, CloseCode::Normal),
        other => panic!("expected close frame, got {other:?}"),
    }
    assert_eq!(manager.phase().await, ConnectionPhase::Disconnected);
    assert!(matches!(
        manager.send(&ResultItem::success("late", "")).await,
        Err(ConnectionError::NotConnected)
    ));

    // No reconnect after an explicit close.
    let redial = timeout(Duration::from_millis(400), coordinator.accept_raw()).await;
    assert!(redial.is_err());
}

#[test_timeout::tokio_timeout_test(30)]
async fn application_heartbeats_flow_while_idle() {
    let coordinator = MockCoordinator::bind().await;
    let timings = ConnectionTimings {
        heartbeat_interval: Duration::from_millis(100),
        ..fast_timings()
    };
    let manager = ConnectionManager::new(settings(&coordinator.url(), timings), &CancellationToken::new());
    let (mut peer, ()) = tokio::join!(coordinator.accept(), manager.start());

    match peer.next_message().await {
        Some(Message::Text(text)) => {
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert_eq!(value["type"], "ping");
            assert!(!value["id"].as_str().unwrap().is_empty());
        }
        other => panic!("expected heartbeat, got {other:?}"),
    }
    manager.close().await;
}

#[test_timeout::tokio_timeout_test(30)]
async fn idle_writer_sends_transport_keepalive_pings() {
    let coordinator = MockCoordinator::bind().await;
    let timings = ConnectionTimings {
        keepalive_interval: Duration::from_millis(150),
        ..fast_timings()
    };
    let manager = ConnectionManager::new(settings(&coordinator.url(), timings), &CancellationToken::new());
    let (mut peer, ()) = tokio::join!(coordinator.accept(), manager.start());

    let mut pings = 0;
    let window = tokio::time::Instant::now() + Duration::from_secs(1);
    while tokio::time::Instant::now() < window {
        match peer.next_frame(Duration::from_millis(300)).await {
            Some(Message::Ping(_)) => pings += 1,
            Some(Message::Text(text)) => panic!("unexpected application frame {text}"),
            _ => {}
        }
    }
    assert!(pings >= 3, "only {pings} keepalive pings in one second");
    manager.close().await;
}

#[test_timeout::tokio_timeout_test(30)]
async fn transport_pings_alone_keep_the_session_alive() {
    let coordinator = MockCoordinator::bind().await;
    let timings = ConnectionTimings {
        liveness_window: Duration::from_millis(400),
        ..fast_timings()
    };
    let manager = ConnectionManager::new(settings(&coordinator.url(), timings), &CancellationToken::new());
    let (mut peer, ()) = tokio::join!(coordinator.accept(), manager.start());

    for _ in 0..15 {
        peer.send_ping(b"keepalive").await;
        match peer.next_frame(Duration::from_millis(100)).await {
            Some(Message::Pong(payload)) => assert_eq!(payload, b"keepalive".to_vec()),
            Some(Message::Close(frame)) => panic!("session closed: {frame:?}"),
            _ => {}
        }
        sleep(Duration::from_millis(100)).await;
    }

    // 1.5s of ping-only traffic against a 400ms window: same session, no redial.
    assert!(manager.is_connected().await);
    let redial = timeout(Duration::from_millis(200), coordinator.accept_raw()).await;
    assert!(redial.is_err(), "connector redialled");
    manager.send(&ResultItem::success("still-here", "ok")).await.unwrap();
    let delivered = peer.next_json().await.unwrap();
    assert_eq!(delivered["id"], "still-here");
    manager.close().await;
}
