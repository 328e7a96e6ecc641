use call_engine::{CallEvent, ErrorKind, ScreenShareOptions};

use crate::integration::{connected_group, init_tracing};
use crate::utils::{wait_until, SignalingHub, TestPeer};

fn sharing(peer: &TestPeer, id: &str) -> bool {
    peer.participant(id).is_some_and(|p| p.is_screen_sharing)
}

#[tokio::test]
async fn test_screen_share_reaches_every_member() {
    init_tracing();

    let hub = SignalingHub::new();
    let host = TestPeer::new(&hub, "host");
    let p1 = TestPeer::new(&hub, "p1");
    let p2 = TestPeer::new(&hub, "p2");
    let p3 = TestPeer::new(&hub, "p3");
    connected_group(&host, &[&p1, &p2, &p3]).await;

    host.engine
        .start_screen_share(ScreenShareOptions::default())
        .await
        .unwrap();
    assert!(sharing(&host, "host"));
    assert!(host.engine.screen_media().is_some());
    assert!(host.events.any(|e| matches!(
        e,
        CallEvent::ScreenShareStarted { participant_id } if participant_id == "host"
    )));

    for member in [&p1, &p2, &p3] {
        let transport = host.transports.latest(&member.id).unwrap();
        wait_until(&format!("renegotiation with {}", member.id), || {
            transport.offers() == 2
        })
        .await;
        assert_eq!(transport.track_count(), 2);

        wait_until(&format!("{} to see the share", member.id), || {
            sharing(member, "host")
        })
        .await;
        assert!(member.events.any(|e| matches!(
            e,
            CallEvent::ScreenShareStarted { participant_id } if participant_id == "host"
        )));
    }
}

#[tokio::test]
async fn test_second_share_is_denied() {
    init_tracing();

    let hub = SignalingHub::new();
    let host = TestPeer::new(&hub, "host");
    let p1 = TestPeer::new(&hub, "p1");
    connected_group(&host, &[&p1]).await;

    host.engine
        .start_screen_share(ScreenShareOptions::default())
        .await
        .unwrap();
    let err = host
        .engine
        .start_screen_share(ScreenShareOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ScreenShareDenied);
    assert!(sharing(&host, "host"));
}

#[tokio::test]
async fn test_denied_permission() {
    init_tracing();

    let hub = SignalingHub::new();
    let host = TestPeer::new(&hub, "host");
    let p1 = TestPeer::new(&hub, "p1");
    connected_group(&host, &[&p1]).await;
    host.media.deny_screen(true);

    let err = host
        .engine
        .start_screen_share(ScreenShareOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ScreenShareDenied);
    assert!(!sharing(&host, "host"));
    assert!(host.engine.screen_media().is_none());
    assert!(host.events.any(|e| matches!(
        e,
        CallEvent::Error { kind: ErrorKind::ScreenShareDenied, .. }
    )));

    // Permission granted on the next try
    host.media.deny_screen(false);
    host.engine
        .start_screen_share(ScreenShareOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_stop_sharing_from_the_os() {
    init_tracing();

    let hub = SignalingHub::new();
    let host = TestPeer::new(&hub, "host");
    let p1 = TestPeer::new(&hub, "p1");
    connected_group(&host, &[&p1]).await;

    host.engine
        .start_screen_share(ScreenShareOptions::default())
        .await
        .unwrap();
    wait_until("p1 to see the share", || sharing(&p1, "host")).await;

    host.media.end_screen_capture();

    wait_until("the share to stop", || !sharing(&host, "host")).await;
    wait_until("p1 to see it stop", || !sharing(&p1, "host")).await;
    assert!(host.engine.screen_media().is_none());
    assert!(host.events.any(|e| matches!(
        e,
        CallEvent::ScreenShareStopped { participant_id } if participant_id == "host"
    )));
    assert!(p1.events.any(|e| matches!(
        e,
        CallEvent::ScreenShareStopped { participant_id } if participant_id == "host"
    )));

    // Stopping again is harmless
    host.engine.stop_screen_share().await.unwrap();
}

#[tokio::test]
async fn test_screen_share_needs_a_call() {
    init_tracing();

    let hub = SignalingHub::new();
    let host = TestPeer::new(&hub, "host");

    let err = host
        .engine
        .start_screen_share(ScreenShareOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotInCall);
    assert!(host.media.sources().is_empty());
}
