use call_engine::peer::LinkState;
use call_engine::{CallEngineError, CallEvent, CallState, ConnectionQuality, MediaKind, SessionKind};

use crate::integration::init_tracing;
use crate::utils::{wait_until, SignalingHub, TestPeer};

#[tokio::test]
async fn test_one_unreachable_peer_does_not_sink_the_call() {
    init_tracing();

    let hub = SignalingHub::new();
    let host = TestPeer::new(&hub, "host");
    let p1 = TestPeer::new(&hub, "p1");
    let p3 = TestPeer::new(&hub, "p3");
    host.transports.fail_for("p2");

    let session = host
        .engine
        .initiate_group_call(
            vec!["p1".into(), "p2".into(), "p3".into()],
            MediaKind::Audio,
            None,
        )
        .await
        .expect("call survives one failed peer");

    assert_eq!(host.engine.state(), CallState::Active(SessionKind::Group));
    assert_eq!(host.quality_of("p2"), Some(ConnectionQuality::Poor));
    assert_eq!(host.engine.link_state("p2"), None);
    let link_errors = host.events.count(|e| match e {
        CallEvent::Error { kind, .. } => kind.is_link_scoped(),
        _ => false,
    });
    assert_eq!(link_errors, 1);

    p1.accept(&session.id).await;
    p3.accept(&session.id).await;

    for id in ["p1", "p3"] {
        wait_until(&format!("host to connect to {id}"), || {
            host.quality_of(id) == Some(ConnectionQuality::Good)
        })
        .await;
        assert_eq!(host.engine.link_state(id), Some(LinkState::Connected));
    }
    assert_eq!(host.roster(), ["host", "p1", "p2", "p3"]);
    assert_eq!(host.quality_of("p2"), Some(ConnectionQuality::Poor));

    // The survivors complete the mesh between themselves
    wait_until("p1 and p3 to connect", || {
        p1.engine.link_state("p3") == Some(LinkState::Connected)
            && p3.engine.link_state("p1") == Some(LinkState::Connected)
    })
    .await;
}

#[tokio::test]
async fn test_call_fails_when_no_peer_is_reachable() {
    init_tracing();

    let hub = SignalingHub::new();
    let host = TestPeer::new(&hub, "host");
    host.transports.fail_for("p1");
    host.transports.fail_for("p2");

    let err = host
        .engine
        .initiate_group_call(vec!["p1".into(), "p2".into()], MediaKind::Video, None)
        .await
        .unwrap_err();

    assert!(matches!(err, CallEngineError::Transport(_)));
    assert_eq!(host.engine.state(), CallState::Idle);
    assert!(host.media.all_stopped());
    assert!(!host.events.any(|e| matches!(e, CallEvent::SessionInitiated(_))));
    assert!(!host.events.any(|e| matches!(e, CallEvent::SessionEnded { .. })));
}
