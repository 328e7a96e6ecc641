use call_engine::peer::LinkState;
use call_engine::signaling::SignalType;
use call_engine::{CallEvent, CallState, ConnectionQuality, MediaKind, SessionKind};

use crate::integration::init_tracing;
use crate::utils::{wait_until, SignalingHub, TestPeer};

#[tokio::test]
async fn test_initiate_call_reaches_connected_after_answer() {
    init_tracing();

    let hub = SignalingHub::new();
    let alice = TestPeer::new(&hub, "alice");
    let bob = TestPeer::new(&hub, "bob");

    let session = alice
        .engine
        .initiate_call("bob", MediaKind::Video)
        .await
        .expect("call starts");

    assert_eq!(session.kind, SessionKind::Direct);
    assert_eq!(session.host_id, "alice");
    let ids: Vec<_> = session.participants.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, ["alice", "bob"]);
    assert_eq!(
        session.participants[1].connection_quality,
        ConnectionQuality::Connecting
    );
    assert!(session.participants[0].is_video_enabled);
    assert_eq!(alice.engine.state(), CallState::Active(SessionKind::Direct));
    assert!(alice.events.any(|e| matches!(
        e,
        CallEvent::SessionInitiated(s) if s.id == session.id
    )));

    bob.accept(&session.id).await;
    assert_eq!(bob.engine.state(), CallState::Active(SessionKind::Direct));
    assert!(bob
        .events
        .any(|e| matches!(e, CallEvent::SessionJoined(s) if s.host_id == "alice")));

    wait_until("alice to see bob's answer", || {
        alice.quality_of("bob") == Some(ConnectionQuality::Good)
    })
    .await;
    assert_eq!(alice.engine.link_state("bob"), Some(LinkState::Connected));
    assert!(alice.events.any(|e| matches!(
        e,
        CallEvent::SessionUpdated(s)
            if s.participants.iter().any(|p| p.id == "bob"
                && p.connection_quality == ConnectionQuality::Good)
    )));

    assert_eq!(hub.count("alice", "bob", SignalType::Offer), 1);
    assert_eq!(hub.count("bob", "alice", SignalType::Answer), 1);
}

#[tokio::test]
async fn test_candidates_sent_before_accept_are_applied() {
    init_tracing();

    let hub = SignalingHub::new();
    let alice = TestPeer::new(&hub, "alice");
    let bob = TestPeer::new(&hub, "bob");

    let session = alice
        .engine
        .initiate_call("bob", MediaKind::Audio)
        .await
        .unwrap();

    // Alice's candidate trails her offer and reaches bob before he accepts
    wait_until("alice's candidate to go out", || {
        hub.count("alice", "bob", SignalType::IceCandidate) == 1
    })
    .await;
    bob.accept(&session.id).await;

    let transport = bob.transports.latest("alice").unwrap();
    wait_until("bob to apply the early candidate", || {
        transport.candidates().len() == 1
    })
    .await;
    assert!(transport.candidates()[0].contains("offer-1"));

    // And bob's candidate follows his answer
    wait_until("bob's candidate to go out", || {
        hub.types_between("bob", "alice").len() == 2
    })
    .await;
    assert_eq!(
        hub.types_between("bob", "alice"),
        [SignalType::Answer, SignalType::IceCandidate]
    );
    let alice_side = alice.transports.latest("bob").unwrap();
    wait_until("alice to apply bob's candidate", || {
        alice_side.candidates().len() == 1
    })
    .await;
}
