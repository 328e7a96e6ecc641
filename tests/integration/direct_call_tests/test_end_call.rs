use call_engine::signaling::{OfferPayload, SignalMessage, SignalType, SignalingEnvelope};
use call_engine::{CallEngineError, CallEvent, CallState, MediaKind, SessionKind};

use crate::integration::init_tracing;
use crate::utils::{settle, wait_until, SignalingHub, TestPeer};

fn ended(events: &[CallEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, CallEvent::SessionEnded { .. }))
        .count()
}

#[tokio::test]
async fn test_end_call_twice_is_harmless() {
    init_tracing();

    let hub = SignalingHub::new();
    let alice = TestPeer::new(&hub, "alice");
    let bob = TestPeer::new(&hub, "bob");

    let session = alice
        .engine
        .initiate_call("bob", MediaKind::Video)
        .await
        .unwrap();
    bob.accept(&session.id).await;

    alice.engine.end_call().await.expect("first end");
    alice.engine.end_call().await.expect("second end");

    assert_eq!(alice.engine.state(), CallState::Idle);
    assert!(alice.engine.session().is_none());
    assert_eq!(alice.engine.link_count(), 0);
    assert_eq!(alice.transports.open_count(), 0);
    assert!(alice.engine.local_media().is_none());
    assert!(alice.media.all_stopped());
    assert_eq!(ended(&alice.events.all()), 1);
    assert_eq!(hub.count("alice", "bob", SignalType::Leave), 1);

    // Bob's side of a direct call ends with it
    wait_until("bob to hang up", || bob.engine.state() == CallState::Idle).await;
    assert_eq!(ended(&bob.events.all()), 1);
    assert!(bob.media.all_stopped());
    assert_eq!(bob.transports.open_count(), 0);
}

#[tokio::test]
async fn test_end_call_while_acquiring_media_releases_it() {
    init_tracing();

    let hub = SignalingHub::new();
    let alice = TestPeer::new(&hub, "alice");
    let release_media = alice.media.hold_user_media();

    let engine = alice.engine.clone();
    let call = tokio::spawn(async move { engine.initiate_call("bob", MediaKind::Video).await });

    wait_until("alice to start initiating", || {
        alice.engine.state() == CallState::Initiating
    })
    .await;
    alice.engine.end_call().await.unwrap();
    assert_eq!(alice.engine.state(), CallState::Idle);

    // The capture finishes after the call is gone and must not leak
    release_media.notify_one();
    let result = call.await.unwrap();
    assert_eq!(result.unwrap_err(), CallEngineError::Cancelled);

    assert_eq!(alice.engine.state(), CallState::Idle);
    assert_eq!(alice.media.sources().len(), 2);
    assert!(alice.media.all_stopped());
    assert!(alice.engine.local_media().is_none());
    assert_eq!(alice.engine.link_count(), 0);
    assert_eq!(hub.count("alice", "bob", SignalType::Offer), 0);
}

#[tokio::test]
async fn test_end_call_before_answer_releases_media() {
    init_tracing();

    let hub = SignalingHub::new();
    let alice = TestPeer::new(&hub, "alice");
    let bob = TestPeer::new(&hub, "bob");

    let session = alice
        .engine
        .initiate_call("bob", MediaKind::Audio)
        .await
        .unwrap();
    wait_until("bob to be invited", || !bob.engine.incoming_calls().is_empty()).await;

    alice.engine.end_call().await.unwrap();

    assert_eq!(alice.engine.state(), CallState::Idle);
    assert!(alice.media.all_stopped());
    assert_eq!(alice.transports.open_count(), 0);

    // The invitation is withdrawn on bob's side
    wait_until("bob's invitation to be withdrawn", || {
        bob.engine.incoming_calls().is_empty()
    })
    .await;
    assert!(bob.events.any(|e| matches!(
        e,
        CallEvent::IncomingCallCancelled { session_id, from }
            if *session_id == session.id && from == "alice"
    )));
    assert_eq!(bob.engine.state(), CallState::Idle);
}

#[tokio::test]
async fn test_remote_leave_ends_direct_call() {
    init_tracing();

    let hub = SignalingHub::new();
    let alice = TestPeer::new(&hub, "alice");
    let bob = TestPeer::new(&hub, "bob");

    let session = alice
        .engine
        .initiate_call("bob", MediaKind::Audio)
        .await
        .unwrap();
    bob.accept(&session.id).await;

    bob.engine.end_call().await.unwrap();

    wait_until("alice to notice bob left", || {
        alice.engine.state() == CallState::Idle
    })
    .await;
    assert!(alice.events.any(|e| matches!(
        e,
        CallEvent::SessionEnded { session_id } if *session_id == session.id
    )));
    assert!(alice.media.all_stopped());
    // Alice was told, so she does not say goodbye back
    assert_eq!(hub.count("alice", "bob", SignalType::Leave), 0);
}

#[tokio::test]
async fn test_dispose_ends_call_and_stops_listening() {
    init_tracing();

    let hub = SignalingHub::new();
    let alice = TestPeer::new(&hub, "alice");
    let bob = TestPeer::new(&hub, "bob");

    let session = alice
        .engine
        .initiate_call("bob", MediaKind::Audio)
        .await
        .unwrap();
    bob.accept(&session.id).await;

    alice.engine.dispose().await;

    assert_eq!(alice.engine.state(), CallState::Idle);
    assert_eq!(ended(&alice.events.all()), 1);
    assert!(alice.media.all_stopped());
    assert_eq!(alice.transports.open_count(), 0);
    wait_until("bob to hang up", || bob.engine.state() == CallState::Idle).await;

    // Nothing routes inbound signaling any more
    hub.inject(SignalingEnvelope::new(
        "bob",
        "alice",
        "after-dispose",
        SignalMessage::Offer(OfferPayload {
            sdp: "v=0 offer".into(),
            session_kind: SessionKind::Direct,
            media_kind: MediaKind::Audio,
            participants: vec!["bob".into(), "alice".into()],
            context: None,
        }),
    ));
    settle().await;
    assert!(alice.engine.incoming_calls().is_empty());
    assert!(!alice
        .events
        .any(|e| matches!(e, CallEvent::IncomingCall { .. })));
}
