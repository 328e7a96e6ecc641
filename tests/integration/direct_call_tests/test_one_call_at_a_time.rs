use call_engine::signaling::SignalType;
use call_engine::{CallEngineError, CallEvent, CallState, ErrorKind, MediaError, MediaKind};

use crate::integration::init_tracing;
use crate::utils::{SignalingHub, TestPeer};

#[tokio::test]
async fn test_second_call_is_refused_while_active() {
    init_tracing();

    let hub = SignalingHub::new();
    let alice = TestPeer::new(&hub, "alice");

    let first = alice
        .engine
        .initiate_call("bob", MediaKind::Audio)
        .await
        .unwrap();
    let err = alice
        .engine
        .initiate_call("carol", MediaKind::Audio)
        .await
        .unwrap_err();

    assert_eq!(err, CallEngineError::AlreadyInCall);
    assert_eq!(alice.engine.session().map(|s| s.id), Some(first.id));
    assert_eq!(alice.roster(), ["alice", "bob"]);
    assert!(alice.events.any(|e| matches!(
        e,
        CallEvent::Error { kind: ErrorKind::AlreadyInCall, .. }
    )));
    assert_eq!(hub.count("alice", "carol", SignalType::Offer), 0);
}

#[tokio::test]
async fn test_concurrent_initiations_yield_one_session() {
    init_tracing();

    let hub = SignalingHub::new();
    let alice = TestPeer::new(&hub, "alice");

    let first = {
        let engine = alice.engine.clone();
        tokio::spawn(async move { engine.initiate_call("bob", MediaKind::Audio).await })
    };
    let second = {
        let engine = alice.engine.clone();
        tokio::spawn(async move { engine.initiate_call("carol", MediaKind::Audio).await })
    };

    let results = [first.await.unwrap(), second.await.unwrap()];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| r.as_ref().err() == Some(&CallEngineError::AlreadyInCall)));
    assert_eq!(alice.engine.link_count(), 1);
}

#[tokio::test]
async fn test_invalid_targets_are_rejected() {
    init_tracing();

    let hub = SignalingHub::new();
    let alice = TestPeer::new(&hub, "alice");

    let err = alice
        .engine
        .initiate_call("alice", MediaKind::Audio)
        .await
        .unwrap_err();
    assert!(matches!(err, CallEngineError::InvalidArgument(_)));

    let err = alice
        .engine
        .initiate_group_call(Vec::new(), MediaKind::Audio, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CallEngineError::InvalidArgument(_)));

    let err = alice
        .engine
        .initiate_group_call(vec!["bob".into(), "bob".into()], MediaKind::Audio, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CallEngineError::InvalidArgument(_)));

    assert_eq!(alice.engine.state(), CallState::Idle);
    assert!(alice.media.sources().is_empty());
}

#[tokio::test]
async fn test_media_failure_leaves_engine_idle() {
    init_tracing();

    let hub = SignalingHub::new();
    let alice = TestPeer::new(&hub, "alice");
    alice.media.deny_user_media(true);

    let err = alice
        .engine
        .initiate_group_call(vec!["bob".into(), "carol".into()], MediaKind::Video, None)
        .await
        .unwrap_err();

    assert_eq!(
        err,
        CallEngineError::MediaAcquisitionFailed(MediaError::PermissionDenied(
            "microphone".into()
        ))
    );
    assert_eq!(alice.engine.state(), CallState::Idle);
    assert!(alice.engine.session().is_none());
    assert_eq!(alice.engine.link_count(), 0);
    assert_eq!(alice.transports.created_for("bob"), 0);
    assert!(hub.sent_between("alice", "bob").is_empty());
    assert!(alice.events.any(|e| matches!(
        e,
        CallEvent::Error { kind: ErrorKind::MediaAcquisitionFailed, .. }
    )));
    assert!(!alice.events.any(|e| matches!(e, CallEvent::SessionInitiated(_))));

    // The engine is usable again once the device is back
    alice.media.deny_user_media(false);
    alice
        .engine
        .initiate_call("bob", MediaKind::Audio)
        .await
        .expect("retry succeeds");
}

#[tokio::test]
async fn test_call_operations_need_a_call() {
    init_tracing();

    let hub = SignalingHub::new();
    let alice = TestPeer::new(&hub, "alice");

    assert_eq!(
        alice.engine.toggle_audio().unwrap_err(),
        CallEngineError::NotInCall
    );
    assert_eq!(
        alice.engine.add_participant("bob").await.unwrap_err(),
        CallEngineError::NotInCall
    );
    assert_eq!(
        alice.engine.remove_participant("bob").await.unwrap_err(),
        CallEngineError::NotInCall
    );
    assert_eq!(
        alice.engine.start_recording().unwrap_err(),
        CallEngineError::NotInCall
    );
    assert_eq!(
        alice
            .engine
            .start_screen_share(Default::default())
            .await
            .unwrap_err(),
        CallEngineError::NotInCall
    );
    alice.engine.end_call().await.expect("ending nothing is fine");
}
