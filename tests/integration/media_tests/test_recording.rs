use call_engine::{CallEvent, ErrorKind, MediaKind};

use crate::integration::init_tracing;
use crate::utils::{SignalingHub, TestPeer};

#[tokio::test]
async fn test_recording_flag() {
    init_tracing();

    let hub = SignalingHub::new();
    let alice = TestPeer::new(&hub, "alice");
    let _bob = TestPeer::new(&hub, "bob");
    let session = alice
        .engine
        .initiate_call("bob", MediaKind::Audio)
        .await
        .unwrap();

    alice.engine.start_recording().unwrap();
    alice.engine.start_recording().unwrap();
    assert!(alice.engine.session().is_some_and(|s| s.is_recording));
    assert_eq!(
        alice
            .events
            .count(|e| matches!(e, CallEvent::RecordingStarted { session_id } if *session_id == session.id)),
        1
    );

    alice.engine.stop_recording().unwrap();
    alice.engine.stop_recording().unwrap();
    assert!(alice.engine.session().is_some_and(|s| !s.is_recording));
    assert_eq!(
        alice
            .events
            .count(|e| matches!(e, CallEvent::RecordingStopped { .. })),
        1
    );
}

#[tokio::test]
async fn test_recording_needs_a_call() {
    init_tracing();

    let hub = SignalingHub::new();
    let alice = TestPeer::new(&hub, "alice");

    assert_eq!(
        alice.engine.start_recording().unwrap_err().kind(),
        ErrorKind::NotInCall
    );
    assert_eq!(
        alice.engine.stop_recording().unwrap_err().kind(),
        ErrorKind::NotInCall
    );
}
