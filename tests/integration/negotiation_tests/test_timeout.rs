use std::time::Duration;

use call_engine::{CallEvent, CallState, ConnectionQuality, ErrorKind, MediaKind, SessionKind};

use crate::integration::init_tracing;
use crate::utils::{test_config, wait_until, SignalingHub, TestPeer};

#[tokio::test]
async fn test_unanswered_offer_times_out_without_ending_call() {
    init_tracing();

    let hub = SignalingHub::new();
    let config = call_engine::EngineConfig {
        negotiation_timeout: Duration::from_millis(200),
        ..test_config()
    };
    let alice = TestPeer::with_config(&hub, "alice", config);

    // "ghost" has no engine behind it and never answers
    alice
        .engine
        .initiate_call("ghost", MediaKind::Audio)
        .await
        .unwrap();
    assert!(alice.engine.link_state("ghost").is_some());

    wait_until("the offer to time out", || {
        alice.events.any(|e| {
            matches!(
                e,
                CallEvent::Error { kind: ErrorKind::NegotiationTimeout, .. }
            )
        })
    })
    .await;

    wait_until("ghost to be marked poor", || {
        alice.quality_of("ghost") == Some(ConnectionQuality::Poor)
    })
    .await;
    assert_eq!(alice.engine.link_state("ghost"), None);
    assert_eq!(alice.engine.state(), CallState::Active(SessionKind::Direct));
    assert!(alice.transports.latest("ghost").unwrap().is_closed());
}

#[tokio::test]
async fn test_answer_in_time_cancels_timeout() {
    init_tracing();

    let hub = SignalingHub::new();
    let config = call_engine::EngineConfig {
        negotiation_timeout: Duration::from_millis(300),
        ..test_config()
    };
    let alice = TestPeer::with_config(&hub, "alice", config);
    let bob = TestPeer::new(&hub, "bob");

    let session = alice
        .engine
        .initiate_call("bob", MediaKind::Audio)
        .await
        .unwrap();
    bob.accept(&session.id).await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!alice.events.any(|e| matches!(e, CallEvent::Error { .. })));
    assert_eq!(alice.quality_of("bob"), Some(ConnectionQuality::Good));
}
