use std::time::Duration;

use call_engine::peer::LinkState;
use call_engine::signaling::{SignalMessage, SignalType};
use call_engine::{
    CallEvent, CallState, ConnectionQuality, EngineConfig, ErrorKind, MediaKind, SessionKind,
};

use crate::integration::{connected_group, init_tracing};
use crate::utils::{test_config, wait_until, SignalingHub, TestPeer};

#[tokio::test]
async fn test_joiner_is_offered_by_every_member() {
    init_tracing();

    let hub = SignalingHub::new();
    let alice = TestPeer::new(&hub, "alice");
    let bob = TestPeer::new(&hub, "bob");
    let carol = TestPeer::new(&hub, "carol");

    let session = connected_group(&alice, &[&bob]).await;

    let joined = carol
        .engine
        .join_group_call(&session.id, "alice", vec!["bob".into()], MediaKind::Audio)
        .await
        .expect("join succeeds");
    assert_eq!(joined.id, session.id);
    assert_eq!(joined.kind, SessionKind::Group);
    assert_eq!(carol.engine.state(), CallState::Active(SessionKind::Group));
    assert!(carol
        .events
        .any(|e| matches!(e, CallEvent::SessionJoined(s) if s.id == session.id)));

    for member in ["alice", "bob"] {
        wait_until(&format!("carol to connect to {member}"), || {
            carol.engine.link_state(member) == Some(LinkState::Connected)
        })
        .await;
        // Members offer, the joiner only answers
        assert_eq!(hub.count(member, "carol", SignalType::Offer), 1);
        assert_eq!(hub.count("carol", member, SignalType::Offer), 0);
        assert_eq!(hub.count("carol", member, SignalType::Join), 1);
    }

    assert_eq!(alice.roster(), ["alice", "bob", "carol"]);
    assert!(alice.events.any(|e| matches!(
        e,
        CallEvent::ParticipantAdded(p) if p.id == "carol" && p.display_name == "User carol"
    )));
    wait_until("bob to list carol", || bob.participant("carol").is_some()).await;
}

#[tokio::test]
async fn test_join_into_full_session_is_rejected() {
    init_tracing();

    let hub = SignalingHub::new();
    let alice = TestPeer::with_config(
        &hub,
        "alice",
        EngineConfig {
            max_participants: 2,
            ..test_config()
        },
    );
    let bob = TestPeer::new(&hub, "bob");
    let carol = TestPeer::new(&hub, "carol");

    let session = connected_group(&alice, &[&bob]).await;

    carol
        .engine
        .join_group_call(&session.id, "alice", Vec::new(), MediaKind::Audio)
        .await
        .unwrap();

    wait_until("alice to turn carol away", || {
        hub.count("alice", "carol", SignalType::Reject) == 1
    })
    .await;
    let reject = hub
        .sent_between("alice", "carol")
        .into_iter()
        .find_map(|e| match e.message {
            SignalMessage::Reject(reject) => reject.reason,
            _ => None,
        });
    assert_eq!(reject.as_deref(), Some("session full"));
    assert_eq!(alice.roster(), ["alice", "bob"]);
    assert_eq!(hub.count("alice", "carol", SignalType::Offer), 0);

    // Carol drops the member that refused her
    wait_until("carol to drop alice", || carol.participant("alice").is_none()).await;
}

#[tokio::test]
async fn test_silent_member_times_out_after_join() {
    init_tracing();

    let hub = SignalingHub::new();
    let alice = TestPeer::new(&hub, "alice");
    let bob = TestPeer::new(&hub, "bob");
    let carol = TestPeer::with_config(
        &hub,
        "carol",
        EngineConfig {
            negotiation_timeout: Duration::from_millis(300),
            ..test_config()
        },
    );

    let session = connected_group(&alice, &[&bob]).await;

    // "ghost" is listed as a member but has no engine to offer back
    carol
        .engine
        .join_group_call(&session.id, "alice", vec!["ghost".into()], MediaKind::Audio)
        .await
        .unwrap();
    assert_eq!(carol.engine.link_state("ghost"), Some(LinkState::Idle));

    wait_until("ghost to time out", || {
        carol.events.any(|e| {
            matches!(
                e,
                CallEvent::Error { kind: ErrorKind::NegotiationTimeout, .. }
            )
        })
    })
    .await;
    wait_until("ghost to be poor", || {
        carol.quality_of("ghost") == Some(ConnectionQuality::Poor)
    })
    .await;
    assert_eq!(carol.engine.link_state("ghost"), None);

    // The host offered in time and is unaffected
    wait_until("carol to connect to alice", || {
        carol.engine.link_state("alice") == Some(LinkState::Connected)
    })
    .await;
    assert_eq!(carol.engine.state(), CallState::Active(SessionKind::Group));
}

#[tokio::test]
async fn test_unreachable_member_is_reported_on_join() {
    init_tracing();

    let hub = SignalingHub::new();
    let alice = TestPeer::new(&hub, "alice");
    let bob = TestPeer::new(&hub, "bob");
    let carol = TestPeer::new(&hub, "carol");

    let session = connected_group(&alice, &[&bob]).await;
    hub.set_unreachable("bob", true);

    carol
        .engine
        .join_group_call(&session.id, "alice", vec!["bob".into()], MediaKind::Audio)
        .await
        .unwrap();

    assert!(carol.events.any(|e| matches!(
        e,
        CallEvent::Error { kind, .. } if kind.is_link_scoped()
    )));
    assert_eq!(carol.engine.link_state("bob"), None);
    assert_eq!(carol.quality_of("bob"), Some(ConnectionQuality::Poor));
    assert!(carol.transports.latest("bob").unwrap().is_closed());
    assert_eq!(carol.engine.state(), CallState::Active(SessionKind::Group));
}
