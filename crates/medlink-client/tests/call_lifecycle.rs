//! Call lifecycle over in-process loopback transports
//!
//! Tests the following:
//! - Both sides connect, exchange tracks and chat in order
//! - Screen share swaps in place and reverts once when toggle and capture end race
//! - Concurrent end triggers tear down once
//! - No relay traffic after the session ended
//! - Failure paths: media denied, bad remote offer, relay down, rejected
//!   writes, lost transport

mod common;

use std::time::Duration;

use common::{wait_state, Pair, Side, WAIT};
use medlink_client::peer::loopback::LoopbackFactory;
use medlink_client::peer::PeerState;
use medlink_client::{
    CallError, CallEvent, CallParams, CallState, EndReason, PreviewSource, TrackKind,
};
use medlink_common::{
    IncomingSession, NotificationBus, NotificationEvent, Participant, Role, SessionDescription,
    SessionEnded,
};
use medlink_gateway::SignalingStore;

fn ended_events(events: &[CallEvent]) -> Vec<EndReason> {
    events
        .iter()
        .filter_map(|event| match event {
            CallEvent::Ended { reason, .. } => Some(*reason),
            _ => None,
        })
        .collect()
}

fn failure(events: &[CallEvent]) -> Option<CallError> {
    events.iter().find_map(|event| match event {
        CallEvent::Failed { error, .. } => Some(error.clone()),
        _ => None,
    })
}

#[tokio::test]
async fn test_pair_connects_and_chats_in_order() {
    let mut pair = Pair::connect("consult-chat").await;
    let initiator = pair.initiator.session.clone();
    let responder = pair.responder.session.clone();

    assert!(initiator.chat().wait_open(WAIT).await);
    assert!(responder.chat().wait_open(WAIT).await);

    let mut responder_feed = responder.chat().subscribe();
    let mut initiator_feed = initiator.chat().subscribe();
    for text in ["vitals stable", "bp 120/80", "pupils reactive"] {
        initiator.chat().send(text).await.unwrap();
    }
    responder.chat().send("copy that").await.unwrap();

    let mut received = Vec::new();
    for _ in 0..3 {
        let message = tokio::time::timeout(WAIT, responder_feed.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.sender, "Dr. Rao");
        received.push(message.text);
    }
    assert_eq!(received, vec!["vitals stable", "bp 120/80", "pupils reactive"]);

    let reply = loop {
        let message = tokio::time::timeout(WAIT, initiator_feed.recv())
            .await
            .unwrap()
            .unwrap();
        if message.sender != "You" {
            break message;
        }
    };
    assert_eq!(reply.sender, "Field Unit 7");
    assert_eq!(reply.text, "copy that");

    // Audio and video arrived on both sides from a single offer.
    assert_eq!(initiator.remote_tracks().len(), 2);
    assert_eq!(responder.remote_tracks().len(), 2);
    assert_eq!(pair.initiator_transport().offers_created(), 1);
    assert_eq!(pair.responder_transport().offers_created(), 0);

    let started: Vec<_> = pair
        .initiator
        .drain_events()
        .into_iter()
        .filter(|event| matches!(event, CallEvent::Started { .. } | CallEvent::Connected { .. }))
        .collect();
    assert_eq!(started.len(), 2);

    initiator.end().await;
}

#[tokio::test]
async fn test_screen_share_reverts_once_when_toggle_and_capture_end_race() {
    let pair = Pair::connect("consult-share").await;
    let session = &pair.initiator.session;
    let transport = pair.initiator_transport();
    let share = session.screen_share().unwrap();
    let camera_id = transport.outgoing_track_id(TrackKind::Video).unwrap();

    assert!(session.toggle_screen_share().await.unwrap());
    let screen = share.outgoing_video().unwrap();
    assert_ne!(screen.id(), camera_id);
    assert_eq!(share.preview(), PreviewSource::Screen);

    let (toggled, _) = tokio::join!(session.toggle_screen_share(), async {
        screen.stop();
    });
    assert!(!toggled.unwrap());
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(share.revert_count(), 1);
    assert_eq!(share.preview(), PreviewSource::Camera);
    assert_eq!(
        transport.outgoing_track_id(TrackKind::Video).as_deref(),
        Some(camera_id.as_str())
    );
    assert_eq!(transport.offers_created(), 1);

    // Revoking the capture from outside reverts on its own.
    share.start().await.unwrap();
    share.outgoing_video().unwrap().stop();
    let mut preview = share.watch_preview();
    tokio::time::timeout(WAIT, preview.wait_for(|p| *p == PreviewSource::Camera))
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(share.revert_count(), 2);

    session.end().await;
}

#[tokio::test]
async fn test_concurrent_end_triggers_tear_down_once() {
    let mut pair = Pair::connect("consult-double-end").await;
    let transport = pair.initiator_transport();
    let session = pair.initiator.session.clone();

    tokio::join!(session.end(), session.end(), async {
        transport.simulate_state(PeerState::Failed);
    });
    wait_state(&session, CallState::Ended).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(transport.close_count(), 1);
    assert_eq!(pair.initiator.relay.clears(), 1);
    assert!(session.peer().is_none());
    assert!(!session.chat().is_open());

    let events = pair.initiator.drain_events();
    assert_eq!(ended_events(&events), vec![EndReason::LocalHangup]);

    assert!(pair.store.offer("consult-double-end").await.is_none());
    assert!(pair.store.answer("consult-double-end").await.is_none());
    assert!(pair
        .store
        .candidates("consult-double-end", None)
        .await
        .is_empty());
}

#[tokio::test]
async fn test_no_relay_traffic_after_end() {
    let store = SignalingStore::default();
    let factory = LoopbackFactory::new();
    // No responder: the initiator keeps polling for an answer.
    let side = Side::new(&store, &factory, "consult-lonely", Role::Initiator);
    side.session.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(side.relay.requests() > 2);

    side.session.end().await;
    let after_end = side.relay.requests();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(side.relay.requests(), after_end);
    assert_eq!(side.relay.clears(), 1);
    assert!(store.offer("consult-lonely").await.is_none());
}

#[tokio::test]
async fn test_media_access_denied_fails_start() {
    let store = SignalingStore::default();
    let factory = LoopbackFactory::new();
    let mut side = Side::new(&store, &factory, "consult-denied", Role::Initiator);
    side.devices.deny_user_media(true);

    let result = side.session.start().await;
    assert!(matches!(result, Err(CallError::MediaAccessDenied(_))));
    assert_eq!(side.session.state(), CallState::Ended);
    assert!(factory.transports().is_empty());

    let events = side.drain_events();
    assert!(matches!(events.first(), Some(CallEvent::Started { .. })));
    assert!(matches!(failure(&events), Some(CallError::MediaAccessDenied(_))));
    assert_eq!(ended_events(&events), vec![EndReason::Failed]);

    assert!(matches!(
        side.session.start().await,
        Err(CallError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_unusable_remote_offer_fails_negotiation() {
    let store = SignalingStore::default();
    store
        .put_offer("consult-garbage", SessionDescription::offer("not a session description"))
        .await
        .unwrap();
    let factory = LoopbackFactory::new();
    let mut side = Side::new(&store, &factory, "consult-garbage", Role::Responder);

    side.session.start().await.unwrap();
    wait_state(&side.session, CallState::Ended).await;

    let events = side.drain_events();
    assert!(matches!(failure(&events), Some(CallError::NegotiationFailed(_))));
    assert_eq!(ended_events(&events), vec![EndReason::Failed]);
    assert!(store.offer("consult-garbage").await.is_none());
}

#[tokio::test]
async fn test_relay_outage_fails_after_bounded_retries() {
    let store = SignalingStore::default();
    let factory = LoopbackFactory::new();
    let mut side = Side::new(&store, &factory, "consult-outage", Role::Initiator);
    side.relay.fail_all(true);

    side.session.start().await.unwrap();
    wait_state(&side.session, CallState::Ended).await;

    let events = side.drain_events();
    assert!(matches!(
        failure(&events),
        Some(CallError::SignalingUnavailable(_))
    ));
    // Description and candidate writers each give up after three attempts,
    // plus the final clear.
    assert!(side.relay.requests() <= 7, "{} requests", side.relay.requests());
    let settled = side.relay.requests();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(side.relay.requests(), settled);
}

#[tokio::test]
async fn test_rejected_writes_fail_without_retrying() {
    let store = SignalingStore::default();
    let factory = LoopbackFactory::new();
    // The relay refuses this id with 400 on every write.
    let mut side = Side::new(&store, &factory, "consult rejected", Role::Initiator);

    side.session.start().await.unwrap();
    wait_state(&side.session, CallState::Ended).await;

    let events = side.drain_events();
    assert!(matches!(failure(&events), Some(CallError::NegotiationFailed(_))));
    assert_eq!(ended_events(&events), vec![EndReason::Failed]);
    // One offer, at most one candidate, and the final clear.
    assert!(side.relay.requests() <= 4, "{} requests", side.relay.requests());
}

#[tokio::test]
async fn test_disconnect_without_recovery_ends_with_connection_lost() {
    let mut pair = Pair::connect("consult-grace").await;
    let transport = pair.responder_transport();

    transport.simulate_state(PeerState::Disconnected);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pair.responder.session.state(), CallState::Connected);

    wait_state(&pair.responder.session, CallState::Ended).await;
    let events = pair.responder.drain_events();
    assert!(matches!(failure(&events), Some(CallError::ConnectionLost(_))));
    assert_eq!(ended_events(&events), vec![EndReason::ConnectionLost]);

    pair.initiator.session.end().await;
}

#[tokio::test]
async fn test_recovered_disconnect_keeps_call() {
    let pair = Pair::connect("consult-flap").await;
    let transport = pair.responder_transport();

    transport.simulate_state(PeerState::Disconnected);
    tokio::time::sleep(Duration::from_millis(50)).await;
    transport.simulate_state(PeerState::Connected);
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(pair.responder.session.state(), CallState::Connected);
    assert!(pair.responder.session.duration() > Duration::ZERO);

    pair.responder.session.end().await;
    let frozen = pair.responder.session.duration();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pair.responder.session.duration(), frozen);
    pair.initiator.session.end().await;
}

#[tokio::test]
async fn test_remote_notice_ends_call() {
    let mut pair = Pair::connect("consult-notice").await;
    let bus = NotificationBus::new();
    let _guard = pair.responder.session.end_on_remote_notice(&bus);

    // A notice for another session is ignored.
    let other = SessionEnded {
        session_id: "consult-other".into(),
        duration_seconds: None,
        timestamp: chrono::Utc::now(),
    };
    bus.publish(&NotificationEvent::session_ended(None, &other).unwrap());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pair.responder.session.state(), CallState::Connected);

    let ours = SessionEnded {
        session_id: "consult-notice".into(),
        duration_seconds: Some(3),
        timestamp: chrono::Utc::now(),
    };
    bus.publish(&NotificationEvent::session_ended(Some("mi-7".into()), &ours).unwrap());
    wait_state(&pair.responder.session, CallState::Ended).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        ended_events(&pair.responder.drain_events()),
        vec![EndReason::RemoteHangup]
    );

    pair.initiator.session.end().await;
}

#[test]
fn test_incoming_session_makes_responder_params() {
    let incoming = IncomingSession {
        session_id: "consult-42".into(),
        initiator: Participant::new("dr-1", "Dr. Rao"),
        case_context: None,
        timestamp: chrono::Utc::now(),
    };
    let params = CallParams::from_incoming(Participant::new("mi-7", "Field Unit 7"), &incoming);
    assert_eq!(params.role, Role::Responder);
    assert_eq!(params.session_id, "consult-42");
    assert_eq!(params.remote.id, "dr-1");
}
