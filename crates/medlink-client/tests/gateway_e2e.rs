//! End-to-end against a real gateway on a loopback port
//!
//! Tests the following:
//! - HttpRelay against the live relay routes
//! - Incoming-session delivered over SSE to the responder's listener
//! - A full call placed and answered through the gateway, then ended from
//!   the gateway side

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{fast_config, wait_state, WAIT};
use medlink_client::media::SyntheticDevices;
use medlink_client::peer::loopback::LoopbackFactory;
use medlink_client::{
    CallParams, CallSession, CallState, ClientConfig, GatewayClient, HttpRelay, Liveness,
    NotificationListener, RelayError, SignalingRelay,
};
use medlink_common::{
    IceCandidate, IncomingSession, NotificationBus, NotificationKind, Participant, Role,
    SessionDescription,
};
use medlink_gateway::{router, AppState, GatewayConfig};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

async fn spawn_gateway() -> (String, AppState) {
    let config = GatewayConfig {
        rate_limit: 100_000,
        ..Default::default()
    };
    let state = AppState::new(&config);
    let app = router(state.clone(), &config);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), state)
}

fn config_for(url: &str) -> ClientConfig {
    ClientConfig {
        gateway_url: url.to_string(),
        notification_retry: Duration::from_millis(100),
        ..fast_config()
    }
}

#[tokio::test]
async fn test_http_relay_round_trip() {
    let (url, _state) = spawn_gateway().await;
    let relay = HttpRelay::new(&url).unwrap();

    assert_eq!(relay.get_offer("e2e-relay").await.unwrap(), None);
    let offer = SessionDescription::offer("v=0\r\n");
    relay.put_offer("e2e-relay", &offer).await.unwrap();
    assert_eq!(relay.get_offer("e2e-relay").await.unwrap(), Some(offer));

    let c1 = IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host");
    let c2 = IceCandidate::new("candidate:2 1 udp 1 10.0.0.2 5000 typ host");
    relay
        .put_candidate("e2e-relay", Role::Initiator, &c1)
        .await
        .unwrap();
    relay
        .put_candidate("e2e-relay", Role::Responder, &c2)
        .await
        .unwrap();
    assert_eq!(
        relay.get_candidates("e2e-relay", None).await.unwrap(),
        vec![c1.clone(), c2.clone()]
    );
    assert_eq!(
        relay
            .get_candidates("e2e-relay", Some(Role::Responder))
            .await
            .unwrap(),
        vec![c2]
    );

    relay.clear("e2e-relay").await.unwrap();
    assert_eq!(relay.get_offer("e2e-relay").await.unwrap(), None);
    assert!(relay
        .get_candidates("e2e-relay", None)
        .await
        .unwrap()
        .is_empty());

    let err = relay.get_offer("bad id!").await.unwrap_err();
    assert!(matches!(err, RelayError::Status { status: 400, .. }));
}

#[tokio::test]
async fn test_call_placed_and_answered_through_gateway() {
    let (url, state) = spawn_gateway().await;
    let config = config_for(&url);
    let factory = LoopbackFactory::new();
    let doctor = Participant::new("dr-1", "Dr. Rao");
    let field = Participant::new("mi-7", "Field Unit 7");

    // Responder side: listen for incoming sessions.
    let bus = NotificationBus::new();
    let (incoming_tx, mut incoming_rx) = mpsc::unbounded_channel();
    let _incoming = bus.subscribe(NotificationKind::IncomingSession, move |event| {
        if let Ok(incoming) = event.payload::<IncomingSession>() {
            let _ = incoming_tx.send(incoming);
        }
    });
    let connected = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&connected);
    let _connected = bus.subscribe(NotificationKind::Connected, move |_| {
        *counter.lock().unwrap() += 1;
    });
    let (listener_tx, listener_live) = Liveness::channel();
    let listener = NotificationListener::new(&config, &field.id, bus.clone())
        .unwrap()
        .spawn(listener_live);

    tokio::time::timeout(WAIT, async {
        while *connected.lock().unwrap() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // Initiator places the call.
    let control = GatewayClient::new(&url).unwrap();
    let session_id = medlink_client::new_session_id();
    control
        .initiate_call(&session_id, &doctor, &field, None)
        .await
        .unwrap();
    let initiator = CallSession::new(
        CallParams {
            session_id: session_id.clone(),
            role: Role::Initiator,
            local: doctor.clone(),
            remote: field.clone(),
            case_context: None,
            constraints: Default::default(),
        },
        config.clone(),
        Arc::new(HttpRelay::new(&url).unwrap()),
        Arc::new(factory.clone()),
        Arc::new(SyntheticDevices::new()),
    );
    initiator.start().await.unwrap();

    let incoming = tokio::time::timeout(WAIT, incoming_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(incoming.session_id, session_id);
    assert_eq!(incoming.initiator, doctor);

    let responder = CallSession::new(
        CallParams::from_incoming(field.clone(), &incoming),
        config.clone(),
        Arc::new(HttpRelay::new(&url).unwrap()),
        Arc::new(factory.clone()),
        Arc::new(SyntheticDevices::new()),
    );
    let _remote_end = responder.end_on_remote_notice(&bus);
    responder.start().await.unwrap();

    wait_state(&initiator, CallState::Connected).await;
    wait_state(&responder, CallState::Connected).await;

    assert!(responder.chat().wait_open(WAIT).await);
    let mut feed = initiator.chat().subscribe();
    responder.chat().send("ready for review").await.unwrap();
    let message = loop {
        let message = tokio::time::timeout(WAIT, feed.recv()).await.unwrap().unwrap();
        if message.sender != "You" {
            break message;
        }
    };
    assert_eq!(message.text, "ready for review");
    assert_eq!(message.sender, "Field Unit 7");

    // Hanging up on the initiator side and reporting it to the gateway ends
    // the responder through its notification stream.
    initiator.end().await;
    control.end_call(&session_id).await.unwrap();
    wait_state(&responder, CallState::Ended).await;

    assert!(state.store.offer(&session_id).await.is_none());
    assert!(state.store.answer(&session_id).await.is_none());
    assert_eq!(state.calls.len().await, 0);

    let _ = listener_tx.send(false);
    tokio::time::timeout(WAIT, listener).await.unwrap().unwrap();
}
