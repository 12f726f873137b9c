//! Integration tests for the gateway HTTP surface
//!
//! Tests the following:
//! - Relay operations over POST /api/webrtc/signaling
//! - Slot reads over GET /api/webrtc/signaling
//! - Validation and size limits
//! - Call control (POST /api/video-call) driving notifications and clear
//! - Limits on announced calls, and hangups that only reach participants
//! - Health report

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use medlink_common::{NotificationKind, SessionEnded};
use medlink_gateway::{router, AppState, GatewayConfig};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

fn app() -> (Router, AppState) {
    let config = GatewayConfig::default();
    let state = AppState::new(&config);
    (router(state.clone(), &config), state)
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn relay(app: &Router, body: Value) -> (StatusCode, Value) {
    send(app, Method::POST, "/api/webrtc/signaling", Some(body)).await
}

fn candidate(n: u32) -> Value {
    json!({
        "candidate": format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000{n} typ host"),
        "sdpMid": "0",
        "sdpMLineIndex": 0
    })
}

#[tokio::test]
async fn test_offer_then_get_offer() {
    let (app, _) = app();
    let offer = json!({ "type": "offer", "sdp": "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\n" });

    let (status, body) = relay(&app, json!({ "type": "offer", "sessionId": "s1", "data": offer })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "success": true }));

    let (status, body) = relay(&app, json!({ "type": "get-offer", "sessionId": "s1" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["offer"], offer);
}

#[tokio::test]
async fn test_answer_absent_after_clear() {
    let (app, _) = app();
    let answer = json!({ "type": "answer", "sdp": "v=0" });
    relay(&app, json!({ "type": "answer", "sessionId": "s1", "data": answer })).await;

    let (_, body) = relay(&app, json!({ "type": "get-answer", "sessionId": "s1" })).await;
    assert_eq!(body["answer"], answer);

    let (status, body) = relay(&app, json!({ "type": "clear", "sessionId": "s1" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (_, body) = relay(&app, json!({ "type": "get-answer", "sessionId": "s1" })).await;
    assert!(body.get("answer").map_or(true, Value::is_null));

    // Clearing again is still an ack.
    let (status, _) = relay(&app, json!({ "type": "clear", "sessionId": "s1" })).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_candidates_in_submission_order() {
    let (app, _) = app();
    for n in [1, 2] {
        let (status, _) = relay(
            &app,
            json!({ "type": "ice-candidate", "sessionId": "s1", "data": candidate(n) }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (_, body) = relay(&app, json!({ "type": "get-candidates", "sessionId": "s1" })).await;
    assert_eq!(body["candidates"], json!([candidate(1), candidate(2)]));
}

#[tokio::test]
async fn test_full_cycle_clear_empties_every_slot() {
    let (app, _) = app();
    relay(&app, json!({ "type": "offer", "sessionId": "s1", "data": { "type": "offer", "sdp": "o" } })).await;
    relay(&app, json!({ "type": "answer", "sessionId": "s1", "data": { "type": "answer", "sdp": "a" } })).await;
    for (n, from) in [(1, "initiator"), (2, "initiator"), (3, "responder"), (4, "responder")] {
        relay(
            &app,
            json!({ "type": "ice-candidate", "sessionId": "s1", "data": candidate(n), "from": from }),
        )
        .await;
    }

    let (_, body) = relay(
        &app,
        json!({ "type": "get-candidates", "sessionId": "s1", "from": "responder" }),
    )
    .await;
    assert_eq!(body["candidates"], json!([candidate(3), candidate(4)]));

    relay(&app, json!({ "type": "clear", "sessionId": "s1" })).await;

    let (_, offer) = relay(&app, json!({ "type": "get-offer", "sessionId": "s1" })).await;
    let (_, answer) = relay(&app, json!({ "type": "get-answer", "sessionId": "s1" })).await;
    let (_, all) = relay(&app, json!({ "type": "get-candidates", "sessionId": "s1" })).await;
    let (_, theirs) = relay(
        &app,
        json!({ "type": "get-candidates", "sessionId": "s1", "from": "initiator" }),
    )
    .await;
    assert!(offer.get("offer").is_none());
    assert!(answer.get("answer").is_none());
    assert_eq!(all["candidates"], json!([]));
    assert_eq!(theirs["candidates"], json!([]));
}

#[tokio::test]
async fn test_get_variant_reads_slots() {
    let (app, _) = app();
    relay(&app, json!({ "type": "offer", "sessionId": "s-get", "data": { "type": "offer", "sdp": "o" } })).await;
    relay(&app, json!({ "type": "ice-candidate", "sessionId": "s-get", "data": candidate(1), "from": "initiator" })).await;

    let (status, body) = send(&app, Method::GET, "/api/webrtc/signaling?sessionId=s-get&type=offer", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["offer"]["sdp"], "o");

    let (_, body) = send(
        &app,
        Method::GET,
        "/api/webrtc/signaling?sessionId=s-get&type=candidates&from=initiator",
        None,
    )
    .await;
    assert_eq!(body["candidates"], json!([candidate(1)]));

    let (status, _) = send(&app, Method::GET, "/api/webrtc/signaling?sessionId=s-get&type=bogus", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_invalid_requests_are_rejected() {
    let (app, state) = app();

    let (status, body) = relay(&app, json!({ "type": "renegotiate", "sessionId": "s1" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let (status, _) = relay(&app, json!({ "type": "get-offer", "sessionId": "../etc" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let huge = "a".repeat(40 * 1024);
    let (status, _) = relay(
        &app,
        json!({ "type": "offer", "sessionId": "s1", "data": { "type": "offer", "sdp": huge } }),
    )
    .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(state.store.len().await, 0);
}

#[tokio::test]
async fn test_initiate_notifies_responder_and_end_clears() {
    let (app, state) = app();
    let seen: Arc<Mutex<Vec<(NotificationKind, Option<String>)>>> = Arc::default();

    let sink = Arc::clone(&seen);
    let _incoming = state.bus.subscribe(NotificationKind::IncomingSession, move |event| {
        sink.lock().unwrap().push((event.kind, event.recipient.clone()));
    });
    let sink = Arc::clone(&seen);
    let _ended = state.bus.subscribe(NotificationKind::SessionEnded, move |event| {
        let payload: SessionEnded = event.payload().unwrap();
        assert_eq!(payload.session_id, "consult-9");
        sink.lock().unwrap().push((event.kind, event.recipient.clone()));
    });

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/video-call",
        Some(json!({
            "sessionId": "consult-9",
            "action": "initiate",
            "initiator": { "id": "dr-1", "name": "Dr. Rao" },
            "responder": { "id": "mi-7", "name": "Field Unit 7" },
            "caseContext": { "patientName": "A. Patient", "age": 54, "urgency": "High" }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/video-call",
        Some(json!({
            "sessionId": "consult-9",
            "action": "initiate",
            "initiator": { "id": "dr-1", "name": "Dr. Rao" },
            "responder": { "id": "mi-7", "name": "Field Unit 7" }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    relay(&app, json!({ "type": "offer", "sessionId": "consult-9", "data": { "type": "offer", "sdp": "o" } })).await;

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/video-call",
        Some(json!({ "sessionId": "consult-9", "action": "end" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = relay(&app, json!({ "type": "get-offer", "sessionId": "consult-9" })).await;
    assert!(body.get("offer").is_none());

    let seen = seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            (NotificationKind::IncomingSession, Some("mi-7".to_string())),
            (NotificationKind::SessionEnded, Some("dr-1".to_string())),
            (NotificationKind::SessionEnded, Some("mi-7".to_string())),
        ]
    );
}

fn initiate_body(session_id: &str) -> Value {
    json!({
        "sessionId": session_id,
        "action": "initiate",
        "initiator": { "id": "dr-1", "name": "Dr. Rao" },
        "responder": { "id": "mi-7", "name": "Field Unit 7" }
    })
}

#[tokio::test]
async fn test_repeated_end_only_reaches_participants() {
    let (app, state) = app();
    let seen: Arc<Mutex<Vec<Option<String>>>> = Arc::default();
    let sink = Arc::clone(&seen);
    let _ended = state.bus.subscribe(NotificationKind::SessionEnded, move |event| {
        sink.lock().unwrap().push(event.recipient.clone());
    });

    let (status, _) = send(&app, Method::POST, "/api/video-call", Some(initiate_body("consult-9"))).await;
    assert_eq!(status, StatusCode::OK);

    // Both participants report the hangup.
    for _ in 0..2 {
        let (status, _) = send(
            &app,
            Method::POST,
            "/api/video-call",
            Some(json!({ "sessionId": "consult-9", "action": "end" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let recipients = seen.lock().unwrap().clone();
    assert_eq!(
        recipients,
        vec![Some("dr-1".to_string()), Some("mi-7".to_string())]
    );
}

#[tokio::test]
async fn test_end_of_unknown_call_clears_without_notifying() {
    let (app, state) = app();
    let notified = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&notified);
    let _ended = state.bus.subscribe(NotificationKind::SessionEnded, move |_| {
        *counter.lock().unwrap() += 1;
    });
    relay(&app, json!({ "type": "offer", "sessionId": "orphan", "data": { "type": "offer", "sdp": "o" } })).await;

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/video-call",
        Some(json!({ "sessionId": "orphan", "action": "end" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(*notified.lock().unwrap(), 0);
    assert_eq!(state.store.len().await, 0);
}

#[tokio::test]
async fn test_call_limit_rejects_new_calls() {
    let config = GatewayConfig {
        max_calls: 1,
        ..GatewayConfig::default()
    };
    let state = AppState::new(&config);
    let app = router(state, &config);

    let (status, _) = send(&app, Method::POST, "/api/video-call", Some(initiate_body("c-1"))).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = send(&app, Method::POST, "/api/video-call", Some(initiate_body("c-2"))).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(body["error"].as_str().unwrap().contains("limit"));
}

#[tokio::test]
async fn test_empty_candidate_is_bad_request() {
    let (app, state) = app();
    let (status, body) = relay(
        &app,
        json!({ "type": "ice-candidate", "sessionId": "s1", "data": { "candidate": "" } }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "empty payload");
    assert_eq!(state.store.len().await, 0);
}

#[tokio::test]
async fn test_initiate_requires_both_participants() {
    let (app, _) = app();
    let (status, _) = send(
        &app,
        Method::POST,
        "/api/video-call",
        Some(json!({ "sessionId": "s1", "action": "initiate" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health_reports_counts() {
    let (app, _) = app();
    relay(&app, json!({ "type": "ice-candidate", "sessionId": "s1", "data": candidate(1) })).await;

    let (status, body) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["signaling_records"], 1);
    assert_eq!(body["notification_streams"], 0);
}

#[tokio::test]
async fn test_rate_limit_applies_per_route() {
    let config = GatewayConfig {
        rate_limit: 2,
        ..GatewayConfig::default()
    };
    let app = router(AppState::new(&config), &config);

    for _ in 0..2 {
        let (status, _) = relay(&app, json!({ "type": "get-offer", "sessionId": "s1" })).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, body) = relay(&app, json!({ "type": "get-offer", "sessionId": "s1" })).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "Too many requests");

    let (status, _) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
}
