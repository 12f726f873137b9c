//! medlink signaling gateway.
//!
//! Serves the signaling relay used by two call clients to exchange session
//! descriptions and candidates, the call-control endpoint that rings a
//! responder, and the per-identity notification stream.

#![forbid(unsafe_code)]

pub mod call;
pub mod notify;
pub mod security;
pub mod signal;
pub mod store;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, FromRef, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use medlink_common::{NotificationBus, NotificationKind};
use serde::Serialize;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use call::{CallError, CallRegistry};
pub use security::FixedWindowRateLimiter;
pub use store::{SignalingStore, StoreConfig, StoreError};

const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Router-level settings that are not part of the relay store itself.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub store: StoreConfig,
    /// How long an announced call is remembered without an `end`.
    pub call_ttl: Duration,
    pub max_calls: usize,
    pub ping_interval: Duration,
    pub rate_limit: u32,
    pub rate_window: Duration,
    pub cors_allow_any: bool,
    pub allowed_origins: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            call_ttl: call::DEFAULT_CALL_TTL,
            max_calls: call::DEFAULT_CALL_LIMIT,
            ping_interval: DEFAULT_PING_INTERVAL,
            rate_limit: 1200,
            rate_window: Duration::from_secs(60),
            cors_allow_any: false,
            allowed_origins: String::new(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: SignalingStore,
    pub bus: NotificationBus,
    pub calls: CallRegistry,
    pub limiter: Arc<FixedWindowRateLimiter>,
    pub ping_interval: Duration,
}

impl AppState {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            store: SignalingStore::new(config.store),
            bus: NotificationBus::new(),
            calls: CallRegistry::new(config.call_ttl, config.max_calls),
            limiter: Arc::new(FixedWindowRateLimiter::new(
                config.rate_limit,
                config.rate_window,
                50_000,
            )),
            ping_interval: config.ping_interval,
        }
    }

    /// Sweeps expired signaling records and abandoned calls on a fixed
    /// interval until the task is aborted.
    pub fn spawn_cleanup(&self, every: Duration) -> JoinHandle<()> {
        let store = self.store.clone();
        let calls = self.calls.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let records = store.cleanup().await;
                let abandoned = calls.cleanup().await;
                if records > 0 || abandoned > 0 {
                    info!(
                        "expired {} idle signaling records and {} abandoned calls",
                        records, abandoned
                    );
                }
            }
        })
    }
}

impl FromRef<AppState> for SignalingStore {
    fn from_ref(state: &AppState) -> Self {
        state.store.clone()
    }
}

impl FromRef<AppState> for NotificationBus {
    fn from_ref(state: &AppState) -> Self {
        state.bus.clone()
    }
}

#[derive(Serialize)]
struct HealthReport {
    status: &'static str,
    signaling_records: usize,
    active_calls: usize,
    notification_streams: usize,
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthReport {
            status: "ok",
            signaling_records: state.store.len().await,
            active_calls: state.calls.len().await,
            notification_streams: state.bus.subscriber_count(NotificationKind::IncomingSession),
        }),
    )
}

async fn api_rate_limit(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let path = req.uri().path().to_string();
    if path == "/" || path == "/health" {
        return next.run(req).await;
    }

    let client_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "0.0.0.0".to_string());
    let key = format!("{}:{}:{}", req.method(), path, client_ip);
    if !state.limiter.allow(&key) {
        return signal::error_response(StatusCode::TOO_MANY_REQUESTS, "Too many requests");
    }

    next.run(req).await
}

/// Builds the gateway router around an existing state. Tests use this with
/// `tower::ServiceExt::oneshot`; the binary serves it with connect info.
pub fn router(state: AppState, config: &GatewayConfig) -> Router {
    Router::new()
        .route("/", get(|| async { "medlink gateway online" }))
        .route("/health", get(health))
        .route(
            "/api/webrtc/signaling",
            post(signal::signaling_post).get(signal::signaling_get),
        )
        .route("/api/video-call", post(call::video_call))
        .route(
            "/api/notifications/stream",
            get(notify::notification_stream),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            api_rate_limit,
        ))
        .layer(security::build_cors_layer(
            config.cors_allow_any,
            &config.allowed_origins,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
