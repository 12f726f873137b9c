//! Server-Sent-Events notification stream.
//!
//! `GET /api/notifications/stream?identity=<id>` opens one long-lived stream
//! per potential responder. The stream sends `connected` first, then every
//! `incoming-session` / `session-ended` event addressed to the identity (or
//! broadcast), interleaved with a periodic `ping`.

use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::{
    extract::{rejection::QueryRejection, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
};
use futures_util::Stream;
use medlink_common::helpers::is_valid_identity;
use medlink_common::{NotificationBus, NotificationEvent, NotificationKind, Subscription};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::signal::error_response;
use crate::AppState;

/// Kinds forwarded from the bus to a stream. `connected` and `ping` are
/// produced by the stream itself.
const FORWARDED_KINDS: [NotificationKind; 2] = [
    NotificationKind::IncomingSession,
    NotificationKind::SessionEnded,
];

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub identity: String,
}

pub async fn notification_stream(
    State(state): State<AppState>,
    query: Result<Query<StreamQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    if !is_valid_identity(&query.identity) {
        return error_response(StatusCode::BAD_REQUEST, "invalid identity");
    }

    info!(identity = %query.identity, "notification stream opened");
    let stream = NotificationStream::open(&state.bus, query.identity, state.ping_interval);
    Sse::new(stream).into_response()
}

/// One subscriber's view of the bus. Dropping the stream (client went away,
/// server shutdown) drops its subscriptions with it.
pub struct NotificationStream {
    identity: String,
    greeting: Option<NotificationEvent>,
    events: mpsc::UnboundedReceiver<NotificationEvent>,
    ping: Interval,
    _subscriptions: Vec<Subscription>,
}

impl NotificationStream {
    pub fn open(bus: &NotificationBus, identity: String, ping_every: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriptions = FORWARDED_KINDS
            .iter()
            .map(|kind| {
                let tx = tx.clone();
                let identity = identity.clone();
                bus.subscribe(*kind, move |event| {
                    if event.is_addressed_to(&identity) {
                        let _ = tx.send(event.clone());
                    }
                })
            })
            .collect();

        let mut ping = interval_at(Instant::now() + ping_every, ping_every);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            identity,
            greeting: Some(NotificationEvent::connected()),
            events: rx,
            ping,
            _subscriptions: subscriptions,
        }
    }

    fn to_sse(event: &NotificationEvent) -> Option<Event> {
        match serde_json::to_string(event) {
            Ok(json) => Some(Event::default().event(event.kind.as_str()).data(json)),
            Err(err) => {
                error!("failed to serialize notification: {}", err);
                None
            }
        }
    }
}

impl Stream for NotificationStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(greeting) = self.greeting.take() {
            if let Some(event) = Self::to_sse(&greeting) {
                return Poll::Ready(Some(Ok(event)));
            }
        }

        loop {
            match self.events.poll_recv(cx) {
                Poll::Ready(Some(event)) => {
                    debug!(
                        identity = %self.identity,
                        kind = event.kind.as_str(),
                        "pushing notification"
                    );
                    match Self::to_sse(&event) {
                        Some(sse) => return Poll::Ready(Some(Ok(sse))),
                        None => continue,
                    }
                }
                // Senders live in the bus callbacks we own, so this only
                // happens while the stream is being torn down.
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => break,
            }
        }

        match self.ping.poll_tick(cx) {
            Poll::Ready(_) => match Self::to_sse(&NotificationEvent::ping()) {
                Some(event) => Poll::Ready(Some(Ok(event))),
                None => Poll::Pending,
            },
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for NotificationStream {
    fn drop(&mut self) {
        info!(identity = %self.identity, "notification stream closed");
    }
}
