use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::{
        IntoResponse,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
};
use futures::StreamExt;
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;

use crate::app::AppState;
use crate::events::Event;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub(crate) struct EventsQuery {
    /// Browser reconnects send the `Last-Event-ID` header; the initial
    /// connect may pass the same value as a query parameter.
    #[serde(rename = "lastEventId")]
    last_event_id: Option<String>,
}

/// GET /api/events: the live event stream.
///
/// When the client presents a last-seen id, missed events are replayed from
/// the broker's ring first; a client too far behind gets a single
/// `sync_required` event instead and must resync. Either way the connection
/// then joins as a live subscriber, with keepalive comments holding the
/// transport open. Dropping the connection unsubscribes it.
pub(crate) async fn stream(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let broker = state.broker();

    let last_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(query.last_event_id)
        .and_then(|raw| raw.parse::<u64>().ok());

    let mut initial = vec![SseEvent::default().comment("connected")];
    if let Some(last_id) = last_id {
        let (events, ok) = broker.events_after(last_id);
        if ok {
            initial.extend(events.iter().map(|e| to_sse(e)));
        } else {
            initial.push(
                SseEvent::default()
                    .id(broker.last_event_id().to_string())
                    .event("sync_required")
                    .data("{}"),
            );
        }
    }

    let (guard, receiver) = broker.subscribe().into_parts();
    let live = ReceiverStream::new(receiver).map(move |event| {
        let _held = &guard;
        to_sse(&event)
    });

    let shutdown = state.cancel().clone().cancelled_owned();
    let events = futures::stream::iter(initial)
        .chain(live)
        .take_until(shutdown)
        .map(Ok::<SseEvent, Infallible>);

    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE_INTERVAL)
            .text("keepalive"),
    )
}

fn to_sse(event: &Event) -> SseEvent {
    SseEvent::default()
        .id(event.id.to_string())
        .event(event.kind.clone())
        .data(event.data.clone())
}
