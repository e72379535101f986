//! Server-Sent Events view of the process's local event bridge.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Extension, Query},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    routing::get,
    Router,
};
use tokio_stream::{Stream, StreamExt};

use fintrack_events::LocalEvent;

use crate::app::dto::EventStreamQuery;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new().route("/stream", get(stream_events))
}

fn to_sse(event: LocalEvent) -> Result<SseEvent, Infallible> {
    let sse = SseEvent::default()
        .event(event.topic.clone())
        .id(event.seq.to_string());
    Ok(match sse.json_data(&event) {
        Ok(sse) => sse,
        Err(e) => {
            tracing::warn!(topic = %event.topic, error = %e, "event not serializable for SSE");
            SseEvent::default().comment("unserializable event skipped")
        }
    })
}

/// GET /events/stream?topic=...
///
/// Retained state events first, then live events. `topic` narrows the stream
/// to one topic.
pub async fn stream_events(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<EventStreamQuery>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let events = match query.topic {
        Some(topic) => services.bridge.observe_topic(topic),
        None => services.bridge.observe(),
    };

    Sse::new(events.map(to_sse))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
