use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use axum::Router;
use futures::Stream;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::main_lib::AppState;

/// Live feed of engine events as server-sent events, one JSON object per event.
async fn stream_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.events.subscribe();
    let stream = futures::stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => match Event::default().json_data(&event) {
                    Ok(sse_event) => return Some((Ok(sse_event), receiver)),
                    Err(err) => warn!("Failed to encode sync event: {}", err),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event stream subscriber lagged, {} events dropped", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/events", get(stream_events))
}
