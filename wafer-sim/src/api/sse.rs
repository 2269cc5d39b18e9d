//! Server-Sent Events endpoint

use axum::{
    extract::State,
    response::sse::{Event, Sse},
};
use futures::stream::Stream;
use std::convert::Infallible;

use crate::AppState;

/// GET /events
///
/// Streams every `SimEvent` (run started, wafer processed, state changes,
/// run completed) with a 15 s heartbeat.
pub async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    wafer_common::sse::create_event_sse_stream("wafer-sim", &state.event_bus)
}
