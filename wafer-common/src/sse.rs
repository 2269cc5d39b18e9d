//! Server-Sent Events (SSE) utilities

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::events::EventBus;

/// Interval between SSE heartbeat comments
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Stream every bus event to one SSE client
///
/// Sends a `ConnectionStatus: connected` event first, then one SSE event per
/// [`SimEvent`](crate::events::SimEvent) named by its `event_type()`. Lagging
/// clients skip the events they missed. The stream ends when the bus is
/// dropped.
pub fn create_event_sse_stream(
    service_name: &'static str,
    event_bus: &EventBus,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!(service = service_name, "New SSE client connected");
    let mut rx = event_bus.subscribe();

    let stream = async_stream::stream! {
        yield Ok(Event::default()
            .event("ConnectionStatus")
            .data("connected"));

        loop {
            match rx.recv().await {
                Ok(event) => {
                    match serde_json::to_string(&event) {
                        Ok(data) => yield Ok(Event::default().event(event.event_type()).data(data)),
                        Err(e) => warn!(error = %e, "Failed to serialize event for SSE"),
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "SSE client lagging, events dropped");
                }
                Err(RecvError::Closed) => {
                    info!(service = service_name, "Event bus closed, ending SSE stream");
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(HEARTBEAT_INTERVAL)
            .text("heartbeat"),
    )
}
