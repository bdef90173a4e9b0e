//! HTTP request handlers for all API endpoints.

pub mod health;
pub mod openai;
pub mod queue;

use std::time::Duration;

use axum::response::{
    IntoResponse, Response,
    sse::{Event, KeepAlive, Sse},
};
use futures::Stream;

use crate::errors::{Error, Result};
use crate::types::RequestId;

/// Ids come in as raw path segments; anything unparseable cannot name a request.
pub(crate) fn parse_request_id(raw: &str) -> Result<RequestId> {
    raw.parse().map_err(|_| Error::request_not_found(raw))
}

/// A queue position notice as an SSE comment line (`: queue_position=2`). Clients that do not
/// know about them skip comments, so they never disturb content parsing.
pub(crate) fn position_notice(name: &str, position: usize) -> Event {
    Event::default().comment(format!("{name}={position}"))
}

pub(crate) fn sse_response<S>(events: S, keep_alive: Option<Duration>) -> Response
where
    S: Stream<Item = std::result::Result<Event, axum::Error>> + Send + 'static,
{
    let sse = Sse::new(events);
    match keep_alive {
        Some(interval) => sse.keep_alive(KeepAlive::new().interval(interval)).into_response(),
        None => sse.into_response(),
    }
}
