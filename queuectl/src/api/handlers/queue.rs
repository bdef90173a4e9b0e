//! Native queue API: submit, inspect and stream requests by id.

use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    response::{Response, sse::Event},
};
use futures::StreamExt;
use serde_json::json;

use super::{parse_request_id, position_notice, sse_response};
use crate::AppState;
use crate::api::models::queue::{QueueAddRequest, QueueAddResponse, QueueStatusResponse, RequestStatusResponse};
use crate::errors::{Error, Result};
use crate::request::RequestStatus;
use crate::stream::{StreamEvent, attach};

/// Submit a generation request to the queue.
///
/// Returns immediately with the request id and its position at admission. Use
/// `/stream/{request_id}` or `/request/{request_id}` to follow it.
#[utoipa::path(
    post,
    path = "/queue/add",
    tag = "queue",
    request_body = QueueAddRequest,
    responses(
        (status = 200, description = "Request queued", body = QueueAddResponse),
        (status = 400, description = "Malformed payload"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn add_to_queue(
    State(state): State<AppState>,
    body: std::result::Result<Json<QueueAddRequest>, JsonRejection>,
) -> Result<Json<QueueAddResponse>> {
    let Json(body) = body.map_err(|e| Error::BadRequest { message: e.body_text() })?;
    let (client_tag, payload) = body.into_parts();

    let admission = state
        .store
        .submit(payload.with_defaults(&state.config.defaults), client_tag)?;

    Ok(Json(QueueAddResponse {
        status: RequestStatus::Queued,
        request_id: admission.id,
        queue_position: admission.entry_position,
    }))
}

/// Overall queue size and processing statistics.
#[utoipa::path(
    get,
    path = "/queue/status",
    tag = "queue",
    responses((status = 200, description = "Queue snapshot", body = QueueStatusResponse))
)]
pub async fn queue_status(State(state): State<AppState>) -> Json<QueueStatusResponse> {
    Json(QueueStatusResponse {
        queue_size: state.store.queue_depth(),
        stats: state.store.stats(),
        tracked_requests: state.store.tracked_requests(),
    })
}

/// Status of a single request.
#[utoipa::path(
    get,
    path = "/request/{request_id}",
    tag = "queue",
    params(("request_id" = String, Path, description = "Id returned by /queue/add")),
    responses(
        (status = 200, description = "Request found", body = RequestStatusResponse),
        (status = 404, description = "Unknown request id"),
    )
)]
#[tracing::instrument(skip(state))]
pub async fn get_request(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> Result<Json<RequestStatusResponse>> {
    let id = parse_request_id(&request_id)?;
    let (record, position) = state
        .store
        .get_with_position(id)
        .ok_or_else(|| Error::request_not_found(id))?;

    Ok(Json(RequestStatusResponse::new(record, position)))
}

/// Follow a request as Server-Sent Events.
///
/// Queue position notices arrive as comment lines (`: queue_entered=3`, `: queue_position=2`, ...,
/// `: queue_position=0`). Output follows as `data: {"chunk": ...}` events and ends with either
/// `data: {"done": true}` or `data: {"error": ...}`.
#[utoipa::path(
    get,
    path = "/stream/{request_id}",
    tag = "queue",
    params(("request_id" = String, Path, description = "Id returned by /queue/add")),
    responses(
        (status = 200, description = "Event stream", body = String, content_type = "text/event-stream"),
        (status = 404, description = "Unknown request id"),
    )
)]
#[tracing::instrument(skip(state))]
pub async fn stream_request(State(state): State<AppState>, Path(request_id): Path<String>) -> Result<Response> {
    let id = parse_request_id(&request_id)?;
    let events = attach(&state.store, id)?.map(native_event);

    Ok(sse_response(events, state.config.queue.keep_alive))
}

fn native_event(event: StreamEvent) -> std::result::Result<Event, axum::Error> {
    match event {
        StreamEvent::QueueEntered(position) => Ok(position_notice("queue_entered", position)),
        StreamEvent::QueuePosition(position) => Ok(position_notice("queue_position", position)),
        StreamEvent::Token(chunk) => Event::default().json_data(json!({ "chunk": chunk })),
        StreamEvent::Done => Event::default().json_data(json!({ "done": true })),
        StreamEvent::Error(error) => Event::default().json_data(json!({ "error": error })),
    }
}
