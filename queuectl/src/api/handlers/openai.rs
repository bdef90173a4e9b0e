//! OpenAI-compatible facade.
//!
//! `/v1/chat/completions` goes through the same queue as the native API. Streaming responses carry
//! the protocol's own chunk objects, with queue position notices interleaved as SSE comments that
//! standard clients ignore. `/v1/models` is answered by the backend directly.

use async_stream::stream;
use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response, sse::Event},
};
use chrono::Utc;
use tracing::{info, warn};

use super::{position_notice, sse_response};
use crate::AppState;
use crate::api::models::openai::{
    ChatCompletion, ChatCompletionChunk, ErrorEnvelope, ModelList, OpenAiError, completion_id,
};
use crate::backend::GenerationError;
use crate::request::{GenerationRequest, RequestStatus};
use crate::stream::{StreamEvent, attach, read_once};
use crate::types::{ClientTag, RequestId};

#[tracing::instrument(skip_all)]
pub async fn chat_completions(
    State(state): State<AppState>,
    body: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<Response, OpenAiError> {
    let Json(payload) = body.map_err(|e| OpenAiError::invalid_request(e.body_text()))?;
    let payload = payload.with_defaults(&state.config.defaults);
    let model = payload.model.clone();
    let streaming = payload.stream;

    let admission = state.store.submit(payload, ClientTag::openai_compat())?;
    info!(
        request_id = %admission.id,
        entry_position = admission.entry_position,
        streaming,
        "Chat completion queued"
    );

    if streaming {
        stream_completion(&state, admission.id, model)
    } else {
        wait_for_completion(&state, admission.id, model).await
    }
}

fn stream_completion(state: &AppState, id: RequestId, model: String) -> Result<Response, OpenAiError> {
    let events = attach(&state.store, id)?;
    let chunk_id = completion_id(id);
    let created = Utc::now().timestamp();

    let body = stream! {
        let mut first = true;
        for await event in events {
            match event {
                StreamEvent::QueueEntered(position) => yield Ok(position_notice("queue_entered", position)),
                StreamEvent::QueuePosition(position) => yield Ok(position_notice("queue_position", position)),
                StreamEvent::Token(content) => {
                    yield Event::default().json_data(ChatCompletionChunk::content(&chunk_id, created, &model, content, first));
                    first = false;
                }
                StreamEvent::Done => {
                    yield Event::default().json_data(ChatCompletionChunk::finish(&chunk_id, created, &model));
                    yield Ok(Event::default().data("[DONE]"));
                }
                StreamEvent::Error(message) => {
                    yield Event::default().json_data(ErrorEnvelope::new(message, "server_error"));
                }
            }
        }
    };

    Ok(sse_response(body, state.config.queue.keep_alive))
}

/// Blocks until the record finishes, or until the configured wait runs out. Giving up does not
/// cancel the request; it still runs and its record stays queryable.
async fn wait_for_completion(state: &AppState, id: RequestId, model: String) -> Result<Response, OpenAiError> {
    let wait = state.config.queue.completion_wait_timeout;
    let record = match tokio::time::timeout(wait, read_once(&state.store, id)).await {
        Ok(record) => record?,
        Err(_) => {
            warn!(request_id = %id, wait = %humantime::format_duration(wait), "Gave up waiting for completion");
            return Err(OpenAiError::timeout("Request timed out"));
        }
    };

    match record.status {
        RequestStatus::Complete => Ok(Json(ChatCompletion::new(
            completion_id(id),
            record.created_at.timestamp(),
            model,
            record.result.unwrap_or_default(),
            record.usage,
        ))
        .into_response()),
        _ => Err(OpenAiError::server_error(
            record.error.unwrap_or_else(|| "Unknown error".to_string()),
        )),
    }
}

/// Pass-through of the backend's model list.
#[tracing::instrument(skip_all)]
pub async fn list_models(State(state): State<AppState>) -> Result<Json<ModelList>, OpenAiError> {
    match state.backend.list_models().await {
        Ok(data) => Ok(Json(ModelList::new(data))),
        Err(e @ (GenerationError::Unavailable { .. } | GenerationError::Timeout { .. })) => {
            warn!(error = %e, "Backend unreachable while listing models");
            Err(OpenAiError {
                status: StatusCode::BAD_GATEWAY,
                body: ErrorEnvelope::new(
                    format!("Cannot reach backend at {}. Is it running?", state.backend.base_url()),
                    "connection_error",
                ),
            }
            .with_details(e.to_string()))
        }
        Err(e) => {
            warn!(error = %e, "Backend failed to list models");
            Err(OpenAiError::server_error("Failed to fetch models from backend").with_details(e.to_string()))
        }
    }
}
