//! API layer for HTTP request handling and data models.
//!
//! - **[`handlers`]**: Axum route handlers for all API endpoints
//! - **[`models`]**: Request/response data structures for API communication
//!
//! # API Structure
//!
//! - **Native queue API** (`/queue/*`, `/request/{id}`, `/stream/{id}`): submit, poll and stream
//!   requests by id
//! - **OpenAI-compatible facade** (`/v1/chat/completions`, `/v1/models`): a drop-in stand-in for
//!   the backend's own API, with queue position notices as SSE comments
//! - **Health** (`/`, `/health`)
//!
//! # OpenAPI Documentation
//!
//! The native endpoints are documented with `utoipa`; the document is served at
//! `/api-docs/openapi.json`.

use utoipa::OpenApi;

pub mod handlers;
pub mod models;

#[derive(OpenApi)]
#[openapi(
    info(title = "queuectl", description = "FIFO admission queue and streaming relay for a single-concurrency LLM backend"),
    paths(
        handlers::queue::add_to_queue,
        handlers::queue::queue_status,
        handlers::queue::get_request,
        handlers::queue::stream_request,
        handlers::health::root,
        handlers::health::health,
    ),
    components(schemas(
        models::queue::QueueAddRequest,
        models::queue::QueueAddResponse,
        models::queue::QueueStatusResponse,
        models::queue::RequestStatusResponse,
        models::health::RootResponse,
        models::health::HealthResponse,
        crate::storage::QueueStats,
        crate::request::RequestStatus,
        crate::request::SamplingParams,
    )),
    tags(
        (name = "queue", description = "Native queue API"),
        (name = "health", description = "Liveness and service information"),
    )
)]
pub struct ApiDoc;
