//! Models for the native queue API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::request::{ChatMessage, GenerationRequest, RequestRecord, RequestStatus, SamplingParams};
use crate::storage::QueueStats;
use crate::types::{ClientTag, RequestId};

fn default_stream() -> bool {
    true
}

/// Request body for submitting a generation to the queue.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct QueueAddRequest {
    /// Free-form label identifying the submitting client
    pub client_id: String,
    pub model: String,
    #[schema(value_type = Vec<Object>)]
    pub messages: Vec<ChatMessage>,
    /// Ask the backend for incremental tokens. Defaults to `true`.
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(flatten)]
    pub params: SamplingParams,
}

impl QueueAddRequest {
    pub fn into_parts(self) -> (ClientTag, GenerationRequest) {
        let payload = GenerationRequest {
            model: self.model,
            messages: self.messages,
            stream: self.stream,
            params: self.params,
        };
        (ClientTag::new(self.client_id), payload)
    }
}

/// Response returned once a request has been admitted.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct QueueAddResponse {
    /// Always `queued`
    pub status: RequestStatus,
    #[schema(value_type = String)]
    pub request_id: RequestId,
    /// 1-based position at admission
    pub queue_position: usize,
}

/// Process-wide queue snapshot.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct QueueStatusResponse {
    /// Requests waiting to be processed
    pub queue_size: usize,
    pub stats: QueueStats,
    /// Records retained in memory, in any state
    pub tracked_requests: usize,
}

/// Lifecycle of a single request.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RequestStatusResponse {
    #[schema(value_type = String)]
    pub request_id: RequestId,
    pub status: RequestStatus,
    pub client_id: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Full output, set only when `status` is `complete`
    pub result: Option<String>,
    /// Failure description, set only when `status` is `error`
    pub error: Option<String>,
    /// Position at admission
    pub queue_entered_position: usize,
    /// Live position; `0` once processing has started
    pub queue_position: usize,
}

impl RequestStatusResponse {
    pub fn new(record: RequestRecord, queue_position: usize) -> Self {
        Self {
            request_id: record.id,
            status: record.status,
            client_id: record.client_tag.to_string(),
            created_at: record.created_at,
            started_at: record.started_at,
            completed_at: record.completed_at,
            result: record.result,
            error: record.error,
            queue_entered_position: record.entry_position,
            queue_position,
        }
    }
}
