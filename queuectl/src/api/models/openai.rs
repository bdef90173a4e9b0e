//! Wire shapes of the OpenAI chat-completion protocol served by the compatibility facade.
//!
//! Only the response side lives here; requests deserialize straight into
//! [`GenerationRequest`](crate::request::GenerationRequest), which already has the protocol's shape.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::TokenUsage;
use crate::errors::Error;
use crate::types::RequestId;

pub const CHUNK_OBJECT: &str = "chat.completion.chunk";
pub const COMPLETION_OBJECT: &str = "chat.completion";

/// Completion ids are derived from the request id so a client can correlate them.
pub fn completion_id(id: RequestId) -> String {
    format!("chatcmpl-{id}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    /// Serialized as `null` on content chunks, as the protocol requires
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl ChatCompletionChunk {
    fn new(id: &str, created: i64, model: &str, delta: Delta, finish_reason: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            object: CHUNK_OBJECT.to_string(),
            created,
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish_reason.map(str::to_string),
            }],
        }
    }

    /// A content fragment. The first one of a response also announces the assistant role.
    pub fn content(id: &str, created: i64, model: &str, content: String, first: bool) -> Self {
        let delta = Delta {
            role: first.then(|| "assistant".to_string()),
            content: Some(content),
        };
        Self::new(id, created, model, delta, None)
    }

    /// The closing chunk: empty delta, `finish_reason: "stop"`.
    pub fn finish(id: &str, created: i64, model: &str) -> Self {
        Self::new(id, created, model, Delta::default(), Some("stop"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    /// Omitted when the backend did not report usage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub role: String,
    pub content: String,
}

impl ChatCompletion {
    pub fn new(id: String, created: i64, model: String, content: String, usage: Option<TokenUsage>) -> Self {
        Self {
            id,
            object: COMPLETION_OBJECT.to_string(),
            created,
            model,
            choices: vec![CompletionChoice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant".to_string(),
                    content,
                },
                finish_reason: "stop".to_string(),
            }],
            usage,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<Value>,
}

impl ModelList {
    pub fn new(data: Vec<Value>) -> Self {
        Self {
            object: "list".to_string(),
            data,
        }
    }
}

/// The protocol's error envelope: `{"error": {"message", "type", "code"?, "details"?}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

impl ErrorEnvelope {
    pub fn new(message: impl Into<String>, kind: &str) -> Self {
        Self {
            error: ErrorBody {
                message: message.into(),
                kind: kind.to_string(),
                code: None,
                details: None,
            },
        }
    }
}

/// An error answered in the protocol's own envelope, so unmodified clients raise it properly.
#[derive(Debug)]
pub struct OpenAiError {
    pub status: StatusCode,
    pub body: ErrorEnvelope,
}

impl OpenAiError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorEnvelope::new(message, "invalid_request_error"),
        }
    }

    /// The request ran and ended in `error`.
    pub fn server_error(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            body: ErrorEnvelope::new(message, "server_error"),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::GATEWAY_TIMEOUT,
            body: ErrorEnvelope::new(message, "timeout"),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.body.error.details = Some(details.into());
        self
    }
}

impl From<Error> for OpenAiError {
    fn from(error: Error) -> Self {
        match &error {
            Error::BadRequest { .. } => Self::invalid_request(error.user_message()),
            Error::NotFound { .. } => {
                let mut err = Self::invalid_request(error.user_message());
                err.status = StatusCode::NOT_FOUND;
                err.body.error.code = Some("not_found".to_string());
                err
            }
            _ => {
                tracing::error!("Internal service error: {:#}", error);
                Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    body: ErrorEnvelope::new(error.user_message(), "server_error"),
                }
            }
        }
    }
}

impl IntoResponse for OpenAiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
