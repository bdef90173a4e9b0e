//! Adapter over the downstream generation server.
//!
//! The [`BackendClient`] trait is the seam between the worker and the model server, so the worker
//! can be driven by the scripted [`MockBackend`] in tests and by [`OpenAiBackend`] in production.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error as ThisError;
use utoipa::ToSchema;

use crate::request::GenerationRequest;

pub mod mock;
pub mod openai;

pub use mock::{MockBackend, MockCall, MockGate, MockReply};
pub use openai::OpenAiBackend;

/// Token accounting as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A finished generation.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    /// Full output text; the concatenation of every token passed to `on_token`, if any were
    pub text: String,
    pub usage: Option<TokenUsage>,
}

/// Why a generation failed. The display string is what ends up in the record's `error`.
#[derive(ThisError, Debug, Clone, PartialEq)]
pub enum GenerationError {
    /// The backend could not be reached at all
    #[error("Backend unavailable: {message}")]
    Unavailable { message: String },

    /// Connecting, waiting for data, or the whole generation took too long
    #[error("Backend timed out: {message}")]
    Timeout { message: String },

    /// The backend answered a well-formed request with an error
    #[error("Backend error ({status}): {message}")]
    Backend { status: u16, message: String },

    /// The backend answered with something that is not a chat completion
    #[error("Malformed backend response: {message}")]
    Malformed { message: String },

    /// The stream ended before the backend signalled completion
    #[error("Backend stream interrupted: {message}")]
    Interrupted { message: String },
}

impl GenerationError {
    /// Short machine-friendly label, used for log fields and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            GenerationError::Unavailable { .. } => "unavailable",
            GenerationError::Timeout { .. } => "timeout",
            GenerationError::Backend { .. } => "backend",
            GenerationError::Malformed { .. } => "malformed",
            GenerationError::Interrupted { .. } => "interrupted",
        }
    }
}

/// Callback invoked once per incremental token, in the order the backend produced them.
pub type TokenSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Run one generation.
    ///
    /// For streaming payloads `on_token` is called for every fragment as it arrives and the
    /// returned text is their concatenation. For non-streaming payloads `on_token` is never called
    /// and the full text is returned at once.
    async fn generate(&self, request: &GenerationRequest, on_token: TokenSink<'_>) -> Result<Generation, GenerationError>;

    /// Models the backend currently reports, as raw model objects.
    async fn list_models(&self) -> Result<Vec<Value>, GenerationError>;

    /// Where the backend lives, for health output and error messages.
    fn base_url(&self) -> String;
}
