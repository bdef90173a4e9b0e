//! The generation payload: everything the backend needs to run one chat completion.
//!
//! Payloads are validated and have their sampling defaults filled in before admission; after
//! that they are immutable and travel with the request record.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::SamplingDefaults;
use crate::errors::{Error, Result};

/// One message in the ordered conversation sent to the model.
///
/// Only `role` is interpreted. `content` may be a string or an array of content parts, and any
/// other fields (`name`, `tool_calls`, `tool_call_id`, ...) are forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Some(Value::String(content.into())),
            extra: Map::new(),
        }
    }
}

/// Optional sampling parameters, forwarded to the backend only when set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct SamplingParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_penalty: Option<f32>,
    /// A single stop string or a list of them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logit_bias: Option<HashMap<String, f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// A generation request as admitted into the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Model identifier understood by the backend
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// Whether the backend should be asked for incremental tokens. An explicit `null` means `false`.
    #[serde(default, deserialize_with = "null_as_false")]
    pub stream: bool,
    #[serde(flatten)]
    pub params: SamplingParams,
}

fn null_as_false<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(false))
}

impl GenerationRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: false,
            params: SamplingParams::default(),
        }
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Reject payloads that can never be served: no model, no messages, or a message without a role.
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(Error::BadRequest {
                message: "'model' is required".to_string(),
            });
        }
        if self.messages.is_empty() {
            return Err(Error::BadRequest {
                message: "'messages' must contain at least one message".to_string(),
            });
        }
        if let Some(index) = self.messages.iter().position(|m| m.role.trim().is_empty()) {
            return Err(Error::BadRequest {
                message: format!("'messages[{index}].role' must not be empty"),
            });
        }
        Ok(())
    }

    /// Fill unset sampling parameters from the configured defaults.
    pub fn with_defaults(mut self, defaults: &SamplingDefaults) -> Self {
        let params = &mut self.params;
        params.temperature.get_or_insert(defaults.temperature);
        params.top_p.get_or_insert(defaults.top_p);
        params.frequency_penalty.get_or_insert(defaults.frequency_penalty);
        params.presence_penalty.get_or_insert(defaults.presence_penalty);
        self
    }
}
