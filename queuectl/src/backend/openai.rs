//! Client for an OpenAI-compatible model server (LM Studio, llama.cpp server, vLLM, ...).

use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use super::{BackendClient, Generation, GenerationError, TokenSink, TokenUsage};
use crate::config::BackendConfig;
use crate::request::GenerationRequest;

/// Production backend client using reqwest.
///
/// Every call is bounded three ways: the TCP connect timeout, a stall timeout covering the wait for
/// response headers and every gap between streamed chunks, and an overall ceiling on the whole
/// generation. A hung backend therefore always surfaces as [`GenerationError::Timeout`].
#[derive(Clone)]
pub struct OpenAiBackend {
    client: reqwest::Client,
    base_url: Url,
    api_key: String,
    stall_timeout: Duration,
    request_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct CompletionBody {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    message: Option<ContentPart>,
    #[serde(default)]
    delta: Option<ContentPart>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<Value>,
}

impl OpenAiBackend {
    pub fn new(config: &BackendConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().connect_timeout(config.connect_timeout).build()?;

        Ok(Self {
            client,
            base_url: config.url.clone(),
            api_key: config.api_key.clone(),
            stall_timeout: config.stall_timeout,
            request_timeout: config.request_timeout,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base_url.as_str().trim_end_matches('/'), path)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_key.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.api_key)
        }
    }

    fn stall_error(&self, waiting_for: &str) -> GenerationError {
        GenerationError::Timeout {
            message: format!(
                "no {waiting_for} from {} within {}",
                self.base_url,
                humantime::format_duration(self.stall_timeout)
            ),
        }
    }

    fn transport_error(&self, error: reqwest::Error) -> GenerationError {
        if error.is_timeout() {
            GenerationError::Timeout {
                message: format!("request to {} timed out: {error}", self.base_url),
            }
        } else if error.is_connect() {
            GenerationError::Unavailable {
                message: format!("cannot connect to {}: {error}", self.base_url),
            }
        } else {
            GenerationError::Unavailable {
                message: format!("request to {} failed: {error}", self.base_url),
            }
        }
    }

    /// Send a request and wait for response headers, mapping non-2xx answers to
    /// [`GenerationError::Backend`].
    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, GenerationError> {
        let response = tokio::time::timeout(self.stall_timeout, self.authorize(builder).send())
            .await
            .map_err(|_| self.stall_error("response"))?
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = tokio::time::timeout(self.stall_timeout, response.text())
            .await
            .ok()
            .and_then(|body| body.ok())
            .unwrap_or_default();

        tracing::warn!(status = status.as_u16(), "Backend rejected request");
        Err(GenerationError::Backend {
            status: status.as_u16(),
            message: error_message(&body),
        })
    }

    async fn run(&self, request: &GenerationRequest, on_token: TokenSink<'_>) -> Result<Generation, GenerationError> {
        let builder = self.client.post(self.endpoint("chat/completions")).json(request);
        let response = self.send(builder).await?;

        if request.stream {
            self.read_stream(response, on_token).await
        } else {
            self.read_body(response).await
        }
    }

    async fn read_body(&self, response: reqwest::Response) -> Result<Generation, GenerationError> {
        let bytes = tokio::time::timeout(self.stall_timeout, response.bytes())
            .await
            .map_err(|_| self.stall_error("response body"))?
            .map_err(|e| GenerationError::Interrupted {
                message: e.to_string(),
            })?;

        let body: CompletionBody = serde_json::from_slice(&bytes).map_err(|e| GenerationError::Malformed {
            message: format!("expected a chat completion: {e}"),
        })?;

        if let Some(error) = body.error {
            return Err(GenerationError::Backend {
                status: 200,
                message: error_message(&error.to_string()),
            });
        }

        let choice = body.choices.into_iter().next().ok_or_else(|| GenerationError::Malformed {
            message: "response contained no choices".to_string(),
        })?;

        let text = choice.message.and_then(|m| m.content).unwrap_or_default();
        Ok(Generation {
            text,
            usage: body.usage,
        })
    }

    async fn read_stream(
        &self,
        response: reqwest::Response,
        on_token: TokenSink<'_>,
    ) -> Result<Generation, GenerationError> {
        let mut events = response.bytes_stream().eventsource();
        let mut text = String::new();
        let mut usage = None;
        let mut finished = false;

        loop {
            let next = tokio::time::timeout(self.stall_timeout, events.next())
                .await
                .map_err(|_| self.stall_error("data"))?;

            let Some(event) = next else {
                if finished {
                    break;
                }
                return Err(GenerationError::Interrupted {
                    message: format!("connection closed after {} characters", text.len()),
                });
            };

            let event = event.map_err(|e| GenerationError::Interrupted {
                message: e.to_string(),
            })?;

            if event.data.trim() == "[DONE]" {
                break;
            }

            let chunk: CompletionBody = serde_json::from_str(&event.data).map_err(|e| GenerationError::Malformed {
                message: format!("unparseable stream chunk: {e}"),
            })?;

            if let Some(error) = chunk.error {
                return Err(GenerationError::Backend {
                    status: 200,
                    message: error_message(&error.to_string()),
                });
            }

            if chunk.usage.is_some() {
                usage = chunk.usage;
            }

            for choice in chunk.choices {
                if let Some(content) = choice.delta.and_then(|d| d.content)
                    && !content.is_empty()
                {
                    on_token(&content);
                    text.push_str(&content);
                }
                if choice.finish_reason.is_some() {
                    finished = true;
                }
            }
        }

        Ok(Generation { text, usage })
    }
}

/// Pull a human-readable message out of an error body, whatever shape it has.
fn error_message(body: &str) -> String {
    let parsed = serde_json::from_str::<Value>(body).ok().and_then(|value| {
        let error = value.get("error").unwrap_or(&value);
        error
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| error.as_str())
            .map(str::to_string)
    });

    match parsed {
        Some(message) => message,
        None if body.trim().is_empty() => "empty response body".to_string(),
        None => body.trim().to_string(),
    }
}

#[async_trait]
impl BackendClient for OpenAiBackend {
    #[tracing::instrument(skip(self, request, on_token), fields(model = %request.model, stream = request.stream))]
    async fn generate(&self, request: &GenerationRequest, on_token: TokenSink<'_>) -> Result<Generation, GenerationError> {
        tracing::debug!(url = %self.endpoint("chat/completions"), "Calling backend");

        match tokio::time::timeout(self.request_timeout, self.run(request, on_token)).await {
            Ok(result) => result,
            Err(_) => Err(GenerationError::Timeout {
                message: format!(
                    "generation exceeded {}",
                    humantime::format_duration(self.request_timeout)
                ),
            }),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn list_models(&self) -> Result<Vec<Value>, GenerationError> {
        let response = self.send(self.client.get(self.endpoint("models"))).await?;

        let bytes = tokio::time::timeout(self.stall_timeout, response.bytes())
            .await
            .map_err(|_| self.stall_error("response body"))?
            .map_err(|e| self.transport_error(e))?;

        let list: ModelList = serde_json::from_slice(&bytes).map_err(|e| GenerationError::Malformed {
            message: format!("expected a model list: {e}"),
        })?;
        Ok(list.data)
    }

    fn base_url(&self) -> String {
        self.base_url.as_str().trim_end_matches('/').to_string()
    }
}
