//! Scripted backend for tests.
//!
//! Replies are queued per model name and returned in FIFO order. A model can be gated, in which
//! case its generations block until the test opens the gate, which makes queue-order and
//! position-notice tests deterministic without relying on timing.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{Semaphore, watch};

use super::{BackendClient, Generation, GenerationError, TokenSink, TokenUsage};
use crate::request::GenerationRequest;

/// One scripted outcome.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Succeed, emitting these fragments (as tokens when the payload streams)
    Tokens {
        tokens: Vec<String>,
        usage: Option<TokenUsage>,
    },
    /// Emit these fragments, then fail
    Partial {
        tokens: Vec<String>,
        error: GenerationError,
    },
    /// Fail before producing anything
    Fail(GenerationError),
    /// Emit these fragments, then panic inside `generate`
    Panic { tokens: Vec<String> },
}

impl MockReply {
    pub fn text(text: impl Into<String>) -> Self {
        MockReply::Tokens {
            tokens: vec![text.into()],
            usage: None,
        }
    }

    pub fn tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MockReply::Tokens {
            tokens: tokens.into_iter().map(Into::into).collect(),
            usage: None,
        }
    }

    pub fn fail(error: GenerationError) -> Self {
        MockReply::Fail(error)
    }
}

/// Record of a call made to the mock backend.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub model: String,
    pub stream: bool,
    pub request: GenerationRequest,
}

/// Handle that releases generations blocked on a gated model.
#[derive(Clone)]
pub struct MockGate {
    permits: Arc<Semaphore>,
}

impl MockGate {
    /// Let one blocked (or future) generation through.
    pub fn open(&self) {
        self.permits.add_permits(1);
    }
}

#[derive(Clone)]
pub struct MockBackend {
    replies: Arc<Mutex<HashMap<String, VecDeque<MockReply>>>>,
    gates: Arc<Mutex<HashMap<String, MockGate>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    call_count: Arc<watch::Sender<usize>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    models: Arc<Mutex<Result<Vec<Value>, GenerationError>>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        let (call_count, _) = watch::channel(0);
        Self {
            replies: Arc::new(Mutex::new(HashMap::new())),
            gates: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            call_count: Arc::new(call_count),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
            models: Arc::new(Mutex::new(Ok(vec![json!({"id": "mock-model", "object": "model"})]))),
        }
    }

    /// Queue a reply for the next generation against `model`.
    pub fn add_reply(&self, model: &str, reply: MockReply) {
        self.replies.lock().entry(model.to_string()).or_default().push_back(reply);
    }

    /// Make every generation against `model` wait for a [`MockGate::open`].
    pub fn gate(&self, model: &str) -> MockGate {
        self.gates
            .lock()
            .entry(model.to_string())
            .or_insert_with(|| MockGate {
                permits: Arc::new(Semaphore::new(0)),
            })
            .clone()
    }

    pub fn set_models(&self, models: Result<Vec<Value>, GenerationError>) {
        *self.models.lock() = models;
    }

    /// Get all calls that have been made to this mock backend, in call order.
    pub fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Highest number of generations that were ever running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Wait until at least `n` generations have started.
    pub async fn wait_for_calls(&self, n: usize) {
        let mut count = self.call_count.subscribe();
        // The sender lives as long as self, so this only ends by reaching `n`
        let _ = count.wait_for(|count| *count >= n).await;
    }
}

#[async_trait]
impl BackendClient for MockBackend {
    async fn generate(&self, request: &GenerationRequest, on_token: TokenSink<'_>) -> Result<Generation, GenerationError> {
        self.calls.lock().push(MockCall {
            model: request.model.clone(),
            stream: request.stream,
            request: request.clone(),
        });
        self.call_count.send_modify(|count| *count += 1);

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        let _in_flight = scopeguard::guard(self.in_flight.clone(), |in_flight| {
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        let gate = self.gates.lock().get(&request.model).cloned();
        if let Some(gate) = gate {
            let permit = gate.permits.acquire().await.map_err(|_| GenerationError::Interrupted {
                message: "mock gate closed".to_string(),
            })?;
            permit.forget();
        }

        let reply = self
            .replies
            .lock()
            .get_mut(&request.model)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| {
                MockReply::Fail(GenerationError::Backend {
                    status: 404,
                    message: format!("no mock reply scripted for model '{}'", request.model),
                })
            });

        let emit = |tokens: &[String]| {
            if request.stream {
                for token in tokens {
                    on_token(token);
                }
            }
        };

        match reply {
            MockReply::Tokens { tokens, usage } => {
                emit(&tokens);
                Ok(Generation {
                    text: tokens.concat(),
                    usage,
                })
            }
            MockReply::Partial { tokens, error } => {
                emit(&tokens);
                Err(error)
            }
            MockReply::Fail(error) => Err(error),
            MockReply::Panic { tokens } => {
                emit(&tokens);
                panic!("scripted panic for model '{}'", request.model);
            }
        }
    }

    async fn list_models(&self) -> Result<Vec<Value>, GenerationError> {
        self.models.lock().clone()
    }

    fn base_url(&self) -> String {
        "mock://backend".to_string()
    }
}
