//! The single worker that drains the admission queue.
//!
//! Exactly one [`Worker`] runs per process. It pops one request at a time, drives the backend to a
//! terminal outcome, and only then pops the next, so at most one generation is ever in flight.
//! A failure, timeout or panic inside one generation ends that request in `error` and the loop
//! carries on.
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use futures::FutureExt;
use metrics::histogram;
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendClient, GenerationError};
use crate::request::{Processing, Request};
use crate::storage::{OutputSender, RequestStore};
use crate::stream::OutputEvent;

#[derive(Clone)]
pub struct Worker {
    store: RequestStore,
    backend: Arc<dyn BackendClient>,
}

impl Worker {
    pub fn new(store: RequestStore, backend: Arc<dyn BackendClient>) -> Self {
        Self { store, backend }
    }

    /// Run the worker loop until `shutdown` is cancelled.
    ///
    /// A generation still running at shutdown is abandoned; its record stays in `processing`.
    #[tracing::instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!("Worker starting main processing loop");

        loop {
            if let Some((request, output)) = self.store.claim_next() {
                let request_id = request.data.id;
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {
                        tracing::warn!(request_id = %request_id, "Shutdown requested with a generation in flight");
                        break;
                    }
                    _ = self.process(request, output) => {}
                }
                continue;
            }

            tracing::trace!("Queue empty, waiting for work");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.store.work_available() => {}
            }
        }

        tracing::info!("Worker stopped");
    }

    /// Drive one claimed request to a terminal state.
    #[tracing::instrument(skip_all, fields(request_id = %request.data.id, model = %request.data.payload.model))]
    pub async fn process(&self, request: Request<Processing>, output: OutputSender) {
        tracing::info!(stream = request.data.payload.stream, "Processing request");
        let started = Instant::now();

        // Sends only fail once the reader has gone away, and the generation runs on regardless
        let streamed = AtomicBool::new(false);
        let sink = |token: &str| {
            streamed.store(true, Ordering::Relaxed);
            let _ = output.send(OutputEvent::Token(token.to_string()));
        };

        let result = AssertUnwindSafe(self.backend.generate(&request.data.payload, &sink))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(GenerationError::Interrupted {
                    message: "backend client panicked".to_string(),
                })
            });

        histogram!("queuectl_generation_duration_seconds").record(started.elapsed().as_secs_f64());

        match result {
            Ok(generation) => {
                // Non-streaming generations still reach an attached stream as one fragment
                if !streamed.load(Ordering::Relaxed) && !generation.text.is_empty() {
                    let _ = output.send(OutputEvent::Token(generation.text.clone()));
                }

                let bytes = generation.text.len();
                match request.complete(generation, &self.store) {
                    Ok(_) => tracing::info!(bytes, elapsed = ?started.elapsed(), "Request completed"),
                    Err(e) => tracing::error!(error = %e, "Failed to record completion"),
                }
                let _ = output.send(OutputEvent::Done);
            }
            Err(error) => {
                tracing::warn!(error = %error, kind = error.kind(), "Generation failed");

                let message = error.to_string();
                if let Err(e) = request.fail(message.clone(), &self.store) {
                    tracing::error!(error = %e, "Failed to record failure");
                }
                let _ = output.send(OutputEvent::Error(message));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockBackend, MockReply};
    use crate::request::{ChatMessage, GenerationRequest, RequestStatus};
    use crate::stream::read_once;
    use crate::types::ClientTag;
    use std::time::Duration;

    fn payload(model: &str) -> GenerationRequest {
        GenerationRequest::new(model, vec![ChatMessage::new("user", "hello")])
    }

    fn spawn_worker(store: &RequestStore, mock: &MockBackend) -> CancellationToken {
        let shutdown = CancellationToken::new();
        let worker = Worker::new(store.clone(), Arc::new(mock.clone()));
        tokio::spawn(worker.run(shutdown.clone()));
        shutdown
    }

    async fn wait_terminal(store: &RequestStore, id: crate::types::RequestId) -> crate::request::RequestRecord {
        tokio::time::timeout(Duration::from_secs(5), read_once(store, id))
            .await
            .expect("request should reach a terminal state")
            .unwrap()
    }

    #[test_log::test(tokio::test)]
    async fn test_requests_processed_in_arrival_order() {
        let store = RequestStore::new();
        let mock = MockBackend::new();

        let models = ["e", "d", "c", "b", "a"];
        let mut ids = Vec::new();
        for model in models {
            mock.add_reply(model, MockReply::text(format!("answer {model}")));
            ids.push(store.submit(payload(model), ClientTag::new("tests")).unwrap().id);
        }

        let shutdown = spawn_worker(&store, &mock);
        for id in &ids {
            wait_terminal(&store, *id).await;
        }

        let order: Vec<String> = mock.get_calls().into_iter().map(|c| c.model).collect();
        assert_eq!(order, models);
        assert_eq!(mock.max_in_flight(), 1);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_first_request_starts_strictly_before_second() {
        let store = RequestStore::new();
        let mock = MockBackend::new();
        mock.add_reply("a", MockReply::text("A"));
        mock.add_reply("b", MockReply::text("B"));
        let gate = mock.gate("a");

        let a = store.submit(payload("a"), ClientTag::new("tests")).unwrap();
        let b = store.submit(payload("b"), ClientTag::new("tests")).unwrap();
        assert_eq!((a.entry_position, b.entry_position), (1, 2));

        let shutdown = spawn_worker(&store, &mock);
        mock.wait_for_calls(1).await;

        // A holds the backend; B must still be waiting its turn
        assert_eq!(store.get(a.id).unwrap().status, RequestStatus::Processing);
        assert_eq!(store.get(b.id).unwrap().status, RequestStatus::Queued);
        assert_eq!(store.position(b.id), Some(1));

        gate.open();
        let b_record = wait_terminal(&store, b.id).await;
        let a_record = store.get(a.id).unwrap();

        assert!(a_record.started_at.unwrap() <= b_record.started_at.unwrap());
        assert!(a_record.completed_at.unwrap() <= b_record.started_at.unwrap());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_completion_records_result() {
        let store = RequestStore::new();
        let mock = MockBackend::new();
        mock.add_reply("m", MockReply::text("hello"));

        let shutdown = spawn_worker(&store, &mock);
        let c = store.submit(payload("m"), ClientTag::new("tests")).unwrap();

        let record = wait_terminal(&store, c.id).await;
        assert_eq!(record.status, RequestStatus::Complete);
        assert_eq!(record.result.as_deref(), Some("hello"));
        assert!(record.error.is_none());
        assert_eq!(store.stats().total_processed, 1);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_failure_does_not_affect_next_request() {
        let store = RequestStore::new();
        let mock = MockBackend::new();
        mock.add_reply(
            "bad",
            MockReply::fail(GenerationError::Unavailable {
                message: "connection refused".to_string(),
            }),
        );
        mock.add_reply("good", MockReply::text("fine"));

        let bad = store.submit(payload("bad"), ClientTag::new("tests")).unwrap();
        let good = store.submit(payload("good"), ClientTag::new("tests")).unwrap();
        let shutdown = spawn_worker(&store, &mock);

        let bad = wait_terminal(&store, bad.id).await;
        assert_eq!(bad.status, RequestStatus::Error);
        assert!(bad.error.unwrap().contains("connection refused"));
        assert!(bad.result.is_none());

        let good = wait_terminal(&store, good.id).await;
        assert_eq!(good.status, RequestStatus::Complete);
        assert_eq!(good.result.as_deref(), Some("fine"));

        let stats = store.stats();
        assert_eq!((stats.total_processed, stats.total_errors), (1, 1));
        assert_eq!(stats.current_request_id, None);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_backend_panic_fails_only_that_request() {
        let store = RequestStore::new();
        let mock = MockBackend::new();
        mock.add_reply(
            "m",
            MockReply::Panic {
                tokens: vec!["par".to_string()],
            },
        );
        mock.add_reply("m", MockReply::text("ok"));

        let a = store.submit(payload("m").streaming(true), ClientTag::new("tests")).unwrap();
        let b = store.submit(payload("m"), ClientTag::new("tests")).unwrap();
        let shutdown = spawn_worker(&store, &mock);

        let a_record = wait_terminal(&store, a.id).await;
        assert_eq!(a_record.status, RequestStatus::Error);
        assert!(a_record.error.unwrap().contains("backend client panicked"));
        assert_eq!(a_record.result, None);

        let b_record = wait_terminal(&store, b.id).await;
        assert_eq!(b_record.status, RequestStatus::Complete);
        assert_eq!(b_record.result.as_deref(), Some("ok"));

        let stats = store.stats();
        assert_eq!(stats.current_request_id, None);
        assert_eq!((stats.total_processed, stats.total_errors), (1, 1));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_partial_stream_is_an_error() {
        let store = RequestStore::new();
        let mock = MockBackend::new();
        mock.add_reply(
            "m",
            MockReply::Partial {
                tokens: vec!["half an ".to_string()],
                error: GenerationError::Interrupted {
                    message: "connection reset".to_string(),
                },
            },
        );

        let shutdown = spawn_worker(&store, &mock);
        let id = store.submit(payload("m").streaming(true), ClientTag::new("tests")).unwrap().id;
        store.listen(id);

        let record = wait_terminal(&store, id).await;
        assert_eq!(record.status, RequestStatus::Error);
        assert!(record.result.is_none());

        let mut output = store.take_output(id).unwrap();
        assert_eq!(output.recv().await, Some(OutputEvent::Token("half an ".to_string())));
        assert!(matches!(output.recv().await, Some(OutputEvent::Error(_))));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_non_streaming_text_is_written_as_one_token() {
        let store = RequestStore::new();
        let mock = MockBackend::new();
        mock.add_reply("m", MockReply::tokens(["never ", "streamed"]));

        let shutdown = spawn_worker(&store, &mock);
        let id = store.submit(payload("m"), ClientTag::new("tests")).unwrap().id;
        store.listen(id);
        wait_terminal(&store, id).await;

        let mut output = store.take_output(id).unwrap();
        assert_eq!(output.recv().await, Some(OutputEvent::Token("never streamed".to_string())));
        assert_eq!(output.recv().await, Some(OutputEvent::Done));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_worker_stops_on_shutdown() {
        let store = RequestStore::new();
        let mock = MockBackend::new();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Worker::new(store, Arc::new(mock)).run(shutdown.clone()));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker should stop promptly")
            .unwrap();
    }
}
