//! Per-request live view over queue position and generation output.
//!
//! [`attach`] produces the ordered event sequence for one request:
//!
//! ```text
//! QueueEntered(n)  QueuePosition(k)*  QueuePosition(0)  Token(..)*  Done | Error(..)
//! ```
//!
//! Position notices are driven by store change notifications, so a notice is emitted only when the
//! request's rank actually moves. Ranks only ever shrink while a request waits, so the notices are
//! non-increasing and the last one before output is always `0`.

use async_stream::stream;
use futures::Stream;

use crate::errors::{Error, Result};
use crate::request::{RequestRecord, RequestStatus};
use crate::storage::RequestStore;
use crate::types::RequestId;

/// What the worker writes into a request's output channel.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputEvent {
    Token(String),
    /// Success; nothing follows
    Done,
    /// Failure; nothing follows
    Error(String),
}

/// One item of an attached stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Emitted once, first: the rank the request was admitted at
    QueueEntered(usize),
    /// Current rank; `0` means processing has begun and is emitted exactly once
    QueuePosition(usize),
    Token(String),
    Done,
    Error(String),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done | StreamEvent::Error(_))
    }
}

impl From<OutputEvent> for StreamEvent {
    fn from(event: OutputEvent) -> Self {
        match event {
            OutputEvent::Token(token) => StreamEvent::Token(token),
            OutputEvent::Done => StreamEvent::Done,
            OutputEvent::Error(error) => StreamEvent::Error(error),
        }
    }
}

/// Attach to a request's lifecycle and output.
///
/// Fails with `NotFound` for an unknown id. The first attacher after processing starts receives the
/// live output channel. Anyone attaching after that, or to a request whose channel was already
/// drained, gets the terminal outcome replayed from the record instead.
///
/// Dropping the stream does not affect the request; it runs to completion regardless.
pub fn attach(store: &RequestStore, id: RequestId) -> Result<impl Stream<Item = StreamEvent> + Send + 'static> {
    let store = store.clone();
    // Subscribe before the first read so no change can slip between them
    let mut changes = store.subscribe();
    let (record, mut position) = store.listen(id).ok_or_else(|| Error::request_not_found(id))?;

    Ok(stream! {
        yield StreamEvent::QueueEntered(record.entry_position);

        let mut last = record.entry_position;
        while position > 0 {
            if position != last {
                yield StreamEvent::QueuePosition(position);
                last = position;
            }
            if changes.changed().await.is_err() {
                break;
            }
            position = store.position(id).unwrap_or(0);
        }
        yield StreamEvent::QueuePosition(0);

        match store.take_output(id) {
            Some(mut output) => loop {
                match output.recv().await {
                    Some(event) => {
                        let event = StreamEvent::from(event);
                        let terminal = event.is_terminal();
                        yield event;
                        if terminal {
                            break;
                        }
                    }
                    None => {
                        yield StreamEvent::Error("generation ended without a result".to_string());
                        break;
                    }
                }
            },
            None => match read_once(&store, id).await {
                Ok(record) => {
                    for event in replay(&record) {
                        yield event;
                    }
                }
                Err(e) => {
                    yield StreamEvent::Error(e.user_message());
                }
            },
        }
    })
}

/// Wait until the request is terminal and return its final record.
///
/// Only the caller waits; the worker is never blocked by this.
pub async fn read_once(store: &RequestStore, id: RequestId) -> Result<RequestRecord> {
    let mut changes = store.subscribe();
    loop {
        let record = store.get_status(id)?;
        if record.status.is_terminal() {
            return Ok(record);
        }
        changes.changed().await.map_err(|_| Error::Internal {
            operation: "watch request store".to_string(),
        })?;
    }
}

/// Terminal outcome of a finished record as stream events.
fn replay(record: &RequestRecord) -> Vec<StreamEvent> {
    match record.status {
        RequestStatus::Complete => {
            let mut events = Vec::new();
            if let Some(result) = record.result.as_ref().filter(|r| !r.is_empty()) {
                events.push(StreamEvent::Token(result.clone()));
            }
            events.push(StreamEvent::Done);
            events
        }
        _ => vec![StreamEvent::Error(
            record.error.clone().unwrap_or_else(|| "Unknown error".to_string()),
        )],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{GenerationError, MockBackend, MockReply};
    use crate::request::{ChatMessage, GenerationRequest};
    use crate::types::ClientTag;
    use crate::worker::Worker;
    use futures::StreamExt;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn payload(model: &str) -> GenerationRequest {
        GenerationRequest::new(model, vec![ChatMessage::new("user", "hello")]).streaming(true)
    }

    async fn next<S: Stream<Item = StreamEvent> + Unpin>(stream: &mut S) -> StreamEvent {
        tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("stream stalled")
            .expect("stream ended early")
    }

    fn spawn_worker(store: &RequestStore, mock: &MockBackend) -> CancellationToken {
        let shutdown = CancellationToken::new();
        tokio::spawn(Worker::new(store.clone(), Arc::new(mock.clone())).run(shutdown.clone()));
        shutdown
    }

    #[test_log::test(tokio::test)]
    async fn test_position_notices_count_down_then_content() {
        let store = RequestStore::new();
        let mock = MockBackend::new();
        mock.add_reply("a", MockReply::text("A"));
        mock.add_reply("b", MockReply::text("B"));
        mock.add_reply("e", MockReply::tokens(["Hel", "lo"]));
        let gate_a = mock.gate("a");
        let gate_b = mock.gate("b");

        store.submit(payload("a"), ClientTag::new("tests")).unwrap();
        store.submit(payload("b"), ClientTag::new("tests")).unwrap();
        let e = store.submit(payload("e"), ClientTag::new("tests")).unwrap();
        assert_eq!(e.entry_position, 3);

        let mut events = Box::pin(attach(&store, e.id).unwrap());
        assert_eq!(next(&mut events).await, StreamEvent::QueueEntered(3));

        let shutdown = spawn_worker(&store, &mock);
        assert_eq!(next(&mut events).await, StreamEvent::QueuePosition(2));

        gate_a.open();
        assert_eq!(next(&mut events).await, StreamEvent::QueuePosition(1));

        gate_b.open();
        assert_eq!(next(&mut events).await, StreamEvent::QueuePosition(0));
        assert_eq!(next(&mut events).await, StreamEvent::Token("Hel".to_string()));
        assert_eq!(next(&mut events).await, StreamEvent::Token("lo".to_string()));
        assert_eq!(next(&mut events).await, StreamEvent::Done);
        assert!(events.next().await.is_none());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_positions_never_increase() {
        let store = RequestStore::new();
        let mock = MockBackend::new();
        for model in ["a", "b", "c", "d"] {
            mock.add_reply(model, MockReply::text(model));
            store.submit(payload(model), ClientTag::new("tests")).unwrap();
        }
        mock.add_reply("last", MockReply::text("done"));
        let last = store.submit(payload("last"), ClientTag::new("tests")).unwrap();

        let stream = attach(&store, last.id).unwrap();
        let shutdown = spawn_worker(&store, &mock);
        let events = tokio::time::timeout(Duration::from_secs(5), stream.collect::<Vec<_>>())
            .await
            .unwrap();

        let positions: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::QueueEntered(p) | StreamEvent::QueuePosition(p) => Some(*p),
                _ => None,
            })
            .collect();
        assert_eq!(positions.first(), Some(&5));
        assert_eq!(positions.last(), Some(&0));
        assert!(positions.windows(2).all(|w| w[0] >= w[1]), "{positions:?}");
        assert_eq!(events.iter().filter(|e| **e == StreamEvent::QueuePosition(0)).count(), 1);
        assert_eq!(events.last(), Some(&StreamEvent::Done));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_error_is_terminal_event() {
        let store = RequestStore::new();
        let mock = MockBackend::new();
        mock.add_reply(
            "m",
            MockReply::fail(GenerationError::Timeout {
                message: "no data within 2m".to_string(),
            }),
        );

        let id = store.submit(payload("m"), ClientTag::new("tests")).unwrap().id;
        let stream = attach(&store, id).unwrap();
        let shutdown = spawn_worker(&store, &mock);

        let events: Vec<StreamEvent> = stream.collect().await;
        assert_eq!(events[0], StreamEvent::QueueEntered(1));
        assert_eq!(events[1], StreamEvent::QueuePosition(0));
        match &events[2] {
            StreamEvent::Error(message) => assert!(message.contains("no data within 2m")),
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(events.len(), 3);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_late_attach_replays_outcome() {
        let store = RequestStore::new();
        let mock = MockBackend::new();
        mock.add_reply("m", MockReply::tokens(["hel", "lo"]));
        let shutdown = spawn_worker(&store, &mock);

        let id = store.submit(payload("m"), ClientTag::new("tests")).unwrap().id;
        read_once(&store, id).await.unwrap();

        // Nobody listened while it ran, so the tokens were not kept; every attacher gets the
        // whole result at once
        let expected = vec![
            StreamEvent::QueueEntered(1),
            StreamEvent::QueuePosition(0),
            StreamEvent::Token("hello".to_string()),
            StreamEvent::Done,
        ];
        assert!(store.take_output(id).is_none());
        let first: Vec<StreamEvent> = attach(&store, id).unwrap().collect().await;
        assert_eq!(first, expected);
        let second: Vec<StreamEvent> = attach(&store, id).unwrap().collect().await;
        assert_eq!(second, expected);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_second_attacher_gets_replay_after_first_took_channel() {
        let store = RequestStore::new();
        let mock = MockBackend::new();
        mock.add_reply("m", MockReply::tokens(["hel", "lo"]));

        let id = store.submit(payload("m"), ClientTag::new("tests")).unwrap().id;
        let first = attach(&store, id).unwrap();
        let shutdown = spawn_worker(&store, &mock);

        let first: Vec<StreamEvent> = first.collect().await;
        assert_eq!(
            &first[2..],
            &[
                StreamEvent::Token("hel".to_string()),
                StreamEvent::Token("lo".to_string()),
                StreamEvent::Done,
            ]
        );

        let second: Vec<StreamEvent> = attach(&store, id).unwrap().collect().await;
        assert_eq!(
            &second[2..],
            &[StreamEvent::Token("hello".to_string()), StreamEvent::Done]
        );
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_disconnect_does_not_cancel_request() {
        let store = RequestStore::new();
        let mock = MockBackend::new();
        mock.add_reply("m", MockReply::tokens(["still ", "running"]));
        let gate = mock.gate("m");

        let id = store.submit(payload("m"), ClientTag::new("tests")).unwrap().id;
        let shutdown = spawn_worker(&store, &mock);

        let mut events = Box::pin(attach(&store, id).unwrap());
        assert_eq!(next(&mut events).await, StreamEvent::QueueEntered(1));
        assert_eq!(next(&mut events).await, StreamEvent::QueuePosition(0));
        drop(events);

        gate.open();
        let record = tokio::time::timeout(Duration::from_secs(5), read_once(&store, id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, RequestStatus::Complete);
        assert_eq!(record.result.as_deref(), Some("still running"));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_attach_unknown_request() {
        let store = RequestStore::new();
        assert!(matches!(attach(&store, RequestId::new()), Err(Error::NotFound { .. })));
        assert!(matches!(read_once(&store, RequestId::new()).await, Err(Error::NotFound { .. })));
    }
}
