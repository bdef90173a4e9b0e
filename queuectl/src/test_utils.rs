//! Test utilities for handler tests: an application wired to a scripted backend.

use std::sync::Arc;
use std::time::Duration;

use axum_test::TestServer;

use crate::backend::MockBackend;
use crate::config::{Config, QueueConfig};
use crate::storage::RequestStore;
use crate::{Application, BackgroundServices};

pub struct TestApp {
    pub server: TestServer,
    pub backend: Arc<MockBackend>,
    pub store: RequestStore,
    // Dropping this stops the worker
    pub _bg: BackgroundServices,
}

pub fn create_test_config() -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        queue: QueueConfig {
            completion_wait_timeout: Duration::from_millis(500),
            keep_alive: None,
        },
        ..Default::default()
    }
}

/// Must be called from within a tokio runtime.
pub fn create_test_app() -> TestApp {
    let backend = Arc::new(MockBackend::new());
    let app = Application::with_backend(create_test_config(), backend.clone()).expect("Failed to create application");
    let store = app.state().store.clone();
    let (server, bg) = app.into_test_server();

    TestApp {
        server,
        backend,
        store,
        _bg: bg,
    }
}

/// One meaningful line of an SSE body.
#[derive(Debug, Clone, PartialEq)]
pub enum SseLine {
    Comment(String),
    Data(String),
}

/// Split an SSE body into comment and data lines, in order. Blank lines and empty keep-alive
/// comments are dropped.
pub fn parse_sse(body: &str) -> Vec<SseLine> {
    body.lines()
        .filter_map(|line| {
            if let Some(data) = line.strip_prefix("data:") {
                Some(SseLine::Data(data.strip_prefix(' ').unwrap_or(data).to_string()))
            } else if let Some(comment) = line.strip_prefix(':') {
                let comment = comment.trim();
                (!comment.is_empty()).then(|| SseLine::Comment(comment.to_string()))
            } else {
                None
            }
        })
        .collect()
}

#[test]
fn test_parse_sse() {
    let body = ": queue_entered=2\n\n:queue_position=1\n\n:\n\ndata: {\"a\":1}\n\ndata: [DONE]\n\n";
    assert_eq!(
        parse_sse(body),
        vec![
            SseLine::Comment("queue_entered=2".to_string()),
            SseLine::Comment("queue_position=1".to_string()),
            SseLine::Data("{\"a\":1}".to_string()),
            SseLine::Data("[DONE]".to_string()),
        ]
    );
}
