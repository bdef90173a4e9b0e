//! # queuectl: admission queue for a single-concurrency model server
//!
//! Local model servers generally run one generation at a time. When several clients hit one
//! directly, requests contend, time out or fail in ways the client cannot see. `queuectl` sits in
//! front of such a server, admits every request into a FIFO queue, and lets exactly one worker
//! talk to the backend. Clients always know where they stand: every streaming response opens with
//! its queue position and counts down to zero before content starts.
//!
//! ## Architecture
//!
//! - [`storage::RequestStore`] owns the queue and every request record. Positions are derived from
//!   admission order, never stored.
//! - [`worker::Worker`] pops one request at a time and drives it to `complete` or `error` through a
//!   [`backend::BackendClient`].
//! - [`stream`] turns a request id into an ordered event stream: position notices, then tokens,
//!   then exactly one terminal event.
//! - [`api`] serves two surfaces over that stream: a native queue API (`/queue/add`,
//!   `/request/{id}`, `/stream/{id}`) and an OpenAI-compatible facade (`/v1/chat/completions`,
//!   `/v1/models`) in which position notices travel as SSE comment lines that standard clients
//!   skip.
//!
//! Request lifecycles use the typestate pattern in [`request`]: a request can only be started
//! from `queued` and only finished from `processing`.
//!
//! ## Configuration
//!
//! See [`config`]. Settings come from a YAML file, then `QUEUECTL_`-prefixed environment
//! variables, with `LM_STUDIO_URL` accepted as a shortcut for the backend location.

pub mod api;
pub mod backend;
pub mod config;
pub mod errors;
pub mod request;
pub mod storage;
pub mod stream;
pub mod telemetry;
#[cfg(test)]
mod test_utils;
pub mod types;
pub mod worker;

use std::sync::Arc;

use axum::{
    Json, Router,
    http::HeaderValue,
    routing::{get, post},
};
use axum_prometheus::PrometheusMetricLayer;
use bon::Builder;
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, debug, info};
use utoipa::OpenApi;

use crate::api::ApiDoc;
use crate::backend::{BackendClient, OpenAiBackend};
use crate::config::CorsOrigin;
use crate::storage::RequestStore;
use crate::worker::Worker;

pub use config::Config;
pub use errors::Error;
pub use types::{ClientTag, RequestId};

/// Application state shared across all request handlers.
///
/// ```ignore
/// let state = AppState::builder()
///     .config(config)
///     .store(RequestStore::new())
///     .backend(backend)
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    pub store: RequestStore,
    pub backend: Arc<dyn BackendClient>,
}

/// Create CORS layer from configuration
fn create_cors_layer(config: &Config) -> anyhow::Result<Option<CorsLayer>> {
    let allowed = &config.cors.allowed_origins;
    if allowed.is_empty() {
        return Ok(None);
    }

    let allow_origin = if allowed.iter().any(|origin| matches!(origin, CorsOrigin::Wildcard)) {
        AllowOrigin::any()
    } else {
        let mut origins = Vec::with_capacity(allowed.len());
        for origin in allowed {
            if let CorsOrigin::Url(url) = origin {
                origins.push(url.origin().ascii_serialization().parse::<HeaderValue>()?);
            }
        }
        AllowOrigin::list(origins)
    };

    let mut cors = CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any);

    if let Some(max_age) = config.cors.max_age {
        cors = cors.max_age(std::time::Duration::from_secs(max_age));
    }

    Ok(Some(cors))
}

/// Build the application router: native queue API, OpenAI-compatible facade, health, the
/// OpenAPI document, and the optional CORS and metrics layers.
pub fn build_router(state: AppState) -> anyhow::Result<Router> {
    use api::handlers::{health, openai, queue};

    let mut router = Router::new()
        .route("/", get(health::root))
        .route("/health", get(health::health))
        .route("/queue/add", post(queue::add_to_queue))
        .route("/queue/status", get(queue::queue_status))
        .route("/request/{request_id}", get(queue::get_request))
        .route("/stream/{request_id}", get(queue::stream_request))
        .route("/v1/chat/completions", post(openai::chat_completions))
        .route("/v1/models", get(openai::list_models))
        .route("/api-docs/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .with_state(state.clone());

    if let Some(cors_layer) = create_cors_layer(&state.config)? {
        router = router.layer(cors_layer);
    }

    if state.config.enable_metrics {
        let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();
        router = router
            .route("/internal/metrics", get(|| async move { metric_handle.render() }))
            .layer(prometheus_layer);
    }

    let router = router.layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    Ok(router)
}

/// The worker task and the token that stops it.
///
/// Dropping this cancels the shutdown token through `drop_guard`, so a test that lets its
/// services go out of scope also stops its worker.
pub struct BackgroundServices {
    background_tasks: Vec<tokio::task::JoinHandle<()>>,
    shutdown_token: tokio_util::sync::CancellationToken,
    // Pub so that we can disarm it if we want to
    pub drop_guard: Option<tokio_util::sync::DropGuard>,
}

impl BackgroundServices {
    /// Gracefully shutdown all background tasks
    pub async fn shutdown(self) {
        self.shutdown_token.cancel();

        for handle in self.background_tasks {
            let _ = handle.await;
        }
    }
}

fn setup_background_services(store: RequestStore, backend: Arc<dyn BackendClient>) -> BackgroundServices {
    let shutdown_token = tokio_util::sync::CancellationToken::new();
    let drop_guard = shutdown_token.clone().drop_guard();

    let worker = Worker::new(store, backend);
    let handle = tokio::spawn(worker.run(shutdown_token.clone()));

    BackgroundServices {
        background_tasks: vec![handle],
        shutdown_token,
        drop_guard: Some(drop_guard),
    }
}

/// Main application struct that owns the router, the shared store and the worker.
///
/// # Lifecycle
///
/// 1. **Create**: [`Application::new`] builds the backend client and starts the worker
/// 2. **Serve**: [`Application::serve`] binds to a TCP port and starts handling requests
/// 3. **Shutdown**: when the shutdown future resolves, stops accepting requests and then stops
///    the worker
pub struct Application {
    router: Router,
    app_state: AppState,
    config: Config,
    bg_services: BackgroundServices,
}

impl Application {
    /// Create a new application talking to the configured backend.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let backend = OpenAiBackend::new(&config.backend)?;
        Self::with_backend(config, Arc::new(backend))
    }

    /// Create an application around any backend client. Must be called inside a tokio runtime,
    /// as it spawns the worker.
    pub fn with_backend(config: Config, backend: Arc<dyn BackendClient>) -> anyhow::Result<Self> {
        debug!("Starting queuectl with configuration: {:#?}", config);

        let store = RequestStore::new();
        let bg_services = setup_background_services(store.clone(), backend.clone());

        let app_state = AppState::builder()
            .config(config.clone())
            .store(store)
            .backend(backend)
            .build();

        let router = build_router(app_state.clone())?;

        Ok(Self {
            router,
            app_state,
            config,
            bg_services,
        })
    }

    pub fn state(&self) -> &AppState {
        &self.app_state
    }

    /// Convert application into a test server (for tests)
    #[cfg(test)]
    pub fn into_test_server(self) -> (axum_test::TestServer, BackgroundServices) {
        let server = axum_test::TestServer::new(self.router.into_make_service()).expect("Failed to create test server");
        (server, self.bg_services)
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            backend = %self.app_state.backend.base_url(),
            "queuectl listening on http://{}, available at http://localhost:{}",
            bind_addr,
            self.config.port
        );

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("Stopping worker...");
        self.bg_services.shutdown().await;

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}
