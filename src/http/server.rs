//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum router that feeds every request to the pipeline
//! - Wire up middleware (request ID, tracing, timeout)
//! - Bind server to listener with graceful shutdown
//! - Drain deferred cache work before exiting
//! - Apply reloaded configuration to the live pipeline

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    response::Response,
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::cache::types::{DeferredTasks, WaitUntilHandle};
use crate::config::schema::{AppConfig, TimeoutConfig};
use crate::http::request::{propagate_request_id_layer, request_id, set_request_id_layer};
use crate::lifecycle::Shutdown;
use crate::pipeline::{HandlerCatalog, Pipeline, Registration};

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub deferred: Arc<DeferredTasks>,
}

/// HTTP server in front of a [`Pipeline`].
pub struct HttpServer {
    router: Router,
    timeouts: TimeoutConfig,
    state: AppState,
}

impl HttpServer {
    pub fn new(config: &AppConfig, pipeline: Arc<Pipeline>) -> Self {
        let state = AppState {
            pipeline,
            deferred: Arc::new(DeferredTasks::new()),
        };
        let router = Self::build_router(&config.timeouts, state.clone());
        Self {
            router,
            timeouts: config.timeouts.clone(),
            state,
        }
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(timeouts: &TimeoutConfig, state: AppState) -> Router {
        Router::new()
            .fallback(dispatch)
            .with_state(state)
            .layer(TimeoutLayer::new(Duration::from_secs(timeouts.request_secs)))
            .layer(propagate_request_id_layer())
            .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                tracing::info_span!(
                    "request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = %request_id(request),
                )
            }))
            .layer(set_request_id_layer())
    }

    /// The Axum router, for serving without a listener.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.state.pipeline
    }

    /// Background cache work started by requests.
    pub fn deferred(&self) -> &Arc<DeferredTasks> {
        &self.state.deferred
    }

    /// Run the server until `shutdown` triggers, then drain deferred work.
    pub async fn run(self, listener: TcpListener, shutdown: Shutdown) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move { shutdown.wait().await })
            .await?;

        let pending = self.state.deferred.pending();
        let drain = Duration::from_secs(self.timeouts.drain_secs);
        if tokio::time::timeout(drain, self.state.deferred.flush()).await.is_err() {
            tracing::warn!(pending, drain_secs = self.timeouts.drain_secs, "Deferred cache work abandoned");
        }

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Hand every request to the pipeline, with deferred completion wired in.
async fn dispatch(State(state): State<AppState>, mut request: Request<Body>) -> Response {
    request
        .extensions_mut()
        .insert(WaitUntilHandle(state.deferred.clone()));
    state.pipeline.handle(request).await
}

/// Apply every configuration received on `updates` to `pipeline`.
///
/// Storage and cache defaults are fixed at startup; reloads replace
/// handlers, middleware and route rules.
pub fn spawn_reloader(
    pipeline: Arc<Pipeline>,
    catalog: Arc<HandlerCatalog>,
    mut updates: mpsc::UnboundedReceiver<AppConfig>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(config) = updates.recv().await {
            match Registration::from_config(&config, &catalog) {
                Ok(registration) => {
                    pipeline.update(registration);
                    tracing::info!("Configuration reloaded");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to apply reloaded config, keeping current routes");
                }
            }
        }
    })
}
