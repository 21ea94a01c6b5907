//! Request handler and middleware abstractions.
//!
//! # Responsibilities
//! - Define the `RequestHandler` contract dispatched to by the pipeline
//! - Define `Middleware` and the `Next` continuation used to chain them
//! - Support lazily constructed handlers
//! - Map handler failures to HTTP responses
//!
//! # Design Decisions
//! - Handlers return boxed `'static` futures so they can be stored as trait
//!   objects and shared behind `Arc`
//! - A middleware that does not call `next` short-circuits the chain

use std::future::Future;
use std::sync::{Arc, OnceLock};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use thiserror::Error;

use crate::routing::Params;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Future returned by handlers and middleware.
pub type HandlerFuture = BoxFuture<'static, Result<Response, HandlerError>>;

/// Errors produced while handling a request.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// An HTTP error with an explicit status.
    #[error("{message}")]
    Status { status: StatusCode, message: String },

    /// Forwarding to an upstream failed.
    #[error("Upstream request failed: {0}")]
    Upstream(String),

    /// An error shared between several waiters (e.g. a cached computation).
    #[error(transparent)]
    Shared(Arc<dyn std::error::Error + Send + Sync>),

    #[error(transparent)]
    Other(#[from] BoxError),
}

impl HandlerError {
    pub fn status(status: StatusCode, message: impl Into<String>) -> Self {
        HandlerError::Status {
            status,
            message: message.into(),
        }
    }

    pub fn not_found() -> Self {
        Self::status(StatusCode::NOT_FOUND, "No matching route found")
    }

    /// The HTTP status this error maps to.
    pub fn status_code(&self) -> StatusCode {
        match self {
            HandlerError::Status { status, .. } => *status,
            HandlerError::Upstream(_) => StatusCode::BAD_GATEWAY,
            HandlerError::Shared(inner) => inner
                .downcast_ref::<HandlerError>()
                .map(HandlerError::status_code)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            HandlerError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(status = %status, error = %self, "Request failed");
        }
        (status, self.to_string()).into_response()
    }
}

/// Something that turns a request into a response.
pub trait RequestHandler: Send + Sync + 'static {
    fn call(&self, req: Request<Body>) -> HandlerFuture;
}

/// Something that wraps the rest of the chain.
pub trait Middleware: Send + Sync + 'static {
    fn handle(&self, req: Request<Body>, next: Next) -> HandlerFuture;
}

struct HandlerFn<F>(F);

impl<F, Fut> RequestHandler for HandlerFn<F>
where
    F: Fn(Request<Body>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
{
    fn call(&self, req: Request<Body>) -> HandlerFuture {
        (self.0)(req).boxed()
    }
}

/// Build a handler from an async closure.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn RequestHandler>
where
    F: Fn(Request<Body>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
{
    Arc::new(HandlerFn(f))
}

struct MiddlewareFn<F>(F);

impl<F, Fut> Middleware for MiddlewareFn<F>
where
    F: Fn(Request<Body>, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
{
    fn handle(&self, req: Request<Body>, next: Next) -> HandlerFuture {
        (self.0)(req, next).boxed()
    }
}

/// Build a middleware from an async closure.
pub fn middleware_fn<F, Fut>(f: F) -> Arc<dyn Middleware>
where
    F: Fn(Request<Body>, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
{
    Arc::new(MiddlewareFn(f))
}

/// The remainder of a middleware chain.
#[derive(Clone)]
pub struct Next {
    chain: Arc<[Arc<dyn Middleware>]>,
    position: usize,
    endpoint: Arc<dyn RequestHandler>,
}

impl Next {
    pub fn new(chain: Vec<Arc<dyn Middleware>>, endpoint: Arc<dyn RequestHandler>) -> Self {
        Self {
            chain: chain.into(),
            position: 0,
            endpoint,
        }
    }

    /// Run the next middleware, or the endpoint once the chain is exhausted.
    pub fn run(self, req: Request<Body>) -> HandlerFuture {
        match self.chain.get(self.position).cloned() {
            Some(middleware) => {
                let next = Next {
                    position: self.position + 1,
                    ..self
                };
                middleware.handle(req, next)
            }
            None => self.endpoint.call(req),
        }
    }
}

type HandlerFactory = Arc<dyn Fn() -> Arc<dyn RequestHandler> + Send + Sync>;

/// A handler constructed on first use.
pub struct LazyHandler {
    factory: HandlerFactory,
    resolved: OnceLock<Arc<dyn RequestHandler>>,
}

impl LazyHandler {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Arc<dyn RequestHandler> + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
            resolved: OnceLock::new(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.get().is_some()
    }

    fn resolve(&self) -> &Arc<dyn RequestHandler> {
        self.resolved.get_or_init(|| {
            tracing::debug!("Constructing lazy handler");
            (self.factory)()
        })
    }
}

impl RequestHandler for LazyHandler {
    fn call(&self, req: Request<Body>) -> HandlerFuture {
        self.resolve().call(req)
    }
}

/// A registered handler, constructed eagerly or on first request.
#[derive(Clone)]
pub enum HandlerRef {
    Eager(Arc<dyn RequestHandler>),
    Lazy(Arc<LazyHandler>),
}

impl HandlerRef {
    pub fn lazy<F>(factory: F) -> Self
    where
        F: Fn() -> Arc<dyn RequestHandler> + Send + Sync + 'static,
    {
        HandlerRef::Lazy(Arc::new(LazyHandler::new(factory)))
    }

    pub fn is_lazy(&self) -> bool {
        matches!(self, HandlerRef::Lazy(_))
    }

    pub fn as_handler(&self) -> Arc<dyn RequestHandler> {
        match self {
            HandlerRef::Eager(handler) => handler.clone(),
            HandlerRef::Lazy(lazy) => lazy.clone(),
        }
    }
}

impl From<Arc<dyn RequestHandler>> for HandlerRef {
    fn from(handler: Arc<dyn RequestHandler>) -> Self {
        HandlerRef::Eager(handler)
    }
}

/// Route params of the matched handler, stored in request extensions.
#[derive(Debug, Clone, Default)]
pub struct RouteParams(pub Params);

/// Pattern of the matched handler route, stored in request extensions.
#[derive(Debug, Clone)]
pub struct MatchedRoute(pub String);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn text(body: &'static str) -> Arc<dyn RequestHandler> {
        handler_fn(move |_req| async move { Ok(body.into_response()) })
    }

    #[tokio::test]
    async fn test_chain_runs_in_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let make = |label: &'static str| {
            let order = order.clone();
            middleware_fn(move |req, next: Next| {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push(label);
                    next.run(req).await
                }
            })
        };

        let next = Next::new(vec![make("first"), make("second")], text("done"));
        let response = next.run(Request::new(Body::empty())).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_middleware_can_short_circuit() {
        let stop = middleware_fn(|_req, _next| async move {
            Err(HandlerError::status(StatusCode::FORBIDDEN, "nope"))
        });
        let next = Next::new(vec![stop], text("unreachable"));
        let err = next.run(Request::new(Body::empty())).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_lazy_handler_constructed_once() {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = built.clone();
        let handler = HandlerRef::lazy(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            text("lazy")
        });
        assert!(handler.is_lazy());
        assert_eq!(built.load(Ordering::SeqCst), 0);

        for _ in 0..3 {
            handler.as_handler().call(Request::new(Body::empty())).await.unwrap();
        }
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shared_error_keeps_inner_status() {
        let inner: Arc<dyn std::error::Error + Send + Sync> =
            Arc::new(HandlerError::status(StatusCode::IM_A_TEAPOT, "teapot"));
        let err = HandlerError::Shared(inner);
        assert_eq!(err.status_code(), StatusCode::IM_A_TEAPOT);
        assert_eq!(err.to_string(), "teapot");
    }
}
