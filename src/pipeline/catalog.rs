//! Named handler and middleware factories referenced from config.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use axum::http::{HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use futures_util::FutureExt;
use serde_json::json;

use crate::cache::entry::now_ms;
use crate::http::handler::{
    handler_fn, HandlerFuture, HandlerRef, MatchedRoute, Middleware, Next, RequestHandler,
    RouteParams,
};

type HandlerFactory = Arc<dyn Fn() -> Arc<dyn RequestHandler> + Send + Sync>;
type MiddlewareFactory = Arc<dyn Fn() -> Arc<dyn Middleware> + Send + Sync>;

/// Handlers and middleware a config file can name.
#[derive(Clone, Default)]
pub struct HandlerCatalog {
    handlers: BTreeMap<String, HandlerFactory>,
    middleware: BTreeMap<String, MiddlewareFactory>,
}

impl HandlerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with the built-in `echo`, `health` and `time` handlers and the
    /// `timing` middleware.
    pub fn with_builtins() -> Self {
        let mut catalog = Self::new();
        catalog.register_handler("echo", echo);
        catalog.register_handler("health", health);
        catalog.register_handler("time", time);
        catalog.register_middleware("timing", || Arc::new(Timing) as Arc<dyn Middleware>);
        catalog
    }

    pub fn register_handler<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn RequestHandler> + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(factory));
    }

    pub fn register_middleware<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn Middleware> + Send + Sync + 'static,
    {
        self.middleware.insert(name.into(), Arc::new(factory));
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn has_middleware(&self, name: &str) -> bool {
        self.middleware.contains_key(name)
    }

    pub fn handler_names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Instantiate handler `name`, deferring construction when `lazy`.
    pub fn handler(&self, name: &str, lazy: bool) -> Option<HandlerRef> {
        let factory = self.handlers.get(name)?.clone();
        if lazy {
            Some(HandlerRef::lazy(move || factory()))
        } else {
            Some(HandlerRef::Eager(factory()))
        }
    }

    pub fn middleware(&self, name: &str) -> Option<Arc<dyn Middleware>> {
        self.middleware.get(name).map(|factory| factory())
    }
}

/// Describes the request back to the caller.
fn echo() -> Arc<dyn RequestHandler> {
    handler_fn(|req| async move {
        let params = req
            .extensions()
            .get::<RouteParams>()
            .map(|p| p.0.clone())
            .unwrap_or_default();
        let route = req.extensions().get::<MatchedRoute>().map(|m| m.0.clone());
        Ok(Json(json!({
            "method": req.method().as_str(),
            "path": req.uri().path(),
            "query": req.uri().query(),
            "route": route,
            "params": params,
        }))
        .into_response())
    })
}

fn health() -> Arc<dyn RequestHandler> {
    handler_fn(|_req| async { Ok((StatusCode::OK, Json(json!({"status": "ok"}))).into_response()) })
}

/// Current server time; handy for observing cache behaviour.
fn time() -> Arc<dyn RequestHandler> {
    handler_fn(|_req| async { Ok(Json(json!({"time": now_ms()})).into_response()) })
}

/// Adds `server-timing` with the time spent below this middleware.
struct Timing;

impl Middleware for Timing {
    fn handle(&self, req: axum::http::Request<axum::body::Body>, next: Next) -> HandlerFuture {
        async move {
            let start = Instant::now();
            let mut response = next.run(req).await?;
            let value = format!("app;dur={:.3}", start.elapsed().as_secs_f64() * 1000.0);
            if let Ok(value) = HeaderValue::from_str(&value) {
                response.headers_mut().append("server-timing", value);
            }
            Ok(response)
        }
        .boxed()
    }
}
