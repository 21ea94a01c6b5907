//! Request pipeline: handler dispatch, routed middleware and route rules.
//!
//! # Data Flow
//! ```text
//! Registration (startup, config reload, programmatic)
//!     → handlers router (compiled dispatch, single best match)
//!     → middleware router (match-all)
//!     → rule resolver (cascade merge)
//!
//! Incoming Request (method, path):
//!     → handler match → RouteParams / MatchedRoute extensions
//!     → rule resolution → ResolvedRules extension
//!     → chain: global middleware → routed middleware → rule policies
//!     → endpoint (matched handler, or 404)
//!     → Response
//! ```
//!
//! # Design Decisions
//! - Each router swaps its own snapshot; an update is not one atomic trio
//! - Handler errors become responses here, so callers always get a response
//! - Memoized route caches are dropped on every update

pub mod catalog;

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use axum::body::Body;
use axum::http::Request;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::cache::storage::{FsStorage, MemoryStorage, Storage};
use crate::cache::types::TracingErrorHook;
use crate::config::schema::{AppConfig, CacheConfig, StorageDriver};
use crate::http::handler::{
    handler_fn, HandlerError, HandlerRef, MatchedRoute, Middleware, Next, RequestHandler,
    RouteParams,
};
use crate::observability::metrics;
use crate::routing::{Route, RouteMatch, Router};
use crate::rules::{PolicyContext, PolicyRegistry, PolicyServices, ResolvedRules, RuleBundle, RuleResolver};

pub use catalog::HandlerCatalog;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Unknown handler '{name}' for route '{route}'")]
    UnknownHandler { name: String, route: String },

    #[error("Unknown middleware '{name}' for route '{route}'")]
    UnknownMiddleware { name: String, route: String },
}

/// What a registration points at.
#[derive(Clone)]
pub enum HandlerTarget {
    Handler(HandlerRef),
    /// Runs for every request whose path the route covers.
    Middleware(Arc<dyn Middleware>),
}

#[derive(Clone)]
pub struct HandlerRegistration {
    /// HTTP method; empty matches any.
    pub method: String,
    pub route: String,
    pub target: HandlerTarget,
}

impl HandlerRegistration {
    pub fn handler(method: impl Into<String>, route: impl Into<String>, handler: impl Into<HandlerRef>) -> Self {
        Self {
            method: method.into(),
            route: route.into(),
            target: HandlerTarget::Handler(handler.into()),
        }
    }

    pub fn middleware(route: impl Into<String>, middleware: Arc<dyn Middleware>) -> Self {
        Self {
            method: String::new(),
            route: route.into(),
            target: HandlerTarget::Middleware(middleware),
        }
    }
}

/// Everything the pipeline routes to.
#[derive(Clone, Default)]
pub struct Registration {
    pub handlers: Vec<HandlerRegistration>,
    pub rules: Vec<RuleBundle>,
    pub global_middleware: Vec<Arc<dyn Middleware>>,
}

impl Registration {
    /// Build a registration from config, instantiating handlers from `catalog`.
    pub fn from_config(config: &AppConfig, catalog: &HandlerCatalog) -> Result<Self, PipelineError> {
        let mut handlers = Vec::with_capacity(config.handlers.len());
        for entry in &config.handlers {
            let target = if entry.middleware {
                let middleware = catalog.middleware(&entry.handler).ok_or_else(|| {
                    PipelineError::UnknownMiddleware {
                        name: entry.handler.clone(),
                        route: entry.route.clone(),
                    }
                })?;
                HandlerTarget::Middleware(middleware)
            } else {
                let handler = catalog.handler(&entry.handler, entry.lazy).ok_or_else(|| {
                    PipelineError::UnknownHandler {
                        name: entry.handler.clone(),
                        route: entry.route.clone(),
                    }
                })?;
                HandlerTarget::Handler(handler)
            };
            handlers.push(HandlerRegistration {
                method: entry.method.clone(),
                route: entry.route.clone(),
                target,
            });
        }

        Ok(Self {
            handlers,
            rules: config.rule_bundles(),
            global_middleware: Vec::new(),
        })
    }
}

/// Dispatches requests through middleware, route rules and handlers.
pub struct Pipeline {
    handlers: Router<HandlerRef>,
    middleware: Router<Arc<dyn Middleware>>,
    rules: RuleResolver,
    global: ArcSwap<Vec<Arc<dyn Middleware>>>,
    policies: PolicyRegistry,
    services: PolicyServices,
    not_found: Arc<dyn RequestHandler>,
}

impl Pipeline {
    pub fn new(policies: PolicyRegistry, services: PolicyServices) -> Self {
        Self {
            handlers: Router::default(),
            middleware: Router::default(),
            rules: RuleResolver::default(),
            global: ArcSwap::from_pointee(Vec::new()),
            policies,
            services,
            not_found: handler_fn(|_req| async { Err::<Response, _>(HandlerError::not_found()) }),
        }
    }

    /// Pipeline for `config`, with storage and cache defaults taken from its
    /// `[cache]` section.
    pub fn from_config(config: &AppConfig, catalog: &HandlerCatalog) -> Result<Self, PipelineError> {
        let registration = Registration::from_config(config, catalog)?;
        let services = PolicyServices::new(storage_for(&config.cache), Arc::new(TracingErrorHook))
            .with_cache_defaults(config.cache.defaults());
        Ok(Self::with_registration(registration, services))
    }

    /// Pipeline with the built-in policies and `registration` applied.
    pub fn with_registration(registration: Registration, services: PolicyServices) -> Self {
        let pipeline = Self::new(PolicyRegistry::with_builtins(), services);
        pipeline.update(registration);
        pipeline
    }

    pub fn services(&self) -> &PolicyServices {
        &self.services
    }

    /// Replace every handler, middleware and rule.
    pub fn update(&self, registration: Registration) {
        let mut handlers = Vec::new();
        let mut middleware = Vec::new();
        for entry in registration.handlers {
            match entry.target {
                HandlerTarget::Handler(handler) => {
                    handlers.push(Route::new(entry.method, entry.route, handler));
                }
                HandlerTarget::Middleware(mw) => {
                    middleware.push(Route::new(entry.method, entry.route, mw));
                }
            }
        }

        let handler_count = handlers.len();
        let rule_count = registration.rules.len();
        self.handlers.update(handlers);
        self.middleware.update(middleware);
        self.rules.update(registration.rules);
        self.global.store(Arc::new(registration.global_middleware));
        self.services.handler_caches.clear();

        metrics::record_pipeline_update(handler_count, rule_count);
        tracing::info!(
            handlers = handler_count,
            rule_bundles = rule_count,
            "Pipeline updated"
        );
    }

    /// The handler that would serve `method` and `path`.
    pub fn match_handler(&self, method: &str, path: &str) -> Option<RouteMatch<HandlerRef>> {
        self.handlers.snapshot().dispatch(method, path)
    }

    /// Merged route rules for `path`.
    pub fn resolve_rules(&self, path: &str) -> ResolvedRules {
        self.rules.resolve(path)
    }

    /// Source text of the compiled handler matcher.
    pub fn compiled_source(&self) -> String {
        self.handlers.snapshot().compiled().to_source()
    }

    /// Handle one request. Never fails: errors are rendered as responses.
    pub async fn handle(&self, mut req: Request<Body>) -> Response {
        let start = Instant::now();
        let method = req.method().as_str().to_string();
        let path = req.uri().path().to_string();

        let matched = self.match_handler(&method, &path);
        let rules = self.rules.resolve(&path);

        let mut chain: Vec<Arc<dyn Middleware>> = self.global.load().iter().cloned().collect();
        chain.extend(
            self.middleware
                .snapshot()
                .dispatch_all(&method, &path)
                .into_iter()
                .map(|m| m.payload),
        );
        let ctx = PolicyContext {
            matched_route: matched.as_ref().map(|m| m.pattern.as_str()),
            services: &self.services,
        };
        chain.extend(self.policies.build_chain(&rules, &ctx));

        let route_label = matched
            .as_ref()
            .map(|m| m.pattern.clone())
            .unwrap_or_else(|| "none".to_string());
        let endpoint = match matched {
            Some(found) => {
                req.extensions_mut().insert(RouteParams(found.params));
                req.extensions_mut().insert(MatchedRoute(found.pattern));
                found.payload.as_handler()
            }
            None => self.not_found.clone(),
        };
        req.extensions_mut().insert(rules);

        tracing::debug!(method = %method, path = %path, route = %route_label, middleware = chain.len(), "Dispatching request");
        let response = match Next::new(chain, endpoint).run(req).await {
            Ok(response) => response,
            Err(e) => e.into_response(),
        };

        metrics::record_request(&method, response.status().as_u16(), &route_label, start);
        response
    }
}

/// Storage backend selected by the `[cache]` section.
pub fn storage_for(config: &CacheConfig) -> Arc<dyn Storage> {
    match config.storage {
        StorageDriver::Memory => Arc::new(MemoryStorage::new()),
        StorageDriver::Fs => {
            tracing::info!(dir = %config.dir, "Using filesystem cache storage");
            Arc::new(FsStorage::new(&config.dir))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::handler::middleware_fn;
    use crate::rules::{CachePolicy, Policy};
    use axum::http::{header, StatusCode};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn text(body: &'static str) -> HandlerRef {
        HandlerRef::Eager(handler_fn(move |_req| async move { Ok(body.into_response()) }))
    }

    async fn body(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn get(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_dispatches_most_specific_handler() {
        let pipeline = Pipeline::with_registration(
            Registration {
                handlers: vec![
                    HandlerRegistration::handler("", "/api/**", text("catch-all")),
                    HandlerRegistration::handler("GET", "/api/users/:id", text("user")),
                ],
                ..Default::default()
            },
            PolicyServices::default(),
        );

        assert_eq!(body(pipeline.handle(get("/api/users/1")).await).await, "user");
        assert_eq!(body(pipeline.handle(get("/api/other")).await).await, "catch-all");
        assert_eq!(pipeline.handle(get("/elsewhere")).await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_params_reach_handler() {
        let handler = handler_fn(|req| async move {
            let id = req
                .extensions()
                .get::<RouteParams>()
                .and_then(|p| p.0.get("id").map(str::to_string))
                .unwrap_or_default();
            Ok(id.into_response())
        });
        let pipeline = Pipeline::with_registration(
            Registration {
                handlers: vec![HandlerRegistration::handler("GET", "/users/:id", handler)],
                ..Default::default()
            },
            PolicyServices::default(),
        );
        assert_eq!(body(pipeline.handle(get("/users/42")).await).await, "42");
    }

    #[tokio::test]
    async fn test_middleware_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let record = |label: &'static str| {
            let order = order.clone();
            middleware_fn(move |req, next: Next| {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push(label);
                    next.run(req).await
                }
            })
        };

        let pipeline = Pipeline::with_registration(
            Registration {
                handlers: vec![
                    HandlerRegistration::middleware("/api/users/**", record("users")),
                    HandlerRegistration::middleware("/**", record("root")),
                    HandlerRegistration::middleware("/blog/**", record("blog")),
                    HandlerRegistration::handler("", "/api/users/me", text("me")),
                ],
                global_middleware: vec![record("global")],
                ..Default::default()
            },
            PolicyServices::default(),
        );

        pipeline.handle(get("/api/users/me")).await;
        assert_eq!(*order.lock().unwrap(), vec!["global", "root", "users"]);
    }

    #[tokio::test]
    async fn test_cache_rule_wraps_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler = handler_fn(move |_req| {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Ok(format!("call {}", n).into_response())
            }
        });
        let pipeline = Pipeline::with_registration(
            Registration {
                handlers: vec![HandlerRegistration::handler("GET", "/data", handler)],
                rules: vec![RuleBundle::new("/**").with(
                    "cache",
                    Policy::Cache(CachePolicy {
                        max_age: Some(60),
                        ..Default::default()
                    }),
                )],
                ..Default::default()
            },
            PolicyServices::default(),
        );

        let first = pipeline.handle(get("/data")).await;
        assert!(first.headers().contains_key(header::ETAG));
        assert_eq!(body(first).await, "call 0");
        assert_eq!(body(pipeline.handle(get("/data")).await).await, "call 0");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.services().handler_caches.len(), 1);

        // A new registration drops memoized caches, but storage survives.
        pipeline.update(Registration {
            handlers: vec![HandlerRegistration::handler("GET", "/data", text("replaced"))],
            ..Default::default()
        });
        assert!(pipeline.services().handler_caches.is_empty());
        assert_eq!(body(pipeline.handle(get("/data")).await).await, "replaced");
    }

    #[tokio::test]
    async fn test_rules_visible_to_handlers() {
        let handler = handler_fn(|req| async move {
            let names = req
                .extensions()
                .get::<ResolvedRules>()
                .map(|r| r.iter().map(|rule| rule.name.clone()).collect::<Vec<_>>().join(","))
                .unwrap_or_default();
            Ok(names.into_response())
        });
        let pipeline = Pipeline::with_registration(
            Registration {
                handlers: vec![HandlerRegistration::handler("", "/**", handler)],
                rules: vec![RuleBundle::new("/x/**").with("flag", Policy::Custom(serde_json::json!(true)))],
                ..Default::default()
            },
            PolicyServices::default(),
        );
        assert_eq!(body(pipeline.handle(get("/x/y")).await).await, "flag");
    }

    #[test]
    fn test_registration_from_config() {
        let config: AppConfig = toml::from_str(
            r#"
            [[handlers]]
            route = "/time"
            handler = "time"
            lazy = true

            [[handlers]]
            route = "/**"
            handler = "timing"
            middleware = true

            [[route_rules]]
            pattern = "/time"
            swr = 5
            "#,
        )
        .unwrap();
        let catalog = HandlerCatalog::with_builtins();
        let registration = Registration::from_config(&config, &catalog).unwrap();
        assert_eq!(registration.handlers.len(), 2);
        assert!(matches!(&registration.handlers[0].target, HandlerTarget::Handler(h) if h.is_lazy()));
        assert!(matches!(registration.handlers[1].target, HandlerTarget::Middleware(_)));
        assert_eq!(registration.rules.len(), 1);

        let mut broken = config.clone();
        broken.handlers[0].handler = "nope".into();
        assert!(matches!(
            Registration::from_config(&broken, &catalog),
            Err(PipelineError::UnknownHandler { .. })
        ));
    }
}
