//! Turns resolved rules into middleware.
//!
//! # Responsibilities
//! - Map rule names to `PolicyFactory` implementations
//! - Build the per-request policy chain in a fixed order
//! - Provide the built-in `headers`, `redirect`, `proxy` and `cache` policies
//! - Memoize cache wrappers per rule pattern and handler route
//!
//! # Design Decisions
//! - Built-ins run as headers → redirect → proxy → cache, custom rules after
//! - A rule without a registered factory is carried but has no effect
//! - Cache wrappers live in a `HandlerCacheRegistry` owned by the pipeline,
//!   so two pipelines never share pending computations

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::header::{self, HeaderName, HeaderValue};
use axum::http::{Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use futures_util::FutureExt;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::cache::engine::CacheOptions;
use crate::cache::handler::CachedHandler;
use crate::cache::storage::{MemoryStorage, Storage};
use crate::cache::types::{ErrorHook, TracingErrorHook};
use crate::http::handler::{HandlerError, HandlerFuture, Middleware, Next};
use crate::rules::policy::{HeadersPolicy, Policy, ProxyPolicy, RedirectPolicy, Rule};
use crate::rules::resolver::ResolvedRules;

/// Upstream client used by proxy rules.
pub type ProxyClient = Client<HttpConnector, Body>;

/// Memoized cache wrappers keyed by rule pattern, handler route and options.
#[derive(Clone, Default)]
pub struct HandlerCacheRegistry {
    entries: Arc<DashMap<String, CachedHandler>>,
}

impl HandlerCacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_insert_with<F>(&self, key: String, build: F) -> CachedHandler
    where
        F: FnOnce() -> CachedHandler,
    {
        self.entries.entry(key).or_insert_with(build).value().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

/// Shared services policies are built from.
#[derive(Clone)]
pub struct PolicyServices {
    pub storage: Arc<dyn Storage>,
    pub errors: Arc<dyn ErrorHook>,
    pub client: ProxyClient,
    pub cache_defaults: CacheOptions,
    pub handler_caches: HandlerCacheRegistry,
}

impl PolicyServices {
    pub fn new(storage: Arc<dyn Storage>, errors: Arc<dyn ErrorHook>) -> Self {
        Self {
            storage,
            errors,
            client: Client::builder(TokioExecutor::new()).build(HttpConnector::new()),
            cache_defaults: CacheOptions::default(),
            handler_caches: HandlerCacheRegistry::new(),
        }
    }

    pub fn with_cache_defaults(mut self, defaults: CacheOptions) -> Self {
        self.cache_defaults = defaults;
        self
    }
}

impl Default for PolicyServices {
    fn default() -> Self {
        Self::new(Arc::new(MemoryStorage::new()), Arc::new(TracingErrorHook))
    }
}

/// What a factory knows about the request being handled.
pub struct PolicyContext<'a> {
    /// Pattern of the matched handler, if any.
    pub matched_route: Option<&'a str>,
    pub services: &'a PolicyServices,
}

/// Constructs the middleware enforcing one rule.
pub trait PolicyFactory: Send + Sync + 'static {
    fn build(&self, rule: &Rule, ctx: &PolicyContext<'_>) -> Option<Arc<dyn Middleware>>;
}

impl<F> PolicyFactory for F
where
    F: Fn(&Rule, &PolicyContext) -> Option<Arc<dyn Middleware>> + Send + Sync + 'static,
{
    fn build(&self, rule: &Rule, ctx: &PolicyContext<'_>) -> Option<Arc<dyn Middleware>> {
        self(rule, ctx)
    }
}

const BUILTIN_ORDER: [&str; 4] = ["headers", "redirect", "proxy", "cache"];

fn builtin_rank(name: &str) -> usize {
    BUILTIN_ORDER
        .iter()
        .position(|builtin| *builtin == name)
        .unwrap_or(BUILTIN_ORDER.len())
}

/// Rule name → policy factory.
#[derive(Clone, Default)]
pub struct PolicyRegistry {
    factories: BTreeMap<String, Arc<dyn PolicyFactory>>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in policies.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("headers", HeadersFactory);
        registry.register("redirect", RedirectFactory);
        registry.register("proxy", ProxyFactory);
        registry.register("cache", CacheFactory);
        registry
    }

    /// Register (or replace) the factory for `name`.
    pub fn register(&mut self, name: impl Into<String>, factory: impl PolicyFactory) {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Middleware enforcing `rules`, in execution order.
    pub fn build_chain(&self, rules: &ResolvedRules, ctx: &PolicyContext<'_>) -> Vec<Arc<dyn Middleware>> {
        let mut ordered: Vec<&Rule> = rules.iter().collect();
        ordered.sort_by_key(|rule| builtin_rank(&rule.name));

        ordered
            .into_iter()
            .filter_map(|rule| match self.factories.get(&rule.name) {
                Some(factory) => factory.build(rule, ctx),
                None => {
                    tracing::trace!(rule = %rule.name, route = %rule.route, "No policy registered, rule ignored");
                    None
                }
            })
            .collect()
    }
}

/// Strip `base` from the front of `path`, keeping a leading `/`.
fn without_base(path: &str, base: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        return path.to_string();
    }
    match path.strip_prefix(base) {
        Some(rest) if rest.is_empty() => "/".to_string(),
        Some(rest) if rest.starts_with('/') => rest.to_string(),
        Some(rest) if rest.starts_with('?') => format!("/{}", rest),
        _ => path.to_string(),
    }
}

/// Final target URL for a redirect or proxy rule.
///
/// A target ending in `/**` receives the request path, minus the rule's own
/// `/**` prefix. Otherwise only the query string is carried over.
pub fn rewrite_target(to: &str, rule_route: &str, path_and_query: &str) -> String {
    if let Some(prefix) = to.strip_suffix("/**") {
        let rest = match rule_route.strip_suffix("/**") {
            Some(base) => without_base(path_and_query, base),
            None => path_and_query.to_string(),
        };
        let prefix = prefix.trim_end_matches('/');
        return format!("{}{}", prefix, rest);
    }
    match path_and_query.split_once('?') {
        Some((_, query)) if !query.is_empty() => {
            let separator = if to.contains('?') { '&' } else { '?' };
            format!("{}{}{}", to, separator, query)
        }
        _ => to.to_string(),
    }
}

fn path_and_query(req: &Request<Body>) -> String {
    req.uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string())
}

struct HeadersFactory;

impl PolicyFactory for HeadersFactory {
    fn build(&self, rule: &Rule, _ctx: &PolicyContext<'_>) -> Option<Arc<dyn Middleware>> {
        let Policy::Headers(HeadersPolicy { headers }) = &rule.policy else {
            return None;
        };
        let headers: Vec<(HeaderName, HeaderValue)> = headers
            .iter()
            .filter_map(|(name, value)| {
                match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                    (Ok(name), Ok(value)) => Some((name, value)),
                    _ => {
                        tracing::warn!(route = %rule.route, header = %name, "Ignoring invalid header rule");
                        None
                    }
                }
            })
            .collect();
        (!headers.is_empty()).then(|| Arc::new(HeadersMiddleware { headers: Arc::new(headers) }) as Arc<dyn Middleware>)
    }
}

/// Adds rule headers the handler did not set itself.
struct HeadersMiddleware {
    headers: Arc<Vec<(HeaderName, HeaderValue)>>,
}

impl Middleware for HeadersMiddleware {
    fn handle(&self, req: Request<Body>, next: Next) -> HandlerFuture {
        let headers = self.headers.clone();
        async move {
            let mut response = match next.run(req).await {
                Ok(response) => response,
                Err(e) => e.into_response(),
            };
            for (name, value) in headers.iter() {
                if !response.headers().contains_key(name) {
                    response.headers_mut().insert(name.clone(), value.clone());
                }
            }
            Ok(response)
        }
        .boxed()
    }
}

struct RedirectFactory;

impl PolicyFactory for RedirectFactory {
    fn build(&self, rule: &Rule, _ctx: &PolicyContext<'_>) -> Option<Arc<dyn Middleware>> {
        let Policy::Redirect(policy @ RedirectPolicy { to: Some(to), .. }) = &rule.policy else {
            tracing::warn!(route = %rule.route, "Redirect rule without target ignored");
            return None;
        };
        let status = StatusCode::from_u16(policy.status()).unwrap_or(StatusCode::TEMPORARY_REDIRECT);
        Some(Arc::new(RedirectMiddleware {
            to: to.clone(),
            route: policy.base.clone().unwrap_or_else(|| rule.route.clone()),
            status,
        }))
    }
}

/// Answers with a redirect; the handler never runs.
struct RedirectMiddleware {
    to: String,
    route: String,
    status: StatusCode,
}

impl Middleware for RedirectMiddleware {
    fn handle(&self, req: Request<Body>, _next: Next) -> HandlerFuture {
        let target = rewrite_target(&self.to, &self.route, &path_and_query(&req));
        let status = self.status;
        async move {
            tracing::debug!(target = %target, status = %status, "Redirecting");
            Response::builder()
                .status(status)
                .header(header::LOCATION, target)
                .body(Body::empty())
                .map_err(|e| HandlerError::Other(Box::new(e)))
        }
        .boxed()
    }
}

struct ProxyFactory;

impl PolicyFactory for ProxyFactory {
    fn build(&self, rule: &Rule, ctx: &PolicyContext<'_>) -> Option<Arc<dyn Middleware>> {
        let Policy::Proxy(ProxyPolicy { to: Some(to), base }) = &rule.policy else {
            tracing::warn!(route = %rule.route, "Proxy rule without target ignored");
            return None;
        };
        Some(Arc::new(ProxyMiddleware {
            to: to.clone(),
            route: base.clone().unwrap_or_else(|| rule.route.clone()),
            client: ctx.services.client.clone(),
        }))
    }
}

/// Forwards the request upstream; the handler never runs.
struct ProxyMiddleware {
    to: String,
    route: String,
    client: ProxyClient,
}

impl Middleware for ProxyMiddleware {
    fn handle(&self, req: Request<Body>, _next: Next) -> HandlerFuture {
        let target = rewrite_target(&self.to, &self.route, &path_and_query(&req));
        let client = self.client.clone();
        async move {
            let uri: Uri = target
                .parse()
                .map_err(|e| HandlerError::Upstream(format!("invalid proxy target '{}': {}", target, e)))?;

            let (mut parts, body) = req.into_parts();
            parts.uri = uri;
            parts.headers.remove(header::HOST);
            tracing::debug!(target = %target, method = %parts.method, "Proxying request");

            let response = client
                .request(Request::from_parts(parts, body))
                .await
                .map_err(|e| HandlerError::Upstream(e.to_string()))?;
            let (parts, body) = response.into_parts();
            Ok(Response::from_parts(parts, Body::new(body)))
        }
        .boxed()
    }
}

struct CacheFactory;

impl PolicyFactory for CacheFactory {
    fn build(&self, rule: &Rule, ctx: &PolicyContext<'_>) -> Option<Arc<dyn Middleware>> {
        let Policy::Cache(policy) = &rule.policy else {
            return None;
        };
        // Nothing to cache without a handler.
        let matched = ctx.matched_route?;
        let services = ctx.services;

        let options = policy.to_options(&services.cache_defaults);
        let key = format!(
            "{}|{}|{}",
            rule.route,
            matched,
            serde_json::to_string(policy).unwrap_or_default()
        );
        let handler = services.handler_caches.get_or_insert_with(key, || {
            tracing::debug!(route = %rule.route, handler = %matched, "Creating route cache");
            CachedHandler::new(
                options,
                policy.varies.clone().unwrap_or_default(),
                services.storage.clone(),
                services.errors.clone(),
            )
        });
        Some(Arc::new(handler))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::handler::{handler_fn, middleware_fn};
    use crate::rules::policy::CachePolicy;

    fn rule(name: &str, route: &str, policy: Policy) -> Rule {
        Rule {
            name: name.into(),
            policy,
            route: route.into(),
        }
    }

    fn ok_endpoint() -> Arc<dyn crate::http::handler::RequestHandler> {
        handler_fn(|_req| async { Ok(([(header::CONTENT_TYPE, "text/plain")], "ok").into_response()) })
    }

    #[test]
    fn test_rewrite_target() {
        assert_eq!(
            rewrite_target("https://new.example.com/**", "/old/**", "/old/a/b?x=1"),
            "https://new.example.com/a/b?x=1"
        );
        assert_eq!(rewrite_target("https://new.example.com/**", "/old/**", "/old"), "https://new.example.com/");
        assert_eq!(rewrite_target("/v2/**", "/api/:id", "/api/7"), "/v2/api/7");
        assert_eq!(rewrite_target("/login", "/admin", "/admin?next=1"), "/login?next=1");
        assert_eq!(rewrite_target("/login?a=1", "/admin", "/admin?next=1"), "/login?a=1&next=1");
        assert_eq!(rewrite_target("/login", "/admin", "/admin"), "/login");
    }

    #[test]
    fn test_chain_order_is_fixed() {
        let registry = PolicyRegistry::with_builtins();
        let services = PolicyServices::default();
        let ctx = PolicyContext {
            matched_route: Some("/api/:id"),
            services: &services,
        };
        let rules = ResolvedRules {
            rules: vec![
                rule("cache", "/api/**", Policy::Cache(CachePolicy::default())),
                rule("unknown", "/api/**", Policy::Custom(serde_json::json!(1))),
                rule(
                    "headers",
                    "/api/**",
                    Policy::Headers(HeadersPolicy {
                        headers: BTreeMap::from([("x-a".into(), "1".into())]),
                    }),
                ),
            ],
        };
        assert_eq!(registry.build_chain(&rules, &ctx).len(), 2);
        assert_eq!(services.handler_caches.len(), 1);

        // Same rule and handler reuse the memoized cache.
        registry.build_chain(&rules, &ctx);
        assert_eq!(services.handler_caches.len(), 1);

        let no_handler = PolicyContext {
            matched_route: None,
            services: &services,
        };
        assert_eq!(registry.build_chain(&rules, &no_handler).len(), 1);
    }

    #[tokio::test]
    async fn test_headers_do_not_override_handler() {
        let registry = PolicyRegistry::with_builtins();
        let services = PolicyServices::default();
        let ctx = PolicyContext {
            matched_route: None,
            services: &services,
        };
        let rules = ResolvedRules {
            rules: vec![rule(
                "headers",
                "/**",
                Policy::Headers(HeadersPolicy {
                    headers: BTreeMap::from([
                        ("content-type".into(), "application/json".into()),
                        ("x-frame-options".into(), "DENY".into()),
                    ]),
                }),
            )],
        };
        let chain = registry.build_chain(&rules, &ctx);
        let response = Next::new(chain, ok_endpoint())
            .run(Request::new(Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
        assert_eq!(response.headers()["x-frame-options"], "DENY");
    }

    #[tokio::test]
    async fn test_headers_apply_to_errors() {
        let registry = PolicyRegistry::with_builtins();
        let services = PolicyServices::default();
        let ctx = PolicyContext {
            matched_route: None,
            services: &services,
        };
        let rules = ResolvedRules {
            rules: vec![rule(
                "headers",
                "/**",
                Policy::Headers(HeadersPolicy {
                    headers: BTreeMap::from([("x-served-by".into(), "edge".into())]),
                }),
            )],
        };
        let failing = handler_fn(|_req| async { Err(HandlerError::not_found()) });
        let response = Next::new(registry.build_chain(&rules, &ctx), failing)
            .run(Request::new(Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()["x-served-by"], "edge");
    }

    #[tokio::test]
    async fn test_redirect_short_circuits() {
        let registry = PolicyRegistry::with_builtins();
        let services = PolicyServices::default();
        let ctx = PolicyContext {
            matched_route: Some("/**"),
            services: &services,
        };
        let rules = ResolvedRules {
            rules: vec![rule(
                "redirect",
                "/old/**",
                Policy::Redirect(RedirectPolicy {
                    to: Some("/new/**".into()),
                    status: Some(301),
                    base: None,
                }),
            )],
        };
        let req = Request::builder().uri("/old/page?q=1").body(Body::empty()).unwrap();
        let response = Next::new(registry.build_chain(&rules, &ctx), ok_endpoint())
            .run(req)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()[header::LOCATION], "/new/page?q=1");
    }

    #[tokio::test]
    async fn test_inherited_redirect_target_strips_its_own_base() {
        let resolver = crate::rules::RuleResolver::new(vec![
            crate::rules::RuleBundle::new("/a/**").with(
                "redirect",
                Policy::Redirect(RedirectPolicy {
                    to: Some("/x/**".into()),
                    ..Default::default()
                }),
            ),
            crate::rules::RuleBundle::new("/a/b/**").with(
                "redirect",
                Policy::Redirect(RedirectPolicy {
                    status: Some(301),
                    ..Default::default()
                }),
            ),
        ]);
        let rules = resolver.resolve("/a/b/c");
        assert_eq!(rules.get("redirect").map(|r| r.route.as_str()), Some("/a/b/**"));

        let registry = PolicyRegistry::with_builtins();
        let services = PolicyServices::default();
        let ctx = PolicyContext {
            matched_route: None,
            services: &services,
        };
        let req = Request::builder().uri("/a/b/c").body(Body::empty()).unwrap();
        let response = Next::new(registry.build_chain(&rules, &ctx), ok_endpoint())
            .run(req)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()[header::LOCATION], "/x/b/c");
    }

    #[tokio::test]
    async fn test_custom_factory_registration() {
        let mut registry = PolicyRegistry::with_builtins();
        registry.register("teapot", |_rule: &Rule, _ctx: &PolicyContext| {
            Some(middleware_fn(|_req, _next| async {
                Err(HandlerError::status(StatusCode::IM_A_TEAPOT, "short and stout"))
            }))
        });
        assert!(registry.contains("teapot"));

        let services = PolicyServices::default();
        let ctx = PolicyContext {
            matched_route: None,
            services: &services,
        };
        let rules = ResolvedRules {
            rules: vec![rule("teapot", "/**", Policy::Custom(serde_json::Value::Null))],
        };
        let err = Next::new(registry.build_chain(&rules, &ctx), ok_endpoint())
            .run(Request::new(Body::empty()))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::IM_A_TEAPOT);
    }
}
