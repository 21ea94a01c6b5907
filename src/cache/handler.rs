//! Response caching around request handlers.
//!
//! # Responsibilities
//! - Derive a cache key from the request path, full URL and varying headers
//! - Materialize a downstream response into a storable `CachedResponse`
//! - Answer conditional requests with `304 Not Modified`
//! - Replay cached responses (HEAD without body)
//!
//! # Design Decisions
//! - Only GET and HEAD are cached; HEAD shares the GET entry
//! - Bodies are stored as UTF-8 text; a binary body is treated as missing,
//!   which fails validation so it is served but never persisted
//! - `set-cookie` is never stored

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::SystemTime;

use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::request::Parts;
use axum::http::{Method, Request, StatusCode};
use axum::response::Response;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};

use crate::cache::engine::{CacheOptions, CachedFunction};
use crate::cache::hash::{escape_key, etag, hash};
use crate::cache::storage::Storage;
use crate::cache::types::{CacheContext, CacheError, ErrorHook, WaitUntilHandle};
use crate::http::handler::{HandlerError, HandlerFuture, Middleware, Next, RequestHandler};
use crate::observability::metrics;

/// A response as it is persisted in the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub code: u16,
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl CachedResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Whether this response may be persisted.
    pub fn is_cacheable(&self) -> bool {
        self.code < 400
            && self.body.is_some()
            && self.header("etag") != Some("undefined")
            && self.header("last-modified") != Some("undefined")
    }
}

impl From<CacheError> for HandlerError {
    fn from(error: CacheError) -> Self {
        match error {
            CacheError::Compute(inner) => HandlerError::Shared(inner),
            other => HandlerError::Shared(Arc::new(other)),
        }
    }
}

type KeyFn = Arc<dyn Fn(&Parts) -> String + Send + Sync>;
type BypassFn = Arc<dyn Fn(&Parts) -> bool + Send + Sync>;

/// Freshness settings advertised through `cache-control`.
#[derive(Debug, Clone, Copy)]
struct Freshness {
    max_age: u64,
    stale_max_age: Option<u64>,
    swr: bool,
}

impl Freshness {
    fn cache_control(&self) -> Option<String> {
        let mut directives = Vec::new();
        if self.swr {
            if self.max_age > 0 {
                directives.push(format!("s-maxage={}", self.max_age));
            }
            match self.stale_max_age {
                Some(stale) => directives.push(format!("stale-while-revalidate={}", stale)),
                None => directives.push("stale-while-revalidate".to_string()),
            }
        } else if self.max_age > 0 {
            directives.push(format!("max-age={}", self.max_age));
        }
        (!directives.is_empty()).then(|| directives.join(", "))
    }
}

/// Caches the responses of a downstream handler.
#[derive(Clone)]
pub struct CachedHandler {
    function: Arc<CachedFunction<CachedResponse>>,
    freshness: Freshness,
    varies: Vec<String>,
    key_fn: Option<KeyFn>,
    should_bypass: Option<BypassFn>,
}

impl CachedHandler {
    /// `varies` names request headers whose values partition the cache.
    pub fn new(
        options: CacheOptions,
        varies: Vec<String>,
        storage: Arc<dyn Storage>,
        errors: Arc<dyn ErrorHook>,
    ) -> Self {
        let freshness = Freshness {
            max_age: options.max_age,
            stale_max_age: options.stale_max_age,
            swr: options.swr,
        };
        let mut varies: Vec<String> = varies.into_iter().map(|h| h.to_ascii_lowercase()).collect();
        varies.sort();
        varies.dedup();

        let function = CachedFunction::new(options, storage, errors)
            .with_validator(|entry| entry.value.as_ref().is_some_and(CachedResponse::is_cacheable));

        Self {
            function: Arc::new(function),
            freshness,
            varies,
            key_fn: None,
            should_bypass: None,
        }
    }

    /// Replace the default key derivation.
    pub fn with_key<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&Parts) -> String + Send + Sync + 'static,
    {
        self.key_fn = Some(Arc::new(key_fn));
        self
    }

    /// Skip the cache for requests matching `predicate`.
    pub fn with_bypass<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Parts) -> bool + Send + Sync + 'static,
    {
        self.should_bypass = Some(Arc::new(predicate));
        self
    }

    pub fn options(&self) -> &CacheOptions {
        self.function.options()
    }

    pub fn varies(&self) -> &[String] {
        &self.varies
    }

    /// Cache key for a request.
    pub fn key_for(&self, parts: &Parts) -> String {
        if let Some(key_fn) = &self.key_fn {
            return key_fn(parts);
        }

        let url = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or_else(|| parts.uri.path());
        let mut pathname: String = escape_key(parts.uri.path()).chars().take(16).collect();
        if pathname.is_empty() {
            pathname = "index".to_string();
        }

        let mut key = format!("{}.{}", pathname, hash(url));
        for name in &self.varies {
            let value = parts
                .headers
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            key.push(':');
            key.push_str(&escape_key(name));
            key.push('.');
            key.push_str(&hash(value));
        }
        key
    }

    /// Serve `req` from the cache, calling `downstream` to produce a response
    /// when the cached one is missing or expired.
    pub async fn serve<F, Fut>(&self, req: Request<Body>, downstream: F) -> Result<Response, HandlerError>
    where
        F: FnOnce(Request<Body>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
    {
        let group = self.function.options().group.clone();
        let cacheable_method = req.method() == Method::GET || req.method() == Method::HEAD;
        let (mut parts, body) = req.into_parts();

        let bypass = self.should_bypass.as_ref().is_some_and(|predicate| predicate(&parts));
        if !cacheable_method || bypass {
            tracing::trace!(method = %parts.method, path = %parts.uri.path(), "Cache bypassed");
            metrics::record_cache_lookup(&group, "bypass");
            return downstream(Request::from_parts(parts, body)).await;
        }

        let key = self.key_for(&parts);
        let head = parts.method == Method::HEAD;
        let conditional = Conditional::from_headers(&parts.headers);
        let ctx = parts
            .extensions
            .get::<WaitUntilHandle>()
            .map(|handle| CacheContext::with_wait_until(handle.0.clone()))
            .unwrap_or_default();

        parts.method = Method::GET;
        let req = Request::from_parts(parts, body);
        let freshness = self.freshness;
        let compute = move || async move {
            let response = downstream(req).await?;
            materialize(response, freshness).await
        };

        let entry = self.function.get_or_compute(&key, compute, false, &ctx).await?;
        let cached = entry.value.ok_or_else(|| {
            HandlerError::status(StatusCode::INTERNAL_SERVER_ERROR, "Cached response missing")
        })?;
        render(cached, &conditional, head)
    }

    /// Wrap a handler so every call goes through this cache.
    pub fn wrap(self, handler: Arc<dyn RequestHandler>) -> Arc<dyn RequestHandler> {
        Arc::new(CachedEndpoint {
            cache: self,
            handler,
        })
    }
}

impl Middleware for CachedHandler {
    fn handle(&self, req: Request<Body>, next: Next) -> HandlerFuture {
        let cache = self.clone();
        async move { cache.serve(req, move |req| next.run(req)).await }.boxed()
    }
}

struct CachedEndpoint {
    cache: CachedHandler,
    handler: Arc<dyn RequestHandler>,
}

impl RequestHandler for CachedEndpoint {
    fn call(&self, req: Request<Body>) -> HandlerFuture {
        let cache = self.cache.clone();
        let handler = self.handler.clone();
        async move { cache.serve(req, move |req| handler.call(req)).await }.boxed()
    }
}

async fn materialize(response: Response, freshness: Freshness) -> Result<CachedResponse, HandlerError> {
    let (parts, body) = response.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| HandlerError::Other(Box::new(e)))?;

    let mut headers: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in parts.headers.iter() {
        // Per-user cookies are never replayed from cache.
        if name == header::SET_COOKIE {
            continue;
        }
        let Ok(value) = value.to_str() else {
            continue;
        };
        headers
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    headers
        .entry("etag".to_string())
        .or_insert_with(|| etag(&bytes));
    headers
        .entry("last-modified".to_string())
        .or_insert_with(|| httpdate::fmt_http_date(SystemTime::now()));
    if let Some(cache_control) = freshness.cache_control() {
        headers.insert("cache-control".to_string(), cache_control);
    }

    Ok(CachedResponse {
        code: parts.status.as_u16(),
        headers,
        body: String::from_utf8(bytes.to_vec()).ok(),
    })
}

/// Validators sent by the client.
#[derive(Debug, Default)]
struct Conditional {
    if_none_match: Option<String>,
    if_modified_since: Option<SystemTime>,
}

impl Conditional {
    fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            if_none_match: headers
                .get(header::IF_NONE_MATCH)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            if_modified_since: headers
                .get(header::IF_MODIFIED_SINCE)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| httpdate::parse_http_date(v).ok()),
        }
    }

    fn not_modified(&self, cached: &CachedResponse) -> bool {
        if let (Some(tag), Some(etag)) = (&self.if_none_match, cached.header("etag")) {
            if tag == etag {
                return true;
            }
        }
        let last_modified = cached
            .header("last-modified")
            .and_then(|v| httpdate::parse_http_date(v).ok());
        matches!((self.if_modified_since, last_modified), (Some(since), Some(modified)) if since >= modified)
    }
}

fn render(cached: CachedResponse, conditional: &Conditional, head: bool) -> Result<Response, HandlerError> {
    let not_modified = conditional.not_modified(&cached);
    let status = if not_modified {
        StatusCode::NOT_MODIFIED
    } else {
        StatusCode::from_u16(cached.code).map_err(|e| HandlerError::Other(Box::new(e)))?
    };

    let body = match (&cached.body, head || not_modified) {
        (Some(body), false) => Body::from(body.clone()),
        _ => Body::empty(),
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    let headers = response.headers_mut();
    for (name, value) in &cached.headers {
        if not_modified && !matches!(name.as_str(), "etag" | "last-modified" | "cache-control") {
            continue;
        }
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => tracing::warn!(header = %name, "Skipping unrepresentable cached header"),
        }
    }
    Ok(response)
}
