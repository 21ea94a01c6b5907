//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.
//!
//! Route rules accept shorthand forms that are normalized into typed
//! policies by [`RouteRuleConfig::to_bundle`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::engine::CacheOptions;
use crate::rules::policy::{
    CachePolicy, HeadersPolicy, Policy, ProxyPolicy, RedirectPolicy, RuleBundle,
};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Cache storage and defaults.
    pub cache: CacheConfig,

    /// Handler and middleware registrations.
    pub handlers: Vec<HandlerConfig>,

    /// Declarative rules per path pattern.
    pub route_rules: Vec<RouteRuleConfig>,
}

impl AppConfig {
    /// Every rule bundle, in declaration order.
    pub fn rule_bundles(&self) -> Vec<RuleBundle> {
        self.route_rules.iter().map(RouteRuleConfig::to_bundle).collect()
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Total request timeout in seconds.
    pub request_secs: u64,

    /// Time allowed for background cache work after shutdown starts.
    pub drain_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_secs: 30,
            drain_secs: 10,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable Prometheus metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageDriver {
    #[default]
    Memory,
    Fs,
}

/// Cache storage and defaults for route caches.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Key prefix for every entry.
    pub base: String,

    pub storage: StorageDriver,

    /// Directory for the `fs` driver.
    pub dir: String,

    /// Default freshness in seconds for cache rules that set none.
    pub max_age: u64,

    /// Default stale-while-revalidate for cache rules that set none.
    pub swr: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            base: "/cache".to_string(),
            storage: StorageDriver::Memory,
            dir: ".cache".to_string(),
            max_age: 1,
            swr: true,
        }
    }
}

impl CacheConfig {
    /// Engine defaults derived from this section.
    pub fn defaults(&self) -> CacheOptions {
        CacheOptions {
            base: self.base.clone(),
            max_age: self.max_age,
            swr: self.swr,
            ..CacheOptions::default()
        }
    }
}

/// A handler or routed middleware registration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct HandlerConfig {
    /// Path pattern.
    pub route: String,

    /// HTTP method; empty matches any.
    pub method: String,

    /// Name in the handler catalog.
    pub handler: String,

    /// Construct on first request instead of at load.
    pub lazy: bool,

    /// Register as routed middleware rather than an endpoint.
    pub middleware: bool,
}

/// `redirect = "/to"` or `redirect = { to = "/to", status = 301 }`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum RedirectRuleConfig {
    To(String),
    Full { to: String, status: Option<u16> },
}

/// `proxy = "http://upstream"` or `proxy = { to = "http://upstream" }`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ProxyRuleConfig {
    To(String),
    Full { to: String },
}

/// `swr = true` or `swr = <max age seconds>`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SwrRuleConfig {
    Enabled(bool),
    MaxAge(u64),
}

/// `cache = false` or `cache = { max_age = 60, ... }`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CacheRuleConfig {
    Enabled(bool),
    Options(CachePolicy),
}

/// Headers added by `cors = true`. Explicit headers take precedence.
pub const CORS_HEADERS: [(&str, &str); 4] = [
    ("access-control-allow-origin", "*"),
    ("access-control-allow-methods", "*"),
    ("access-control-allow-headers", "*"),
    ("access-control-max-age", "0"),
];

/// Rules declared for one path pattern.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RouteRuleConfig {
    pub pattern: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect: Option<RedirectRuleConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyRuleConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cors: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub swr: Option<SwrRuleConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheRuleConfig>,

    /// Any other key becomes a custom rule of the same name.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl RouteRuleConfig {
    /// Normalize shorthands into a typed bundle.
    pub fn to_bundle(&self) -> RuleBundle {
        let mut bundle = RuleBundle::new(self.pattern.clone());

        let mut headers = BTreeMap::new();
        if self.cors == Some(true) {
            for (name, value) in CORS_HEADERS {
                headers.insert(name.to_string(), value.to_string());
            }
        }
        if let Some(explicit) = &self.headers {
            for (name, value) in explicit {
                headers.insert(name.to_ascii_lowercase(), value.clone());
            }
        }
        if !headers.is_empty() {
            bundle = bundle.with("headers", Policy::Headers(HeadersPolicy { headers }));
        }

        if let Some(redirect) = &self.redirect {
            let (to, status) = match redirect {
                RedirectRuleConfig::To(to) => (to.clone(), None),
                RedirectRuleConfig::Full { to, status } => (to.clone(), *status),
            };
            bundle = bundle.with(
                "redirect",
                Policy::Redirect(RedirectPolicy {
                    to: Some(to),
                    status: Some(status.unwrap_or(RedirectPolicy::DEFAULT_STATUS)),
                    base: None,
                }),
            );
        }

        if let Some(proxy) = &self.proxy {
            let to = match proxy {
                ProxyRuleConfig::To(to) | ProxyRuleConfig::Full { to } => to.clone(),
            };
            bundle = bundle.with("proxy", Policy::Proxy(ProxyPolicy { to: Some(to), base: None }));
        }

        if let Some(cache) = self.cache_policy() {
            bundle = bundle.with("cache", cache);
        }

        for (name, value) in &self.extra {
            bundle = bundle.with(name.clone(), Policy::Custom(value.clone()));
        }

        bundle
    }

    fn cache_policy(&self) -> Option<Policy> {
        if matches!(self.cache, Some(CacheRuleConfig::Enabled(false))) {
            return Some(Policy::CacheDisabled);
        }

        let mut policy = match &self.cache {
            Some(CacheRuleConfig::Options(options)) => Some(options.clone()),
            Some(CacheRuleConfig::Enabled(true)) => Some(CachePolicy::default()),
            _ => None,
        };

        match self.swr {
            Some(SwrRuleConfig::Enabled(true)) => {
                policy.get_or_insert_with(CachePolicy::default).swr = Some(true);
            }
            Some(SwrRuleConfig::MaxAge(max_age)) => {
                let policy = policy.get_or_insert_with(CachePolicy::default);
                policy.swr = Some(true);
                policy.max_age = Some(max_age);
            }
            Some(SwrRuleConfig::Enabled(false)) | None => {}
        }

        policy.map(Policy::Cache)
    }
}
