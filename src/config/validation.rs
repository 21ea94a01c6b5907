//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (handlers reference catalog entries)
//! - Validate value ranges (timeouts > 0, redirect status codes)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: AppConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::{AppConfig, ProxyRuleConfig, RedirectRuleConfig, StorageDriver};
use crate::pipeline::catalog::HandlerCatalog;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("listener.bind_address '{0}' is not a socket address")]
    InvalidBindAddress(String),

    #[error("observability.metrics_address '{0}' is not a socket address")]
    InvalidMetricsAddress(String),

    #[error("timeouts.request_secs must be greater than 0")]
    ZeroRequestTimeout,

    #[error("cache.dir must be set when cache.storage = \"fs\"")]
    MissingCacheDir,

    #[error("handlers[{index}]: route must start with '/' (got '{route}')")]
    InvalidHandlerRoute { index: usize, route: String },

    #[error("handlers[{index}]: unknown handler '{name}'")]
    UnknownHandler { index: usize, name: String },

    #[error("handlers[{index}]: unknown middleware '{name}'")]
    UnknownMiddleware { index: usize, name: String },

    #[error("route_rules[{index}]: pattern must start with '/' (got '{pattern}')")]
    InvalidRulePattern { index: usize, pattern: String },

    #[error("route_rules[{index}]: {rule} target is empty")]
    MissingTarget { index: usize, rule: &'static str },

    #[error("route_rules[{index}]: proxy target '{target}' is not an http:// URL")]
    InvalidProxyTarget { index: usize, target: String },

    #[error("route_rules[{index}]: redirect status {status} is not a 3xx redirect")]
    InvalidRedirectStatus { index: usize, status: u16 },
}

/// Check `config` against itself and the handler catalog.
pub fn validate_config(config: &AppConfig, catalog: &HandlerCatalog) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidBindAddress(config.listener.bind_address.clone()));
    }
    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidMetricsAddress(
            config.observability.metrics_address.clone(),
        ));
    }
    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::ZeroRequestTimeout);
    }
    if config.cache.storage == StorageDriver::Fs && config.cache.dir.trim().is_empty() {
        errors.push(ValidationError::MissingCacheDir);
    }

    for (index, handler) in config.handlers.iter().enumerate() {
        if !handler.route.starts_with('/') {
            errors.push(ValidationError::InvalidHandlerRoute {
                index,
                route: handler.route.clone(),
            });
        }
        if handler.middleware {
            if !catalog.has_middleware(&handler.handler) {
                errors.push(ValidationError::UnknownMiddleware {
                    index,
                    name: handler.handler.clone(),
                });
            }
        } else if !catalog.has_handler(&handler.handler) {
            errors.push(ValidationError::UnknownHandler {
                index,
                name: handler.handler.clone(),
            });
        }
    }

    for (index, rule) in config.route_rules.iter().enumerate() {
        if !rule.pattern.starts_with('/') {
            errors.push(ValidationError::InvalidRulePattern {
                index,
                pattern: rule.pattern.clone(),
            });
        }
        match &rule.redirect {
            Some(RedirectRuleConfig::To(to)) if to.trim().is_empty() => {
                errors.push(ValidationError::MissingTarget { index, rule: "redirect" });
            }
            Some(RedirectRuleConfig::Full { to, status }) => {
                if to.trim().is_empty() {
                    errors.push(ValidationError::MissingTarget { index, rule: "redirect" });
                }
                if let Some(status) = status {
                    if !(300..=308).contains(status) {
                        errors.push(ValidationError::InvalidRedirectStatus { index, status: *status });
                    }
                }
            }
            _ => {}
        }
        if let Some(ProxyRuleConfig::To(to) | ProxyRuleConfig::Full { to }) = &rule.proxy {
            if to.trim().is_empty() {
                errors.push(ValidationError::MissingTarget { index, rule: "proxy" });
            } else if !is_http_url(to) {
                errors.push(ValidationError::InvalidProxyTarget {
                    index,
                    target: to.clone(),
                });
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Upstreams are reached over plain HTTP only.
fn is_http_url(target: &str) -> bool {
    url::Url::parse(target)
        .map(|url| url.scheme() == "http" && url.host().is_some())
        .unwrap_or(false)
}
