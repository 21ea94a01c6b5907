//! Route rule policies and their cascading merge.
//!
//! # Design Decisions
//! - `Policy` is a closed union; anything unknown travels as `Custom` JSON
//! - Merging only fills what the more specific side left unset
//! - Maps are `BTreeMap` so merged output is deterministic

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::engine::CacheOptions;

/// Fill fields that `self` leaves unset from a less specific `other`.
pub trait DeepMerge {
    fn merge_missing(&mut self, other: &Self);
}

impl<T: Clone> DeepMerge for Option<T> {
    fn merge_missing(&mut self, other: &Self) {
        if self.is_none() {
            self.clone_from(other);
        }
    }
}

impl DeepMerge for BTreeMap<String, String> {
    fn merge_missing(&mut self, other: &Self) {
        for (name, value) in other {
            self.entry(name.clone()).or_insert_with(|| value.clone());
        }
    }
}

impl DeepMerge for Value {
    fn merge_missing(&mut self, other: &Self) {
        if let (Value::Object(mine), Value::Object(theirs)) = (&mut *self, other) {
            for (key, value) in theirs {
                match mine.get_mut(key) {
                    Some(existing) => existing.merge_missing(value),
                    None => {
                        mine.insert(key.clone(), value.clone());
                    }
                }
            }
        }
    }
}

/// Response headers added to every matching response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeadersPolicy {
    pub headers: BTreeMap<String, String>,
}

impl DeepMerge for HeadersPolicy {
    fn merge_missing(&mut self, other: &Self) {
        self.headers.merge_missing(&other.headers);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RedirectPolicy {
    /// Target; a trailing `/**` appends the matched remainder of the path.
    pub to: Option<String>,
    pub status: Option<u16>,
    /// Pattern that declared `to`; its `/**` prefix is what gets stripped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
}

impl RedirectPolicy {
    pub const DEFAULT_STATUS: u16 = 307;

    pub fn status(&self) -> u16 {
        self.status.unwrap_or(Self::DEFAULT_STATUS)
    }
}

impl DeepMerge for RedirectPolicy {
    fn merge_missing(&mut self, other: &Self) {
        if self.to.is_none() {
            self.to = other.to.clone();
            self.base = other.base.clone();
        }
        self.status.merge_missing(&other.status);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyPolicy {
    /// Upstream URL; a trailing `/**` appends the matched remainder of the path.
    pub to: Option<String>,
    /// Pattern that declared `to`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
}

impl DeepMerge for ProxyPolicy {
    fn merge_missing(&mut self, other: &Self) {
        if self.to.is_none() {
            self.to = other.to.clone();
            self.base = other.base.clone();
        }
    }
}

/// Response caching options. Unset fields fall back to the cache defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    pub max_age: Option<u64>,
    pub stale_max_age: Option<u64>,
    pub swr: Option<bool>,
    pub varies: Option<Vec<String>>,
    pub name: Option<String>,
    pub group: Option<String>,
    pub base: Option<String>,
    pub integrity: Option<String>,
}

impl CachePolicy {
    /// Default group for route-level caches.
    pub const GROUP: &'static str = "routes";

    /// Resolve into engine options on top of `defaults`.
    pub fn to_options(&self, defaults: &CacheOptions) -> CacheOptions {
        CacheOptions {
            name: self.name.clone().unwrap_or_else(|| defaults.name.clone()),
            group: self.group.clone().unwrap_or_else(|| Self::GROUP.to_string()),
            base: self.base.clone().unwrap_or_else(|| defaults.base.clone()),
            max_age: self.max_age.unwrap_or(defaults.max_age),
            stale_max_age: self.stale_max_age.or(defaults.stale_max_age),
            swr: self.swr.unwrap_or(defaults.swr),
            integrity: self.integrity.clone().or_else(|| defaults.integrity.clone()),
        }
    }
}

impl DeepMerge for CachePolicy {
    fn merge_missing(&mut self, other: &Self) {
        self.max_age.merge_missing(&other.max_age);
        self.stale_max_age.merge_missing(&other.stale_max_age);
        self.swr.merge_missing(&other.swr);
        self.varies.merge_missing(&other.varies);
        self.name.merge_missing(&other.name);
        self.group.merge_missing(&other.group);
        self.base.merge_missing(&other.base);
        self.integrity.merge_missing(&other.integrity);
    }
}

/// A declarative policy attached to a path pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "options", rename_all = "snake_case")]
pub enum Policy {
    Headers(HeadersPolicy),
    Redirect(RedirectPolicy),
    Proxy(ProxyPolicy),
    Cache(CachePolicy),
    /// Caching switched off, overriding any less specific `Cache`.
    CacheDisabled,
    Custom(Value),
}

impl Policy {
    /// Record `pattern` as the base of a redirect or proxy target that has none.
    pub fn anchor(&mut self, pattern: &str) {
        let (to, base) = match self {
            Policy::Redirect(RedirectPolicy { to, base, .. }) => (to, base),
            Policy::Proxy(ProxyPolicy { to, base }) => (to, base),
            _ => return,
        };
        if to.is_some() && base.is_none() {
            *base = Some(pattern.to_string());
        }
    }
}

impl DeepMerge for Policy {
    fn merge_missing(&mut self, other: &Self) {
        match (self, other) {
            (Policy::Headers(mine), Policy::Headers(theirs)) => mine.merge_missing(theirs),
            (Policy::Redirect(mine), Policy::Redirect(theirs)) => mine.merge_missing(theirs),
            (Policy::Proxy(mine), Policy::Proxy(theirs)) => mine.merge_missing(theirs),
            (Policy::Cache(mine), Policy::Cache(theirs)) => mine.merge_missing(theirs),
            (Policy::Custom(mine), Policy::Custom(theirs)) => mine.merge_missing(theirs),
            // Differing kinds: the more specific definition stands.
            _ => {}
        }
    }
}

/// A named policy and the pattern that declared it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub policy: Policy,
    /// Pattern of the bundle this rule came from.
    pub route: String,
}

/// Every rule declared for one pattern.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleBundle {
    pub pattern: String,
    pub rules: Vec<Rule>,
}

impl RuleBundle {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            rules: Vec::new(),
        }
    }

    /// Add or replace the rule called `name`.
    pub fn with(mut self, name: impl Into<String>, policy: Policy) -> Self {
        let name = name.into();
        let rule = Rule {
            name: name.clone(),
            policy,
            route: self.pattern.clone(),
        };
        match self.rules.iter_mut().find(|r| r.name == name) {
            Some(existing) => *existing = rule,
            None => self.rules.push(rule),
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_headers_merge_keeps_specific_values() {
        let mut specific = HeadersPolicy {
            headers: BTreeMap::from([("x-a".to_string(), "specific".to_string())]),
        };
        let general = HeadersPolicy {
            headers: BTreeMap::from([
                ("x-a".to_string(), "general".to_string()),
                ("x-b".to_string(), "general".to_string()),
            ]),
        };
        specific.merge_missing(&general);
        assert_eq!(specific.headers["x-a"], "specific");
        assert_eq!(specific.headers["x-b"], "general");
    }

    #[test]
    fn test_cache_merge_fills_unset_fields() {
        let mut specific = Policy::Cache(CachePolicy {
            max_age: Some(60),
            ..Default::default()
        });
        let general = Policy::Cache(CachePolicy {
            max_age: Some(5),
            swr: Some(false),
            ..Default::default()
        });
        specific.merge_missing(&general);
        let Policy::Cache(merged) = specific else {
            panic!("kind changed");
        };
        assert_eq!(merged.max_age, Some(60));
        assert_eq!(merged.swr, Some(false));
    }

    #[test]
    fn test_disabled_cache_wins_over_general_cache() {
        let mut specific = Policy::CacheDisabled;
        specific.merge_missing(&Policy::Cache(CachePolicy::default()));
        assert_eq!(specific, Policy::CacheDisabled);

        let mut specific = Policy::Cache(CachePolicy::default());
        specific.merge_missing(&Policy::CacheDisabled);
        assert!(matches!(specific, Policy::Cache(_)));
    }

    #[test]
    fn test_custom_json_merges_recursively() {
        let mut specific = json!({"a": {"x": 1}, "list": [1]});
        specific.merge_missing(&json!({"a": {"x": 2, "y": 3}, "list": [2, 3], "b": true}));
        assert_eq!(specific, json!({"a": {"x": 1, "y": 3}, "list": [1], "b": true}));
    }

    #[test]
    fn test_cache_policy_to_options() {
        let defaults = CacheOptions {
            base: "/store".into(),
            ..Default::default()
        };
        let options = CachePolicy {
            max_age: Some(30),
            ..Default::default()
        }
        .to_options(&defaults);
        assert_eq!(options.max_age, 30);
        assert_eq!(options.group, "routes");
        assert_eq!(options.base, "/store");
        assert!(options.swr);
    }

    #[test]
    fn test_bundle_replaces_rule_with_same_name() {
        let bundle = RuleBundle::new("/api/**")
            .with("proxy", Policy::Proxy(ProxyPolicy { to: Some("http://a".into()), base: None }))
            .with("proxy", Policy::Proxy(ProxyPolicy { to: Some("http://b".into()), base: None }));
        assert_eq!(bundle.rules.len(), 1);
        assert_eq!(
            bundle.get("proxy").map(|r| &r.policy),
            Some(&Policy::Proxy(ProxyPolicy { to: Some("http://b".into()), base: None }))
        );
        assert_eq!(bundle.rules[0].route, "/api/**");
    }
}
