//! Cascading route rule resolution.
//!
//! # Responsibilities
//! - Index rule bundles by pattern
//! - Collect every bundle covering a path
//! - Merge them so the most specific definition of each field wins
//!
//! # Data Flow
//! ```text
//! path
//!     → Router::snapshot().dispatch_all (least specific first)
//!     → reverse (most specific first)
//!     → merge_missing per rule name
//!     → ResolvedRules
//! ```

use std::sync::Arc;

use serde::Serialize;

use crate::routing::{Route, Router};
use crate::rules::policy::{CachePolicy, DeepMerge, Policy, Rule, RuleBundle};

/// The merged rules applying to one path.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResolvedRules {
    /// Rules in the order first seen walking most specific first.
    pub rules: Vec<Rule>,
}

impl ResolvedRules {
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    /// The effective cache policy, `None` when absent or disabled.
    pub fn cache(&self) -> Option<&CachePolicy> {
        match self.get("cache").map(|r| &r.policy) {
            Some(Policy::Cache(policy)) => Some(policy),
            _ => None,
        }
    }

    fn absorb(&mut self, rule: &Rule) {
        match self.rules.iter_mut().find(|r| r.name == rule.name) {
            Some(existing) => existing.policy.merge_missing(&rule.policy),
            None => self.rules.push(rule.clone()),
        }
    }
}

/// Resolves the cascaded rules for a path.
#[derive(Debug, Default)]
pub struct RuleResolver {
    router: Router<Arc<RuleBundle>>,
}

impl RuleResolver {
    pub fn new(bundles: Vec<RuleBundle>) -> Self {
        let resolver = Self::default();
        resolver.update(bundles);
        resolver
    }

    /// Replace every bundle. Bundles sharing a pattern are combined, later
    /// definitions taking precedence.
    pub fn update(&self, bundles: Vec<RuleBundle>) {
        let mut combined: Vec<RuleBundle> = Vec::with_capacity(bundles.len());
        for bundle in bundles {
            match combined.iter_mut().find(|b| b.pattern == bundle.pattern) {
                Some(existing) => {
                    for mut rule in bundle.rules {
                        match existing.rules.iter_mut().find(|r| r.name == rule.name) {
                            Some(earlier) => {
                                rule.policy.merge_missing(&earlier.policy);
                                *earlier = rule;
                            }
                            None => existing.rules.push(rule),
                        }
                    }
                }
                None => combined.push(bundle),
            }
        }

        let routes = combined
            .into_iter()
            .map(|mut bundle| {
                for rule in &mut bundle.rules {
                    rule.policy.anchor(&bundle.pattern);
                }
                Route::any(bundle.pattern.clone(), Arc::new(bundle))
            })
            .collect();
        self.router.update(routes);
    }

    /// Number of distinct patterns carrying rules.
    pub fn len(&self) -> usize {
        self.router.snapshot().table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merge every bundle whose pattern covers `path`.
    pub fn resolve(&self, path: &str) -> ResolvedRules {
        let matches = self.router.snapshot().dispatch_all("", path);
        let mut resolved = ResolvedRules::default();
        for matched in matches.iter().rev() {
            for rule in &matched.payload.rules {
                resolved.absorb(rule);
            }
        }
        tracing::trace!(path = %path, bundles = matches.len(), rules = resolved.rules.len(), "Resolved route rules");
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::policy::{HeadersPolicy, RedirectPolicy};
    use std::collections::BTreeMap;

    fn headers(pairs: &[(&str, &str)]) -> Policy {
        Policy::Headers(HeadersPolicy {
            headers: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        })
    }

    fn cache(max_age: u64) -> Policy {
        Policy::Cache(CachePolicy {
            max_age: Some(max_age),
            ..Default::default()
        })
    }

    #[test]
    fn test_most_specific_field_wins() {
        let resolver = RuleResolver::new(vec![
            RuleBundle::new("/**").with("headers", headers(&[("x-scope", "root"), ("x-root", "1")])),
            RuleBundle::new("/api/**").with("headers", headers(&[("x-scope", "api")])),
            RuleBundle::new("/api/users/:id").with("headers", headers(&[("x-scope", "user")])),
        ]);

        let resolved = resolver.resolve("/api/users/7");
        let Some(Policy::Headers(merged)) = resolved.get("headers").map(|r| &r.policy) else {
            panic!("headers missing");
        };
        assert_eq!(merged.headers["x-scope"], "user");
        assert_eq!(merged.headers["x-root"], "1");
        assert_eq!(resolved.get("headers").map(|r| r.route.as_str()), Some("/api/users/:id"));

        let resolved = resolver.resolve("/api/other");
        let Some(Policy::Headers(merged)) = resolved.get("headers").map(|r| &r.policy) else {
            panic!("headers missing");
        };
        assert_eq!(merged.headers["x-scope"], "api");
    }

    #[test]
    fn test_specific_cache_overrides_max_age() {
        let resolver = RuleResolver::new(vec![
            RuleBundle::new("/**").with("cache", cache(60)),
            RuleBundle::new("/api/**").with("cache", cache(5)),
        ]);
        assert_eq!(resolver.resolve("/api/x").cache().and_then(|c| c.max_age), Some(5));
        assert_eq!(resolver.resolve("/blog/x").cache().and_then(|c| c.max_age), Some(60));
    }

    #[test]
    fn test_disabled_cache_on_specific_pattern() {
        let resolver = RuleResolver::new(vec![
            RuleBundle::new("/**").with("cache", cache(60)),
            RuleBundle::new("/admin/**").with("cache", Policy::CacheDisabled),
        ]);
        assert!(resolver.resolve("/admin/panel").cache().is_none());
        assert!(resolver.resolve("/home").cache().is_some());
    }

    #[test]
    fn test_rules_order_and_determinism() {
        let resolver = RuleResolver::new(vec![
            RuleBundle::new("/**")
                .with("headers", headers(&[("x", "1")]))
                .with("feature", Policy::Custom(serde_json::json!({"beta": false}))),
            RuleBundle::new("/docs/**").with(
                "redirect",
                Policy::Redirect(RedirectPolicy {
                    to: Some("https://docs.example.com/**".into()),
                    ..Default::default()
                }),
            ),
        ]);
        let first = resolver.resolve("/docs/intro");
        let names: Vec<&str> = first.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["redirect", "headers", "feature"]);
        assert_eq!(first, resolver.resolve("/docs/intro"));
    }

    #[test]
    fn test_inherited_redirect_keeps_declaring_base() {
        let resolver = RuleResolver::new(vec![
            RuleBundle::new("/a/**").with(
                "redirect",
                Policy::Redirect(RedirectPolicy {
                    to: Some("/x/**".into()),
                    ..Default::default()
                }),
            ),
            RuleBundle::new("/a/b/**").with(
                "redirect",
                Policy::Redirect(RedirectPolicy {
                    status: Some(301),
                    ..Default::default()
                }),
            ),
        ]);
        let resolved = resolver.resolve("/a/b/c");
        assert_eq!(
            resolved.get("redirect").map(|r| &r.policy),
            Some(&Policy::Redirect(RedirectPolicy {
                to: Some("/x/**".into()),
                status: Some(301),
                base: Some("/a/**".into()),
            }))
        );
    }

    #[test]
    fn test_root_rules_apply_to_nested_paths() {
        let resolver = RuleResolver::new(vec![
            RuleBundle::new("/").with("headers", headers(&[("x-scope", "root"), ("x-root", "1")])),
            RuleBundle::new("/rules/**").with("headers", headers(&[("x-scope", "rules")])),
            RuleBundle::new("/rules/nested/**").with("headers", headers(&[("x-scope", "nested")])),
        ]);
        let resolved = resolver.resolve("/rules/nested/override");
        let Some(Policy::Headers(merged)) = resolved.get("headers").map(|r| &r.policy) else {
            panic!("headers missing");
        };
        assert_eq!(merged.headers["x-scope"], "nested");
        assert_eq!(merged.headers["x-root"], "1");
    }

    #[test]
    fn test_bundles_with_same_pattern_combine() {
        let resolver = RuleResolver::new(vec![
            RuleBundle::new("/api/**")
                .with("headers", headers(&[("x-a", "first"), ("x-b", "first")]))
                .with("cache", cache(10)),
            RuleBundle::new("/api/**").with("headers", headers(&[("x-a", "second")])),
        ]);
        assert_eq!(resolver.len(), 1);

        let resolved = resolver.resolve("/api/x");
        let Some(Policy::Headers(merged)) = resolved.get("headers").map(|r| &r.policy) else {
            panic!("headers missing");
        };
        assert_eq!(merged.headers["x-a"], "second");
        assert_eq!(merged.headers["x-b"], "first");
        assert_eq!(resolved.cache().and_then(|c| c.max_age), Some(10));
    }

    #[test]
    fn test_no_match_resolves_empty() {
        let resolver = RuleResolver::new(vec![RuleBundle::new("/api/**").with("cache", cache(1))]);
        assert!(resolver.resolve("/blog").is_empty());
        assert!(RuleResolver::default().resolve("/").is_empty());
    }

    #[test]
    fn test_update_replaces_bundles() {
        let resolver = RuleResolver::new(vec![RuleBundle::new("/**").with("cache", cache(1))]);
        assert_eq!(resolver.len(), 1);
        resolver.update(Vec::new());
        assert!(resolver.is_empty());
        assert!(resolver.resolve("/x").is_empty());
    }
}
