//! Route rules subsystem.
//!
//! # Data Flow
//! ```text
//! Config [[route_rules]] / programmatic bundles
//!     → policy.rs (typed policies per pattern)
//!     → resolver.rs (index patterns, cascade-merge per path)
//!     → registry.rs (merged rules → middleware chain)
//! ```
//!
//! # Design Decisions
//! - More specific patterns override less specific ones field by field
//! - Execution is pluggable: rule name → `PolicyFactory`

pub mod policy;
pub mod registry;
pub mod resolver;

pub use policy::{
    CachePolicy, DeepMerge, HeadersPolicy, Policy, ProxyPolicy, RedirectPolicy, Rule, RuleBundle,
};
pub use registry::{
    HandlerCacheRegistry, PolicyContext, PolicyFactory, PolicyRegistry, PolicyServices,
};
pub use resolver::{ResolvedRules, RuleResolver};
