//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks against the handler catalog)
//!     → AppConfig (validated, immutable)
//!     → schema.rs normalizes route rule shorthands into RuleBundles
//!     → Pipeline::update
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → new AppConfig sent to the server
//!     → pipeline swaps in new routing snapshots
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AppConfig, CacheConfig, HandlerConfig, ListenerConfig, ObservabilityConfig, RouteRuleConfig,
    StorageDriver, TimeoutConfig,
};
pub use watcher::ConfigWatcher;
