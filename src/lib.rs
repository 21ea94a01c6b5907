//! Route-rule driven HTTP server with a stale-while-revalidate cache.

// Core subsystems
pub mod config;
pub mod http;
pub mod pipeline;
pub mod routing;
pub mod rules;

// Caching
pub mod cache;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use cache::{CacheOptions, CachedFunction, CachedHandler};
pub use config::schema::AppConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use pipeline::{HandlerCatalog, Pipeline, Registration};
pub use routing::Router;
