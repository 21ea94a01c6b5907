//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request ID, tracing, timeout)
//!     → pipeline (middleware, route rules, handler)
//!     → handler.rs types (RequestHandler, Middleware, Next)
//!     → Send to client
//! ```

pub mod handler;
pub mod request;
pub mod server;

pub use handler::{HandlerError, HandlerRef, Middleware, Next, RequestHandler};
pub use request::X_REQUEST_ID;
pub use server::HttpServer;
