//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     Ctrl+C or trigger() → stop accepting → drain in-flight requests
//!     → flush deferred cache revalidations → exit
//! ```
//!
//! # Design Decisions
//! - Shutdown is a broadcast so any task can observe it
//! - Deferred work is drained with a deadline, then abandoned

pub mod shutdown;

pub use shutdown::Shutdown;
