//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Registration (at startup or reload):
//!     Route<T>[]
//!     → pattern.rs (parse segments, rank specificity)
//!     → index.rs (build trie, dedupe by method + pattern)
//!     → router.rs (swap in as new snapshot)
//!
//! Incoming Request (method, path):
//!     → router.rs (load current snapshot)
//!     → compiler.rs (flat compiled matcher, built once per snapshot)
//!     → Return: RouteMatch (payload + params) or none
//! ```
//!
//! # Design Decisions
//! - Snapshots are immutable; changes require a full rebuild
//! - Specificity: literal > parameter > wildcard, left to right
//! - Match-all results are ordered least specific first
//! - Deterministic: same input always matches same route

pub mod compiler;
pub mod index;
pub mod pattern;
pub mod router;

pub use compiler::{compile, CompiledDispatch};
pub use index::{Route, RouteMatch, RouteTable};
pub use pattern::Params;
pub use router::{RouteSnapshot, Router};
